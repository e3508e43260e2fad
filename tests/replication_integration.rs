//! Integration tests for the replication core
//!
//! Whole clusters running on the in-process loopback network.

use async_trait::async_trait;
use knot_cluster::adapters::outbound::{memory_stores, DashMapEntityStore, DashMapRoleCache};
use knot_cluster::domain::ports::{EntityStore, EntityStores, PeerTransport, TransportError};
use knot_cluster::domain::services::{EntityEvent, EntityLifecycle};
use knot_cluster::infrastructure::{RetryPolicy, WorkQueue};
use knot_cluster::replication::leaf::LeafHub;
use knot_cluster::replication::{
    Cluster, EntityKind, EntityReplicator, HandlerRegistry, HybridClock, LoopbackNetwork, Message,
    NodeId, PayloadCodec, Peer, ReplicationConfig, ReplicationContext,
};
use knot_cluster::{Group, Space, TemplateVar, User, Version, Versioned};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Node {
    cluster: Cluster,
    stores: EntityStores,
}

fn node(network: &Arc<LoopbackNetwork>, id: &str, zone: &str) -> Node {
    node_with_lifecycle(network, id, zone, false).0
}

fn node_with_lifecycle(
    network: &Arc<LoopbackNetwork>,
    id: &str,
    zone: &str,
    with_lifecycle: bool,
) -> (Node, Option<Arc<EntityLifecycle>>) {
    let registry = Arc::new(HandlerRegistry::new());
    let transport = network.attach(Peer::new(id, zone), registry.clone());
    let stores = memory_stores();
    let clock = Arc::new(HybridClock::new(NodeId::new(id)));
    let lifecycle = with_lifecycle.then(|| {
        Arc::new(EntityLifecycle::new(
            stores.clone(),
            Arc::new(DashMapRoleCache::new()),
            clock.clone(),
        ))
    });

    let cluster = Cluster::with_transport(
        ReplicationConfig::new(id).zone(zone),
        Version { major: 0, minor: 2 },
        stores.clone(),
        clock,
        lifecycle.clone(),
        registry,
        Arc::new(transport),
    )
    .unwrap();
    (Node { cluster, stores }, lifecycle)
}

/// Poll `check` until it holds or a second passes.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_delete_survives_full_sync_with_stale_node() {
    let network = LoopbackNetwork::new();
    let a = node(&network, "a", "eu");
    let b = node(&network, "b", "eu");
    let c = node(&network, "c", "eu");

    // A creates "eng" at t1; C holds a copy of that version.
    let eng = Group {
        id: "eng".into(),
        name: "eng".into(),
        updated_at: a.cluster.clock().now(),
        ..Default::default()
    };
    a.stores.groups.save(&eng).await.unwrap();
    c.stores.groups.save(&eng).await.unwrap();

    // B, previously empty, pulls it from A.
    let a_peer = Peer::new("a", "eu");
    let written = b
        .cluster
        .replicators()
        .full_sync(EntityKind::Group, &a_peer)
        .await
        .unwrap();
    assert_eq!(written, 1);
    assert_eq!(b.stores.groups.get("eng").await.unwrap(), Some(eng.clone()));

    // B deletes it at t2 > t1 and gossips the tombstone while C is away.
    network.set_online(&NodeId::new("c"), false);
    let mut deleted = b.stores.groups.get("eng").await.unwrap().unwrap();
    deleted.tombstone(b.cluster.clock().now());
    assert!(deleted.updated_at > eng.updated_at);
    b.stores.groups.save(&deleted).await.unwrap();
    b.cluster.replicators().groups.gossip(&deleted).await;

    assert!(a.stores.groups.get("eng").await.unwrap().unwrap().is_deleted);
    assert!(!c.stores.groups.get("eng").await.unwrap().unwrap().is_deleted);
    network.set_online(&NodeId::new("c"), true);

    // A syncs with C, which still has the t1 copy: no resurrection.
    let c_peer = Peer::new("c", "eu");
    a.cluster
        .replicators()
        .full_sync(EntityKind::Group, &c_peer)
        .await
        .unwrap();
    let on_a = a.stores.groups.get("eng").await.unwrap().unwrap();
    assert!(on_a.is_deleted);
    assert_eq!(on_a.updated_at, deleted.updated_at);

    // C merges A's tombstone in the background.
    let c_groups = c.stores.groups.clone();
    assert!(
        eventually(|| {
            let store = c_groups.clone();
            async move { store.get("eng").await.unwrap().unwrap().is_deleted }
        })
        .await
    );

    a.cluster.stop().await;
    b.cluster.stop().await;
    c.cluster.stop().await;
}

#[tokio::test]
async fn test_repeated_gossip_is_idempotent() {
    let network = LoopbackNetwork::new();
    let a = node(&network, "a", "eu");
    let b = node(&network, "b", "eu");

    let user = User {
        id: "u1".into(),
        username: "ada".into(),
        updated_at: a.cluster.clock().now(),
        ..Default::default()
    };
    a.stores.users.save(&user).await.unwrap();

    a.cluster.replicators().users.gossip(&user).await;
    let once = b.stores.users.get_all().await.unwrap();
    a.cluster.replicators().users.gossip(&user).await;
    let twice = b.stores.users.get_all().await.unwrap();

    assert_eq!(once, vec![user]);
    assert_eq!(once, twice);

    a.cluster.stop().await;
    b.cluster.stop().await;
}

#[tokio::test]
async fn test_local_template_var_never_leaves_node_with_value() {
    let network = LoopbackNetwork::new();
    let a = node(&network, "a", "eu");
    let b = node(&network, "b", "eu");

    let secret = TemplateVar {
        id: "v1".into(),
        name: "DB_PASSWORD".into(),
        value: "hunter2".into(),
        local: true,
        updated_at: a.cluster.clock().now(),
        ..Default::default()
    };
    a.stores.template_vars.save(&secret).await.unwrap();

    // First gossip after creation.
    a.cluster.replicators().template_vars.gossip(&secret).await;
    let seen = b.stores.template_vars.get("v1").await.unwrap().unwrap();
    assert!(seen.is_deleted);
    assert!(seen.value.is_empty());
    assert_eq!(seen.name, "v1");

    // Full sync in the other direction.
    let c = node(&network, "c", "eu");
    c.cluster
        .replicators()
        .full_sync(EntityKind::TemplateVar, &Peer::new("a", "eu"))
        .await
        .unwrap();
    let pulled = c.stores.template_vars.get("v1").await.unwrap().unwrap();
    assert!(pulled.value.is_empty());

    // The origin node keeps its real value.
    let local = a.stores.template_vars.get("v1").await.unwrap().unwrap();
    assert_eq!(local.value, "hunter2");

    a.cluster.stop().await;
    b.cluster.stop().await;
    c.cluster.stop().await;
}

#[tokio::test]
async fn test_locks_stay_in_zone() {
    let network = LoopbackNetwork::new();
    let eu1 = node(&network, "eu-1", "eu");
    let eu2 = node(&network, "eu-2", "eu");
    let us1 = node(&network, "us-1", "us");

    let token = eu1
        .cluster
        .locks()
        .lock("volume-7", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(eu2.cluster.locks().is_locked("volume-7"));
    assert!(!us1.cluster.locks().is_locked("volume-7"));

    // A full sync from another zone learns nothing.
    let written = us1
        .cluster
        .replicators()
        .full_sync(EntityKind::ResourceLock, &Peer::new("eu-1", "eu"))
        .await
        .unwrap();
    assert_eq!(written, 0);
    assert!(!us1.cluster.locks().is_locked("volume-7"));

    eu1.cluster.locks().unlock("volume-7", &token).await.unwrap();
    assert!(!eu2.cluster.locks().is_locked("volume-7"));

    eu1.cluster.stop().await;
    eu2.cluster.stop().await;
    us1.cluster.stop().await;
}

#[tokio::test]
async fn test_remote_user_delete_runs_side_effects() {
    let network = LoopbackNetwork::new();
    let a = node(&network, "a", "eu");
    let (b, lifecycle) = node_with_lifecycle(&network, "b", "eu", true);
    let mut events = lifecycle.unwrap().subscribe();

    let user = User {
        id: "u1".into(),
        active: true,
        updated_at: a.cluster.clock().now(),
        ..Default::default()
    };
    let space = Space {
        id: "s1".into(),
        user_id: "u1".into(),
        zone: "eu".into(),
        updated_at: a.cluster.clock().now(),
        ..Default::default()
    };
    a.cluster.replicators().users.gossip(&user).await;
    a.cluster.replicators().spaces.gossip(&space).await;
    assert!(b.stores.spaces.get("s1").await.unwrap().is_some());

    let mut deleted = user.clone();
    deleted.tombstone(a.cluster.clock().now());
    a.cluster.replicators().users.gossip(&deleted).await;

    assert!(b.stores.users.get("u1").await.unwrap().unwrap().is_deleted);
    assert!(b.stores.spaces.get("s1").await.unwrap().unwrap().is_deleted);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert!(received.contains(&EntityEvent::UserDeleted { user_id: "u1".into() }));
    assert!(received.contains(&EntityEvent::SpaceStopRequested {
        space_id: "s1".into(),
        zone: "eu".into()
    }));

    a.cluster.stop().await;
    b.cluster.stop().await;
}

/// Records every broadcast instead of delivering it.
struct RecordingTransport {
    local: Peer,
    peers: Vec<Peer>,
    sent: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    fn local(&self) -> &Peer {
        &self.local
    }

    fn peers(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    async fn send(&self, peers: &[Peer], message: Message) -> usize {
        self.sent.lock().push(message.payload);
        peers.len()
    }

    async fn send_to_with_response(
        &self,
        peer: &Peer,
        _message: Message,
    ) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unreachable(peer.to_string()))
    }
}

#[tokio::test]
async fn test_gossip_rounds_stay_within_budget() {
    const RECORDS: usize = 10_000;
    const BUDGET: usize = 64 * 1024;

    let transport = Arc::new(RecordingTransport {
        local: Peer::new("a", "eu"),
        peers: vec![Peer::new("b", "eu")],
        sent: Mutex::new(Vec::new()),
    });
    let store = Arc::new(DashMapEntityStore::<Group>::new());
    let clock = Arc::new(HybridClock::new(NodeId::new("a")));
    for i in 0..RECORDS {
        let group = Group {
            id: format!("g-{:05}", i),
            updated_at: clock.now(),
            ..Default::default()
        };
        store.save(&group).await.unwrap();
    }

    let replicator = EntityReplicator::new(
        store.clone(),
        ReplicationContext {
            transport: transport.clone(),
            clock,
            codec: PayloadCodec::new(false),
            leaves: Arc::new(LeafHub::new(RetryPolicy::default())),
            work_queue: Arc::new(WorkQueue::new("merge", 16, 1)),
            payload_budget: BUDGET,
        },
    );

    let mut covered = HashSet::new();
    let mut rounds = 0;
    while covered.len() < RECORDS && rounds < 2_000 {
        replicator.gossip_sample().await;
        rounds += 1;

        let payload = transport.sent.lock().pop().unwrap();
        assert!(payload.len() <= BUDGET, "round {} sent {} bytes", rounds, payload.len());
        let batch: Vec<Group> = PayloadCodec::new(false).decode(&payload).unwrap();
        assert!(!batch.is_empty());
        assert!(batch.len() < RECORDS);
        covered.extend(batch.into_iter().map(|g| g.id));
    }

    assert_eq!(covered.len(), RECORDS);
    assert!(rounds > 1);
}
