//! Integration tests for leaf federation
//!
//! An origin cluster and a leaf cluster joined by an in-memory link.

use knot_cluster::adapters::outbound::memory_stores;
use knot_cluster::domain::ports::{EntityStore, EntityStores};
use knot_cluster::replication::leaf::{
    channel_link, control_frame, decode_frame, encode_frame, serve_leaf, ChannelSink,
    ChannelStream, LeafClient, LeafClientConfig, LeafError, LeafMessageType, LeafSink,
    LeafStream, OriginState, RegisterResponse,
};
use knot_cluster::replication::{
    Cluster, HandlerRegistry, HybridClock, LoopbackNetwork, NodeId, Peer, ReplicationConfig,
};
use knot_cluster::{Group, Role, Space, Template, TemplateVar, User, Version, Versioned};
use std::sync::Arc;
use std::time::Duration;

const VERSION: Version = Version { major: 0, minor: 2 };

fn cluster(id: &str, zone: &str) -> (Cluster, EntityStores) {
    let network = LoopbackNetwork::new();
    let registry = Arc::new(HandlerRegistry::new());
    let transport = network.attach(Peer::new(id, zone), registry.clone());
    let stores = memory_stores();
    let cluster = Cluster::with_transport(
        ReplicationConfig::new(id).zone(zone),
        VERSION,
        stores.clone(),
        Arc::new(HybridClock::new(NodeId::new(id))),
        None,
        registry,
        Arc::new(transport),
    )
    .unwrap();
    (cluster, stores)
}

fn leaf_client(leaf: &Cluster, version: Version) -> Arc<LeafClient> {
    Arc::new(LeafClient::new(
        LeafClientConfig {
            origin_url: "https://origin.example.com".into(),
            token: "tok".into(),
            zone: "eu".into(),
            version,
            reconnect_delay: Duration::from_millis(10),
        },
        leaf.replicators().clone(),
    ))
}

/// Start an origin session and a leaf session over one in-memory link.
fn connect(
    origin: &Cluster,
    origin_stores: &EntityStores,
    client: Arc<LeafClient>,
    user: User,
) -> tokio::task::JoinHandle<Result<(), LeafError>> {
    let ((origin_stream, origin_sink), (mut leaf_stream, mut leaf_sink)) = channel_link();
    let state = Arc::new(OriginState {
        version: VERSION,
        stores: origin_stores.clone(),
        hub: origin.leaves().clone(),
    });
    tokio::spawn(async move {
        let _ = serve_leaf(state, user, origin_stream, origin_sink).await;
    });
    tokio::spawn(async move { client.run_session(&mut leaf_stream, &mut leaf_sink).await })
}

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

/// Start a leaf session against a scripted origin and accept its
/// registration. Returns the origin's ends of the link.
async fn accept_leaf(
    client: Arc<LeafClient>,
) -> (
    ChannelStream,
    ChannelSink,
    tokio::task::JoinHandle<Result<(), LeafError>>,
) {
    let ((mut origin_stream, mut origin_sink), (mut leaf_stream, mut leaf_sink)) = channel_link();
    let session =
        tokio::spawn(async move { client.run_session(&mut leaf_stream, &mut leaf_sink).await });

    let frame = origin_stream.recv().await.unwrap().unwrap();
    assert_eq!(decode_frame(&frame).unwrap().0, LeafMessageType::Register);
    origin_sink
        .send(encode_frame(LeafMessageType::Register, &RegisterResponse::ok()).unwrap())
        .await
        .unwrap();
    (origin_stream, origin_sink, session)
}

async fn next_frame_kind(stream: &mut ChannelStream) -> Option<LeafMessageType> {
    match tokio::time::timeout(Duration::from_millis(100), stream.recv()).await {
        Ok(Some(Ok(frame))) => Some(decode_frame(&frame).unwrap().0),
        _ => None,
    }
}

fn user(id: &str, origin: &Cluster) -> User {
    User {
        id: id.into(),
        username: id.into(),
        active: true,
        updated_at: origin.clock().now(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_leaf_receives_full_sync_snapshot() {
    let (origin, origin_stores) = cluster("origin", "eu");
    let (leaf, leaf_stores) = cluster("leaf", "eu");

    let ada = user("ada", &origin);
    let bob = user("bob", &origin);
    origin_stores.users.save(&ada).await.unwrap();
    origin_stores.users.save(&bob).await.unwrap();
    origin_stores
        .groups
        .save(&Group { id: "eng".into(), updated_at: origin.clock().now(), ..Default::default() })
        .await
        .unwrap();
    origin_stores
        .templates
        .save(&Template {
            id: "t1".into(),
            name: "ubuntu".into(),
            updated_at: origin.clock().now(),
            ..Default::default()
        })
        .await
        .unwrap();
    origin_stores
        .template_vars
        .save(&TemplateVar {
            id: "v1".into(),
            name: "TOKEN".into(),
            value: "secret".into(),
            restricted: true,
            updated_at: origin.clock().now(),
            ..Default::default()
        })
        .await
        .unwrap();
    origin_stores
        .spaces
        .save(&Space {
            id: "s1".into(),
            user_id: "ada".into(),
            updated_at: origin.clock().now(),
            ..Default::default()
        })
        .await
        .unwrap();

    let session = connect(&origin, &origin_stores, leaf_client(&leaf, VERSION), ada.clone());

    let templates = leaf_stores.templates.clone();
    assert!(
        eventually(|| {
            let store = templates.clone();
            async move { store.get("t1").await.unwrap().is_some() }
        })
        .await
    );

    let vars = leaf_stores.template_vars.clone();
    assert!(
        eventually(|| {
            let store = vars.clone();
            async move { store.get("v1").await.unwrap().is_some() }
        })
        .await
    );

    assert!(leaf_stores.groups.get("eng").await.unwrap().is_some());
    assert_eq!(leaf_stores.users.get("ada").await.unwrap(), Some(ada));
    assert!(leaf_stores.users.get("bob").await.unwrap().is_none());
    assert!(leaf_stores.spaces.get("s1").await.unwrap().is_none());

    // Origin-owned templates are marked managed on arrival.
    assert!(leaf_stores.templates.get("t1").await.unwrap().unwrap().is_managed);

    // Restricted values never reach the leaf.
    let var = leaf_stores.template_vars.get("v1").await.unwrap().unwrap();
    assert!(var.value.is_empty());
    assert!(var.is_deleted);

    session.abort();
    origin.stop().await;
    leaf.stop().await;
}

#[tokio::test]
async fn test_origin_changes_reach_connected_leaf() {
    let (origin, origin_stores) = cluster("origin", "eu");
    let (leaf, leaf_stores) = cluster("leaf", "eu");

    let ada = user("ada", &origin);
    origin_stores.users.save(&ada).await.unwrap();
    let session = connect(&origin, &origin_stores, leaf_client(&leaf, VERSION), ada.clone());

    let hub = origin.leaves().clone();
    assert!(eventually(|| {
        let hub = hub.clone();
        async move { hub.session_count() == 1 }
    })
    .await);

    let ops = Group { id: "ops".into(), updated_at: origin.clock().now(), ..Default::default() };
    origin_stores.groups.save(&ops).await.unwrap();
    origin.replicators().groups.gossip(&ops).await;

    let mut admins = Role { id: "r-ops".into(), name: "ops".into(), ..Default::default() };
    admins.stamp(origin.clock().now());
    origin.replicators().roles.gossip(&admins).await;

    let groups = leaf_stores.groups.clone();
    assert!(
        eventually(|| {
            let store = groups.clone();
            let expected = ops.clone();
            async move { store.get("ops").await.unwrap() == Some(expected) }
        })
        .await
    );
    let roles = leaf_stores.roles.clone();
    assert!(
        eventually(|| {
            let store = roles.clone();
            async move { store.get("r-ops").await.unwrap().is_some() }
        })
        .await
    );

    session.abort();
    origin.stop().await;
    leaf.stop().await;
}

#[tokio::test]
async fn test_version_mismatch_is_fatal_to_leaf() {
    let (origin, origin_stores) = cluster("origin", "eu");
    let (leaf, _) = cluster("leaf", "eu");

    let ada = user("ada", &origin);
    let session = connect(
        &origin,
        &origin_stores,
        leaf_client(&leaf, Version { major: 0, minor: 1 }),
        ada,
    );

    let result = tokio::time::timeout(Duration::from_secs(1), session)
        .await
        .expect("session ends")
        .unwrap();
    match result {
        Err(e) => assert!(e.is_fatal(), "unexpected error {}", e),
        Ok(()) => panic!("mismatched leaf was accepted"),
    }
    assert_eq!(origin.leaves().session_count(), 0);

    origin.stop().await;
    leaf.stop().await;
}

#[tokio::test]
async fn test_purge_origin_owned_keeps_local_records() {
    let (leaf, stores) = cluster("leaf", "eu");
    let now = leaf.clock().now();

    stores
        .roles
        .save(&Role { id: "r1".into(), updated_at: now, ..Default::default() })
        .await
        .unwrap();
    stores
        .groups
        .save(&Group { id: "g1".into(), updated_at: now, ..Default::default() })
        .await
        .unwrap();
    stores
        .templates
        .save(&Template { id: "managed".into(), is_managed: true, updated_at: now, ..Default::default() })
        .await
        .unwrap();
    stores
        .templates
        .save(&Template { id: "own".into(), updated_at: now, ..Default::default() })
        .await
        .unwrap();
    stores
        .spaces
        .save(&Space { id: "gone".into(), is_deleted: true, updated_at: now, ..Default::default() })
        .await
        .unwrap();
    stores
        .spaces
        .save(&Space { id: "live".into(), updated_at: now, ..Default::default() })
        .await
        .unwrap();

    leaf_client(&leaf, VERSION).purge_origin_owned().await;

    assert!(stores.roles.get_all().await.unwrap().is_empty());
    assert!(stores.groups.get_all().await.unwrap().is_empty());
    let templates: Vec<String> = stores
        .templates
        .get_all()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(templates, vec!["own".to_string()]);
    assert!(stores.spaces.get("gone").await.unwrap().is_none());
    assert!(stores.spaces.get("live").await.unwrap().is_some());

    leaf.stop().await;
}

#[tokio::test]
async fn test_bad_frame_from_origin_is_discarded() {
    let (leaf, stores) = cluster("leaf", "eu");
    let (mut origin_stream, mut origin_sink, session) =
        accept_leaf(leaf_client(&leaf, VERSION)).await;
    assert_eq!(next_frame_kind(&mut origin_stream).await, Some(LeafMessageType::FullSync));

    origin_sink
        .send(vec![9, 9, 9, LeafMessageType::GossipGroup as u8])
        .await
        .unwrap();
    origin_sink.send(vec![42]).await.unwrap();

    let eng = Group { id: "eng".into(), updated_at: leaf.clock().now(), ..Default::default() };
    origin_sink
        .send(encode_frame(LeafMessageType::GossipGroup, &vec![eng]).unwrap())
        .await
        .unwrap();

    let groups = stores.groups.clone();
    assert!(
        eventually(|| {
            let store = groups.clone();
            async move { store.get("eng").await.unwrap().is_some() }
        })
        .await
    );
    assert!(!session.is_finished());

    // Closing the link still ends the session.
    drop(origin_sink);
    let result = tokio::time::timeout(Duration::from_secs(1), session)
        .await
        .expect("session ends")
        .unwrap();
    assert!(matches!(result, Err(LeafError::Closed)));

    leaf.stop().await;
}

#[tokio::test]
async fn test_full_sync_requested_once_per_client() {
    let (leaf, stores) = cluster("leaf", "eu");
    let client = leaf_client(&leaf, VERSION);

    let (mut first_stream, first_sink, first) = accept_leaf(client.clone()).await;
    assert_eq!(next_frame_kind(&mut first_stream).await, Some(LeafMessageType::FullSync));
    drop(first_sink);
    let _ = tokio::time::timeout(Duration::from_secs(1), first).await;

    let (mut second_stream, mut second_sink, second) = accept_leaf(client).await;
    let ops = Group { id: "ops".into(), updated_at: leaf.clock().now(), ..Default::default() };
    second_sink
        .send(encode_frame(LeafMessageType::GossipGroup, &vec![ops]).unwrap())
        .await
        .unwrap();
    second_sink
        .send(control_frame(LeafMessageType::FullSyncEnd))
        .await
        .unwrap();

    let groups = stores.groups.clone();
    assert!(
        eventually(|| {
            let store = groups.clone();
            async move { store.get("ops").await.unwrap().is_some() }
        })
        .await
    );
    assert_eq!(next_frame_kind(&mut second_stream).await, None);

    second.abort();
    leaf.stop().await;
}
