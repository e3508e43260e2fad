//! Entity Replication Engine
//!
//! One `EntityReplicator<E>` per entity type provides immediate gossip,
//! periodic sampled gossip, the full-sync handshake and last-writer-wins
//! merge. Conflict resolution relies only on `updated_at`: a known record
//! is overwritten only by a strictly newer remote copy, and an unknown id
//! is always written, tombstone or not.

use crate::domain::ports::{
    EntityStore, MergeObserver, PeerTransport, StoreError, TransportError,
};
use crate::infrastructure::WorkQueue;
use crate::replication::codec::{take_within_budget, CodecError, PayloadCodec};
use crate::replication::dispatch::HandlerRegistry;
use crate::replication::entity::Replicated;
use crate::replication::leaf::LeafHub;
use crate::replication::types::{HybridClock, Message, Peer, Scope, Topic};
use rand::seq::SliceRandom;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

/// Shared runtime pieces every replicator needs.
#[derive(Clone)]
pub struct ReplicationContext {
    pub transport: Arc<dyn PeerTransport>,
    pub clock: Arc<HybridClock>,
    pub codec: PayloadCodec,
    pub leaves: Arc<LeafHub>,
    pub work_queue: Arc<WorkQueue>,
    pub payload_budget: usize,
}

/// Outcome of one merge call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl MergeReport {
    pub fn written(&self) -> usize {
        self.created + self.updated
    }
}

pub struct EntityReplicator<E: Replicated> {
    store: Arc<dyn EntityStore<E>>,
    observer: Option<Arc<dyn MergeObserver<E>>>,
    ctx: ReplicationContext,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Replicated> Clone for EntityReplicator<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            observer: self.observer.clone(),
            ctx: self.ctx.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: Replicated> EntityReplicator<E> {
    pub fn new(store: Arc<dyn EntityStore<E>>, ctx: ReplicationContext) -> Self {
        Self {
            store,
            observer: None,
            ctx,
            _entity: PhantomData,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn MergeObserver<E>>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &Arc<dyn EntityStore<E>> {
        &self.store
    }

    /// Wire up the gossip handler, the full-sync handler and the periodic round.
    pub fn register(&self, registry: &HandlerRegistry) {
        let this = self.clone();
        registry.handle_func(Topic::gossip(E::KIND), move |from, payload| {
            let this = this.clone();
            async move { this.handle_gossip(&from, &payload).await }
        });

        let this = self.clone();
        registry.handle_func_with_reply(Topic::full_sync(E::KIND), move |from, payload| {
            let this = this.clone();
            async move { this.handle_full_sync(&from, &payload).await }
        });

        let this = self.clone();
        registry.handle_gossip_func(E::KIND.as_str(), move || {
            let this = this.clone();
            async move { this.gossip_sample().await }
        });
    }

    /// Mesh peers this entity type travels to.
    fn targets(&self) -> Vec<Peer> {
        match E::SCOPE {
            Scope::Cluster => self.ctx.transport.peers(),
            Scope::Zone => self.ctx.transport.zone_peers(),
        }
    }

    fn accepts_from(&self, from: &Peer) -> bool {
        match E::SCOPE {
            Scope::Cluster => true,
            Scope::Zone => from.same_zone(&self.ctx.transport.local().zone),
        }
    }

    /// Broadcast one record right after a local write.
    pub async fn gossip(&self, entity: &E) {
        if !entity.replicable() {
            return;
        }

        let targets = self.targets();
        if !targets.is_empty() {
            match self.ctx.codec.encode(std::slice::from_ref(&entity.peer_view())) {
                Ok(payload) => {
                    let sent = self
                        .ctx
                        .transport
                        .send(&targets, Message::new(Topic::gossip(E::KIND), payload))
                        .await;
                    tracing::debug!("gossiped {} {} to {} peers", E::KIND, entity.id(), sent);
                }
                Err(e) => tracing::error!("failed to encode {} {}: {}", E::KIND, entity.id(), e),
            }
        }

        self.ctx.leaves.fan_out(std::slice::from_ref(entity));
    }

    /// Merge a batch gossiped by a peer, then forward it to attached leaves.
    pub async fn handle_gossip(&self, from: &Peer, payload: &[u8]) {
        if !self.accepts_from(from) {
            tracing::warn!("ignoring {} gossip from {} outside zone", E::KIND, from);
            return;
        }

        let batch: Vec<E> = match self.ctx.codec.decode(payload) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("discarding {} gossip from {}: {}", E::KIND, from, e);
                return;
            }
        };

        let report = self.merge(batch.clone()).await;
        tracing::debug!("{} gossip from {}: {:?}", E::KIND, from, report);

        self.ctx.leaves.fan_out(&batch);
    }

    /// Answer a full-sync request with the local dataset and merge the
    /// sender's dataset in the background.
    ///
    /// The reply never reflects the dataset just received: the merge is
    /// queued after the local read.
    pub async fn handle_full_sync(
        &self,
        from: &Peer,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        if !self.accepts_from(from) {
            tracing::warn!("refusing {} full sync from {} outside zone", E::KIND, from);
            return self
                .ctx
                .codec
                .encode::<E>(&[])
                .map_err(|e| TransportError::Codec(e.to_string()));
        }

        let remote: Vec<E> = self
            .ctx
            .codec
            .decode(payload)
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        let local = self
            .outbound_dataset()
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let reply = self
            .ctx
            .codec
            .encode(&local)
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        let this = self.clone();
        let sender = from.clone();
        let queued = self.ctx.work_queue.submit(async move {
            let report = this.merge(remote).await;
            tracing::debug!("{} full sync from {} merged: {:?}", E::KIND, sender, report);
        });
        if !queued {
            tracing::warn!("dropped {} full-sync merge from {}", E::KIND, from);
        }

        Ok(reply)
    }

    /// Exchange full datasets with `peer` and merge its answer.
    pub async fn do_full_sync(&self, peer: &Peer) -> Result<MergeReport, ReplicationError> {
        let local = self.outbound_dataset().await?;
        let payload = self.ctx.codec.encode(&local)?;

        let response = self
            .ctx
            .transport
            .send_to_with_response(peer, Message::new(Topic::full_sync(E::KIND), payload))
            .await?;

        let remote: Vec<E> = self.ctx.codec.decode(&response)?;
        let report = self.merge(remote).await;
        tracing::info!(
            "{} full sync with {}: {} created, {} updated",
            E::KIND,
            peer,
            report.created,
            report.updated
        );
        Ok(report)
    }

    /// Apply a remote batch with last-writer-wins semantics.
    pub async fn merge(&self, batch: Vec<E>) -> MergeReport {
        let mut report = MergeReport::default();

        for remote in batch {
            if !remote.replicable() {
                report.skipped += 1;
                continue;
            }
            self.ctx.clock.observe(remote.updated_at());

            let local = match self.store.get(remote.id()).await {
                Ok(local) => local,
                Err(e) => {
                    tracing::error!("failed to read {} {}: {}", E::KIND, remote.id(), e);
                    report.failed += 1;
                    continue;
                }
            };

            let previous = match local {
                Some(local) if remote.updated_at() > local.updated_at() => Some(local),
                Some(_) => {
                    report.skipped += 1;
                    continue;
                }
                None => None,
            };

            if let Err(e) = self.store.save(&remote).await {
                tracing::error!("failed to save {} {}: {}", E::KIND, remote.id(), e);
                report.failed += 1;
                continue;
            }

            if previous.is_some() {
                report.updated += 1;
            } else {
                report.created += 1;
            }

            if let Some(observer) = &self.observer {
                observer.merged(previous, &remote).await;
            }
        }

        report
    }

    /// One periodic round: a shuffled, budget-bounded sample of local state.
    pub async fn gossip_sample(&self) {
        let targets = self.targets();
        if targets.is_empty() {
            return;
        }

        let mut records = match self.outbound_dataset().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("failed to read {} for gossip: {}", E::KIND, e);
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        records.shuffle(&mut rand::thread_rng());
        let batch = take_within_budget(records, self.ctx.payload_budget);
        if batch.is_empty() {
            return;
        }

        match self.ctx.codec.encode(&batch) {
            Ok(payload) => {
                self.ctx
                    .transport
                    .send(&targets, Message::new(Topic::gossip(E::KIND), payload))
                    .await;
            }
            Err(e) => tracing::error!("failed to encode {} gossip round: {}", E::KIND, e),
        }
    }

    /// Physically remove tombstones older than `retention`.
    pub async fn purge_tombstones(&self, retention: Duration) -> usize {
        let records = match self.store.get_all().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("failed to read {} for tombstone gc: {}", E::KIND, e);
                return 0;
            }
        };

        let mut purged = 0;
        for record in records
            .into_iter()
            .filter(|r| r.is_deleted() && r.updated_at().age() > retention)
        {
            match self.store.delete(&record).await {
                Ok(()) => purged += 1,
                Err(e) => tracing::error!("failed to purge {} {}: {}", E::KIND, record.id(), e),
            }
        }

        if purged > 0 {
            tracing::info!("purged {} {} tombstones", purged, E::KIND);
        }
        purged
    }

    /// Local records in the form they may leave this node.
    async fn outbound_dataset(&self) -> Result<Vec<E>, StoreError> {
        Ok(self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|e| e.replicable())
            .map(|e| e.peer_view())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::DashMapEntityStore;
    use crate::domain::entities::{Group, Role, Session, TemplateVar, Versioned};
    use crate::replication::loopback::LoopbackNetwork;
    use crate::replication::types::{HLCTimestamp, NodeId};
    use crate::infrastructure::RetryPolicy;

    fn ts(wall_time: u64) -> HLCTimestamp {
        HLCTimestamp { wall_time, counter: 0, node_hash: 0 }
    }

    fn group(id: &str, name: &str, at: u64) -> Group {
        Group { id: id.into(), name: name.into(), updated_at: ts(at), ..Default::default() }
    }

    struct Node<E: Replicated> {
        replicator: EntityReplicator<E>,
        store: Arc<DashMapEntityStore<E>>,
        work_queue: Arc<WorkQueue>,
    }

    fn node<E: Replicated>(network: &Arc<LoopbackNetwork>, id: &str, zone: &str) -> Node<E> {
        let registry = Arc::new(HandlerRegistry::new());
        let transport = network.attach(Peer::new(id, zone), registry.clone());
        let store = Arc::new(DashMapEntityStore::<E>::new());
        let work_queue = Arc::new(WorkQueue::new("merge", 64, 1));
        let ctx = ReplicationContext {
            transport: Arc::new(transport),
            clock: Arc::new(HybridClock::new(NodeId::new(id))),
            codec: PayloadCodec::default(),
            leaves: Arc::new(LeafHub::new(RetryPolicy::default())),
            work_queue: work_queue.clone(),
            payload_budget: 64 * 1024,
        };
        let replicator = EntityReplicator::new(store.clone(), ctx);
        replicator.register(&registry);
        Node { replicator, store, work_queue }
    }

    #[tokio::test]
    async fn test_merge_creates_unknown_records() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");

        let report = a.replicator.merge(vec![group("g1", "eng", 1)]).await;
        assert_eq!(report.created, 1);
        assert_eq!(a.store.get("g1").await.unwrap().unwrap().name, "eng");
    }

    #[tokio::test]
    async fn test_merge_creates_unknown_tombstones() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");

        let mut gone = group("g1", "eng", 1);
        gone.tombstone(ts(2));
        a.replicator.merge(vec![gone]).await;

        let stored = a.store.get("g1").await.unwrap().unwrap();
        assert!(stored.is_deleted);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");
        let batch = vec![group("g1", "eng", 1), group("g2", "ops", 2)];

        let first = a.replicator.merge(batch.clone()).await;
        let snapshot = {
            let mut all = a.store.get_all().await.unwrap();
            all.sort_by(|x, y| x.id.cmp(&y.id));
            all
        };
        let second = a.replicator.merge(batch).await;
        let mut after = a.store.get_all().await.unwrap();
        after.sort_by(|x, y| x.id.cmp(&y.id));

        assert_eq!(first.created, 2);
        assert_eq!(second.written(), 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(snapshot, after);
    }

    #[tokio::test]
    async fn test_merge_is_monotonic_in_either_order() {
        let older = group("g1", "old", 1);
        let newer = group("g1", "new", 2);

        for batch in [vec![older.clone(), newer.clone()], vec![newer.clone(), older.clone()]] {
            let network = LoopbackNetwork::new();
            let a = node::<Group>(&network, "a", "eu");
            a.replicator.merge(batch).await;
            assert_eq!(a.store.get("g1").await.unwrap().unwrap(), newer);
        }
    }

    #[tokio::test]
    async fn test_equal_timestamps_never_write() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");
        a.store.save(&group("g1", "local", 5)).await.unwrap();

        let report = a.replicator.merge(vec![group("g1", "remote", 5)]).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(a.store.get("g1").await.unwrap().unwrap().name, "local");
    }

    #[tokio::test]
    async fn test_stale_copy_does_not_resurrect_tombstone() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");

        let mut dead = group("g1", "eng", 1);
        dead.tombstone(ts(2));
        a.store.save(&dead).await.unwrap();

        a.replicator.merge(vec![group("g1", "eng", 1)]).await;
        assert!(a.store.get("g1").await.unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_merge_advances_local_clock() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");
        let far_future = u64::MAX / 2;

        a.replicator.merge(vec![group("g1", "eng", far_future)]).await;
        assert!(a.replicator.ctx.clock.now().wall_time >= far_future);
    }

    #[tokio::test]
    async fn test_builtin_admin_role_is_never_merged() {
        let network = LoopbackNetwork::new();
        let a = node::<Role>(&network, "a", "eu");

        let report = a.replicator.merge(vec![Role::admin()]).await;
        assert_eq!(report.skipped, 1);
        assert!(a.store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gossip_reaches_peer() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");
        let b = node::<Group>(&network, "b", "us");

        a.replicator.gossip(&group("g1", "eng", 1)).await;
        assert_eq!(b.store.get("g1").await.unwrap().unwrap().name, "eng");
    }

    #[tokio::test]
    async fn test_local_var_gossiped_as_scrubbed_tombstone() {
        let network = LoopbackNetwork::new();
        let a = node::<TemplateVar>(&network, "a", "eu");
        let b = node::<TemplateVar>(&network, "b", "eu");

        let var = TemplateVar {
            id: "v1".into(),
            name: "TOKEN".into(),
            value: "secret".into(),
            local: true,
            updated_at: ts(1),
            ..Default::default()
        };
        a.store.save(&var).await.unwrap();
        a.replicator.gossip(&var).await;

        let seen = b.store.get("v1").await.unwrap().unwrap();
        assert!(seen.is_deleted);
        assert!(seen.value.is_empty());
        assert_eq!(seen.name, "v1");
    }

    #[tokio::test]
    async fn test_zone_scoped_gossip_stays_in_zone() {
        let network = LoopbackNetwork::new();
        let a = node::<Session>(&network, "a", "eu");
        let b = node::<Session>(&network, "b", "eu");
        let c = node::<Session>(&network, "c", "us");

        let session = Session { id: "s1".into(), updated_at: ts(1), ..Default::default() };
        a.replicator.gossip(&session).await;

        assert!(b.store.get("s1").await.unwrap().is_some());
        assert!(c.store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zone_scoped_gossip_from_other_zone_is_ignored() {
        let network = LoopbackNetwork::new();
        let a = node::<Session>(&network, "a", "eu");

        let session = Session { id: "s1".into(), updated_at: ts(1), ..Default::default() };
        let payload = PayloadCodec::default().encode(&[session]).unwrap();
        a.replicator.handle_gossip(&Peer::new("x", "us"), &payload).await;

        assert!(a.store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_gossip_is_discarded() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");
        a.replicator.handle_gossip(&Peer::new("b", "eu"), &[0, 9, 9, 9]).await;
        assert!(a.store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_sync_exchanges_both_directions() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");
        let b = node::<Group>(&network, "b", "eu");
        a.store.save(&group("g1", "eng", 1)).await.unwrap();
        b.store.save(&group("g2", "ops", 1)).await.unwrap();

        let report = b.replicator.do_full_sync(&Peer::new("a", "eu")).await.unwrap();
        assert_eq!(report.created, 1);
        assert!(b.store.get("g1").await.unwrap().is_some());

        // A merges B's dataset in the background.
        assert!(a.work_queue.shutdown(Duration::from_secs(1)).await);
        assert!(a.store.get("g2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_sync_reply_does_not_include_just_received_data() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");

        let payload = PayloadCodec::default().encode(&[group("g9", "new", 1)]).unwrap();
        let reply = a.replicator.handle_full_sync(&Peer::new("b", "eu"), &payload).await.unwrap();
        let returned: Vec<Group> = PayloadCodec::default().decode(&reply).unwrap();
        assert!(returned.is_empty());
    }

    #[tokio::test]
    async fn test_full_sync_with_unreachable_peer_errors() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");
        let result = a.replicator.do_full_sync(&Peer::new("ghost", "eu")).await;
        assert!(matches!(result, Err(ReplicationError::Transport(_))));
    }

    #[tokio::test]
    async fn test_gossip_sample_respects_budget() {
        let network = LoopbackNetwork::new();
        let mut a = node::<Group>(&network, "a", "eu");
        let b = node::<Group>(&network, "b", "eu");
        a.replicator.ctx.payload_budget = 2048;

        for i in 0..500 {
            a.store.save(&group(&format!("g{}", i), "team", 1)).await.unwrap();
        }

        a.replicator.gossip_sample().await;
        let received = b.store.get_all().await.unwrap().len();
        assert!(received > 0);
        assert!(received < 500);
    }

    #[tokio::test]
    async fn test_purge_tombstones_respects_retention() {
        let network = LoopbackNetwork::new();
        let a = node::<Group>(&network, "a", "eu");

        let mut old = group("old", "x", 1);
        old.is_deleted = true;
        let mut fresh = group("fresh", "y", 0);
        fresh.tombstone(HLCTimestamp::now(&NodeId::new("a")));
        let alive = group("alive", "z", 1);
        for g in [&old, &fresh, &alive] {
            a.store.save(g).await.unwrap();
        }

        let purged = a.replicator.purge_tombstones(Duration::from_secs(3600)).await;
        assert_eq!(purged, 1);
        assert!(a.store.get("old").await.unwrap().is_none());
        assert!(a.store.get("fresh").await.unwrap().is_some());
        assert!(a.store.get("alive").await.unwrap().is_some());
    }
}
