//! Leaf side of leaf federation
//!
//! A leaf follows one origin. On start it drops its copies of every
//! origin-owned class of record, then keeps a session open to the origin,
//! reconnecting after a fixed delay whenever the link fails. Records pushed
//! by the origin go through the same merge path as mesh gossip.

use crate::adapters::outbound::connect_origin;
use crate::domain::entities::Versioned;
use crate::domain::ports::EntityStore;
use crate::domain::value_objects::Version;
use crate::replication::cluster::Replicators;
use crate::replication::engine::EntityReplicator;
use crate::replication::entity::Replicated;
use crate::replication::leaf::protocol::{
    control_frame, decode_frame, decode_payload, encode_frame, LeafError, LeafMessageType,
    Register, RegisterResponse,
};
use crate::replication::leaf::session::{LeafSink, LeafStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct LeafClientConfig {
    pub origin_url: String,
    pub token: String,
    pub zone: String,
    pub version: Version,
    pub reconnect_delay: Duration,
}

pub struct LeafClient {
    config: LeafClientConfig,
    replicators: Arc<Replicators>,
    full_sync_requested: AtomicBool,
}

impl LeafClient {
    pub fn new(config: LeafClientConfig, replicators: Arc<Replicators>) -> Self {
        Self {
            config,
            replicators,
            full_sync_requested: AtomicBool::new(false),
        }
    }

    /// Follow the origin until shutdown or a fatal error.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), LeafError> {
        self.purge_origin_owned().await;

        loop {
            let attempt = async {
                let (mut stream, mut sink) =
                    connect_origin(&self.config.origin_url, &self.config.token).await?;
                let result = self.run_session(&mut stream, &mut sink).await;
                sink.close().await;
                result
            };

            let result = tokio::select! {
                result = attempt => result,
                _ = shutdown.recv() => {
                    tracing::info!("leaf client stopping");
                    return Ok(());
                }
            };

            match result {
                Err(e) if e.is_fatal() => {
                    tracing::error!("origin refused this leaf: {}", e);
                    return Err(e);
                }
                Err(e) => tracing::warn!("origin link lost: {}", e),
                Ok(()) => tracing::info!("origin closed the link"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.recv() => {
                    tracing::info!("leaf client stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Run one session over an established link until it fails.
    pub async fn run_session<S, K>(&self, stream: &mut S, sink: &mut K) -> Result<(), LeafError>
    where
        S: LeafStream,
        K: LeafSink,
    {
        let register = Register {
            leaf_version: self.config.version.to_string(),
            zone: self.config.zone.clone(),
        };
        sink.send(encode_frame(LeafMessageType::Register, &register)?)
            .await?;

        let frame = stream.recv().await.ok_or(LeafError::Closed)??;
        let (kind, payload) = decode_frame(&frame)?;
        if kind != LeafMessageType::Register {
            return Err(LeafError::Unexpected(kind));
        }
        let response: RegisterResponse = decode_payload(payload)?;
        if !response.success {
            return Err(LeafError::VersionMismatch(response.error));
        }
        tracing::info!("registered with origin {}", self.config.origin_url);

        if !self.full_sync_requested.swap(true, Ordering::SeqCst) {
            sink.send(control_frame(LeafMessageType::FullSync)).await?;
        }

        loop {
            let frame = stream.recv().await.ok_or(LeafError::Closed)??;
            if let Err(e) = self.handle_frame(&frame).await {
                tracing::warn!("discarding frame from origin: {}", e);
            }
        }
    }

    /// Merge one frame. Errors here affect that frame only.
    async fn handle_frame(&self, frame: &[u8]) -> Result<(), LeafError> {
        let (kind, payload) = decode_frame(frame)?;
        let r = &self.replicators;
        match kind {
            LeafMessageType::GossipGroup => merge_from_origin(&r.groups, payload).await,
            LeafMessageType::GossipRole => merge_from_origin(&r.roles, payload).await,
            LeafMessageType::GossipUser => merge_from_origin(&r.users, payload).await,
            LeafMessageType::GossipTemplate => merge_from_origin(&r.templates, payload).await,
            LeafMessageType::GossipTemplateVar => {
                merge_from_origin(&r.template_vars, payload).await
            }
            LeafMessageType::GossipScript => merge_from_origin(&r.scripts, payload).await,
            LeafMessageType::GossipResponse => merge_from_origin(&r.responses, payload).await,
            LeafMessageType::GossipSession => merge_from_origin(&r.sessions, payload).await,
            LeafMessageType::FullSyncEnd => {
                tracing::info!("full sync from origin complete");
                Ok(())
            }
            LeafMessageType::Register | LeafMessageType::FullSync => {
                Err(LeafError::Unexpected(kind))
            }
        }
    }

    /// Remove local copies of records the origin owns.
    pub async fn purge_origin_owned(&self) {
        let r = &self.replicators;
        let mut purged = 0;
        purged += purge_where(r.roles.store().as_ref(), |_| true).await;
        purged += purge_where(r.groups.store().as_ref(), |_| true).await;
        purged += purge_where(r.templates.store().as_ref(), |t| t.is_managed).await;
        purged += purge_where(r.template_vars.store().as_ref(), |v| v.is_managed).await;
        purged += purge_where(r.spaces.store().as_ref(), |s| s.is_deleted).await;
        tracing::info!("purged {} origin-owned records before following origin", purged);
    }
}

async fn merge_from_origin<E: Replicated>(
    replicator: &EntityReplicator<E>,
    payload: &[u8],
) -> Result<(), LeafError> {
    let batch: Vec<E> = decode_payload(payload)?;
    let batch: Vec<E> = batch.into_iter().map(Replicated::on_leaf_receipt).collect();
    let report = replicator.merge(batch).await;
    tracing::debug!("{} from origin: {:?}", E::KIND, report);
    Ok(())
}

async fn purge_where<E, F>(store: &dyn EntityStore<E>, predicate: F) -> usize
where
    E: Versioned + Send + Sync,
    F: Fn(&E) -> bool,
{
    let records = match store.get_all().await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!("failed to list records for purge: {}", e);
            return 0;
        }
    };

    let mut purged = 0;
    for record in records.iter().filter(|r| predicate(r)) {
        match store.delete(record).await {
            Ok(()) => purged += 1,
            Err(e) => tracing::error!("failed to purge {}: {}", record.id(), e),
        }
    }
    purged
}
