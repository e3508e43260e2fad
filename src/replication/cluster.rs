//! Cluster Lifecycle
//!
//! Builds the replication core from configuration and runs it: registers a
//! replicator per entity kind plus the resource lock manager, drives the
//! periodic gossip and collection timers, starts the leaf federation role,
//! sweeps full syncs on join and tears everything down on stop.

use crate::adapters::inbound::serve_leaf_endpoint;
use crate::domain::entities::{
    AuditLog, Group, Response, Role, Script, Session, Space, Template, TemplateVar, Token, User,
    Volume,
};
use crate::domain::ports::{EntityStores, MergeObserver, PeerTransport, TransportError};
use crate::domain::services::EntityLifecycle;
use crate::domain::value_objects::Version;
use crate::infrastructure::{RetryPolicy, ShutdownController, WorkQueue};
use crate::replication::codec::PayloadCodec;
use crate::replication::config::{ConfigError, FederationRole, ReplicationConfig};
use crate::replication::dispatch::HandlerRegistry;
use crate::replication::engine::{EntityReplicator, ReplicationContext, ReplicationError};
use crate::replication::entity::Replicated;
use crate::replication::leaf::{LeafClient, LeafClientConfig, LeafHub, OriginState};
use crate::replication::locks::ResourceLockManager;
use crate::replication::membership::{MembershipError, MembershipService};
use crate::replication::transport::TransportService;
use crate::replication::types::{EntityKind, HybridClock, Peer, Scope};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};

/// How long `stop` waits for background tasks and queued merges.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("membership: {0}")]
    Membership(#[from] MembershipError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One replicator per entity kind, plus the lock manager.
pub struct Replicators {
    pub groups: EntityReplicator<Group>,
    pub roles: EntityReplicator<Role>,
    pub users: EntityReplicator<User>,
    pub spaces: EntityReplicator<Space>,
    pub templates: EntityReplicator<Template>,
    pub template_vars: EntityReplicator<TemplateVar>,
    pub volumes: EntityReplicator<Volume>,
    pub tokens: EntityReplicator<Token>,
    pub sessions: EntityReplicator<Session>,
    pub scripts: EntityReplicator<Script>,
    pub responses: EntityReplicator<Response>,
    pub audit_logs: EntityReplicator<AuditLog>,
    pub locks: ResourceLockManager,
}

fn observed<E: Replicated>(
    replicator: EntityReplicator<E>,
    lifecycle: &Option<Arc<EntityLifecycle>>,
) -> EntityReplicator<E>
where
    EntityLifecycle: MergeObserver<E>,
{
    match lifecycle {
        Some(lifecycle) => {
            let observer: Arc<dyn MergeObserver<E>> = lifecycle.clone();
            replicator.with_observer(observer)
        }
        None => replicator,
    }
}

impl Replicators {
    pub fn new(
        stores: &EntityStores,
        ctx: ReplicationContext,
        lifecycle: Option<Arc<EntityLifecycle>>,
    ) -> Self {
        let locks = ResourceLockManager::new(
            ctx.transport.clone(),
            ctx.clock.clone(),
            ctx.codec,
            ctx.payload_budget,
        );

        Self {
            groups: EntityReplicator::new(stores.groups.clone(), ctx.clone()),
            roles: observed(EntityReplicator::new(stores.roles.clone(), ctx.clone()), &lifecycle),
            users: observed(EntityReplicator::new(stores.users.clone(), ctx.clone()), &lifecycle),
            spaces: observed(EntityReplicator::new(stores.spaces.clone(), ctx.clone()), &lifecycle),
            templates: EntityReplicator::new(stores.templates.clone(), ctx.clone()),
            template_vars: EntityReplicator::new(stores.template_vars.clone(), ctx.clone()),
            volumes: observed(
                EntityReplicator::new(stores.volumes.clone(), ctx.clone()),
                &lifecycle,
            ),
            tokens: EntityReplicator::new(stores.tokens.clone(), ctx.clone()),
            sessions: EntityReplicator::new(stores.sessions.clone(), ctx.clone()),
            scripts: observed(
                EntityReplicator::new(stores.scripts.clone(), ctx.clone()),
                &lifecycle,
            ),
            responses: EntityReplicator::new(stores.responses.clone(), ctx.clone()),
            audit_logs: EntityReplicator::new(stores.audit_logs.clone(), ctx),
            locks,
        }
    }

    /// Register gossip, full-sync and periodic handlers for every kind.
    pub fn register_all(&self, registry: &HandlerRegistry) {
        self.groups.register(registry);
        self.roles.register(registry);
        self.users.register(registry);
        self.spaces.register(registry);
        self.templates.register(registry);
        self.template_vars.register(registry);
        self.volumes.register(registry);
        self.tokens.register(registry);
        self.sessions.register(registry);
        self.scripts.register(registry);
        self.responses.register(registry);
        self.audit_logs.register(registry);
        self.locks.register(registry);
    }

    /// Which peers a kind is exchanged with.
    pub fn scope_of(kind: EntityKind) -> Scope {
        match kind {
            EntityKind::Group => Group::SCOPE,
            EntityKind::Role => Role::SCOPE,
            EntityKind::User => User::SCOPE,
            EntityKind::Space => Space::SCOPE,
            EntityKind::Template => Template::SCOPE,
            EntityKind::TemplateVar => TemplateVar::SCOPE,
            EntityKind::Volume => Volume::SCOPE,
            EntityKind::Token => Token::SCOPE,
            EntityKind::Session => Session::SCOPE,
            EntityKind::Script => Script::SCOPE,
            EntityKind::Response => Response::SCOPE,
            EntityKind::AuditLog => AuditLog::SCOPE,
            EntityKind::ResourceLock => Scope::Zone,
        }
    }

    /// Full sync of one kind with `peer`. Returns how many records were written.
    pub async fn full_sync(&self, kind: EntityKind, peer: &Peer) -> Result<usize, ReplicationError> {
        let written = match kind {
            EntityKind::Group => self.groups.do_full_sync(peer).await?.written(),
            EntityKind::Role => self.roles.do_full_sync(peer).await?.written(),
            EntityKind::User => self.users.do_full_sync(peer).await?.written(),
            EntityKind::Space => self.spaces.do_full_sync(peer).await?.written(),
            EntityKind::Template => self.templates.do_full_sync(peer).await?.written(),
            EntityKind::TemplateVar => self.template_vars.do_full_sync(peer).await?.written(),
            EntityKind::Volume => self.volumes.do_full_sync(peer).await?.written(),
            EntityKind::Token => self.tokens.do_full_sync(peer).await?.written(),
            EntityKind::Session => self.sessions.do_full_sync(peer).await?.written(),
            EntityKind::Script => self.scripts.do_full_sync(peer).await?.written(),
            EntityKind::Response => self.responses.do_full_sync(peer).await?.written(),
            EntityKind::AuditLog => self.audit_logs.do_full_sync(peer).await?.written(),
            EntityKind::ResourceLock => self.locks.do_full_sync(peer).await?,
        };
        Ok(written)
    }

    /// Drop tombstones older than `retention` from every store.
    pub async fn purge_tombstones(&self, retention: Duration) -> usize {
        self.groups.purge_tombstones(retention).await
            + self.roles.purge_tombstones(retention).await
            + self.users.purge_tombstones(retention).await
            + self.spaces.purge_tombstones(retention).await
            + self.templates.purge_tombstones(retention).await
            + self.template_vars.purge_tombstones(retention).await
            + self.volumes.purge_tombstones(retention).await
            + self.tokens.purge_tombstones(retention).await
            + self.sessions.purge_tombstones(retention).await
            + self.scripts.purge_tombstones(retention).await
            + self.responses.purge_tombstones(retention).await
            + self.audit_logs.purge_tombstones(retention).await
    }
}

/// Result of a join-time full-sync sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Kinds synced with at least one peer.
    pub synced: Vec<EntityKind>,
    /// Kinds no candidate peer could serve.
    pub failed: Vec<EntityKind>,
    /// Records written across every kind.
    pub written: usize,
}

/// QUIC transport plus UDP membership.
struct Mesh {
    membership: Arc<MembershipService>,
    transport: Arc<TransportService>,
}

pub struct Cluster {
    config: ReplicationConfig,
    version: Version,
    stores: EntityStores,
    registry: Arc<HandlerRegistry>,
    transport: Arc<dyn PeerTransport>,
    mesh: Option<Mesh>,
    replicators: Arc<Replicators>,
    leaves: Arc<LeafHub>,
    work_queue: Arc<WorkQueue>,
    clock: Arc<HybridClock>,
    shutdown: ShutdownController,
    leaf_addr: RwLock<Option<SocketAddr>>,
}

impl Cluster {
    /// Build a cluster on the QUIC mesh described by `config`.
    pub fn bind(
        config: ReplicationConfig,
        version: Version,
        stores: EntityStores,
        clock: Arc<HybridClock>,
        lifecycle: Option<Arc<EntityLifecycle>>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let registry = Arc::new(HandlerRegistry::new());
        let membership = Arc::new(MembershipService::new(&config));
        let transport = Arc::new(TransportService::new(
            &config,
            membership.clone(),
            registry.clone(),
        ));

        let mut cluster = Self::with_transport(
            config,
            version,
            stores,
            clock,
            lifecycle,
            registry,
            transport.clone(),
        )?;
        cluster.mesh = Some(Mesh {
            membership,
            transport,
        });
        Ok(cluster)
    }

    /// Build a cluster on an existing transport whose inbound traffic is
    /// delivered to `registry`.
    pub fn with_transport(
        config: ReplicationConfig,
        version: Version,
        stores: EntityStores,
        clock: Arc<HybridClock>,
        lifecycle: Option<Arc<EntityLifecycle>>,
        registry: Arc<HandlerRegistry>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;

        let leaves = Arc::new(LeafHub::new(RetryPolicy::default()));
        let work_queue = Arc::new(WorkQueue::new(
            "full-sync-merge",
            config.work_queue_capacity,
            config.work_queue_workers,
        ));
        let ctx = ReplicationContext {
            transport: transport.clone(),
            clock: clock.clone(),
            codec: PayloadCodec::new(config.compression),
            leaves: leaves.clone(),
            work_queue: work_queue.clone(),
            payload_budget: config.payload_budget,
        };

        let replicators = Arc::new(Replicators::new(&stores, ctx, lifecycle));
        replicators.register_all(&registry);
        tracing::info!(
            "cluster node {} in zone {} registered {} periodic rounds",
            config.node_id,
            config.zone,
            registry.ticker_count()
        );

        Ok(Self {
            config,
            version,
            stores,
            registry,
            transport,
            mesh: None,
            replicators,
            leaves,
            work_queue,
            clock,
            shutdown: ShutdownController::new(),
            leaf_addr: RwLock::new(None),
        })
    }

    pub fn replicators(&self) -> &Arc<Replicators> {
        &self.replicators
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn leaves(&self) -> &Arc<LeafHub> {
        &self.leaves
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn locks(&self) -> &ResourceLockManager {
        &self.replicators.locks
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Bound address of the leaf endpoint when running as an origin.
    pub fn leaf_addr(&self) -> Option<SocketAddr> {
        *self.leaf_addr.read()
    }

    /// Membership address peers can use as a seed, once started.
    pub fn gossip_addr(&self) -> Option<SocketAddr> {
        self.mesh
            .as_ref()
            .filter(|mesh| !mesh.membership.is_shutdown())
            .map(|mesh| mesh.membership.local().gossip_addr)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_shutdown()
    }

    /// Start the network services, timers and federation role.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(&self) -> Result<(), ClusterError> {
        tracing::info!(
            "starting cluster node {} (zone {}, version {})",
            self.config.node_id,
            self.config.zone,
            self.version
        );

        if let Some(mesh) = &self.mesh {
            let transport_addr = mesh.transport.start().await?;
            mesh.membership
                .set_transport_addr(self.config.advertise_addr.unwrap_or(transport_addr));
            mesh.membership.start().await?;
        }

        self.start_gossip_loop();
        self.start_gc_loop();

        match &self.config.federation {
            FederationRole::None => {}
            FederationRole::Origin { listen_addr } => self.start_origin(*listen_addr).await?,
            FederationRole::Leaf {
                origin_url,
                token,
                reconnect_delay,
            } => self.start_leaf(LeafClientConfig {
                origin_url: origin_url.clone(),
                token: token.clone(),
                zone: self.config.zone.clone(),
                version: self.version,
                reconnect_delay: *reconnect_delay,
            }),
        }

        Ok(())
    }

    fn start_gossip_loop(&self) {
        let registry = self.registry.clone();
        let period = self.config.gossip_interval;
        let mut stop = self.shutdown.subscribe();
        let guard = self.shutdown.task_guard();

        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.tick().await,
                    _ = stop.recv() => break,
                }
            }
            tracing::debug!("gossip loop stopped");
        });
    }

    fn start_gc_loop(&self) {
        let replicators = self.replicators.clone();
        let period = self.config.gc_interval;
        let retention = self.config.tombstone_retention;
        let mut stop = self.shutdown.subscribe();
        let guard = self.shutdown.task_guard();

        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = replicators.purge_tombstones(retention).await;
                        let expired = replicators.locks.gc();
                        if purged + expired > 0 {
                            tracing::debug!("gc removed {} tombstones and {} locks", purged, expired);
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
            tracing::debug!("gc loop stopped");
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn start_origin(&self, listen_addr: SocketAddr) -> Result<(), ClusterError> {
        let listener = TcpListener::bind(listen_addr).await?;
        *self.leaf_addr.write() = Some(listener.local_addr()?);

        let state = Arc::new(OriginState {
            version: self.version,
            stores: self.stores.clone(),
            hub: self.leaves.clone(),
        });
        let stop = self.shutdown.subscribe();
        let guard = self.shutdown.task_guard();

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = serve_leaf_endpoint(listener, state, stop).await {
                tracing::error!("leaf endpoint failed: {}", e);
            }
        });
        Ok(())
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_leaf(&self, config: LeafClientConfig) {
        let client = LeafClient::new(config, self.replicators.clone());
        let stop = self.shutdown.subscribe();
        let guard = self.shutdown.task_guard();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = client.run(stop).await {
                tracing::error!("leaf client stopped: {}", e);
                if e.is_fatal() {
                    shutdown.shutdown();
                }
            }
        });
    }

    /// Join the mesh through `seeds` and, once peers are known, sweep full
    /// syncs in the background. Returns the number of live peers.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn join(self: &Arc<Self>, seeds: &[String]) -> Result<usize, ClusterError> {
        if let Some(mesh) = &self.mesh {
            if !seeds.is_empty() {
                mesh.membership.join(seeds, self.config.join_timeout).await?;
            }
        }

        let peers = self.transport.peers().len();
        tracing::info!("node {} sees {} peers after join", self.config.node_id, peers);
        if peers > 0 {
            let this = self.clone();
            let guard = self.shutdown.task_guard();
            tokio::spawn(async move {
                let _guard = guard;
                let report = this.full_sync_sweep().await;
                tracing::info!(
                    "join sweep done: {} kinds synced, {} failed, {} records written",
                    report.synced.len(),
                    report.failed.len(),
                    report.written
                );
            });
        }
        Ok(peers)
    }

    /// Full sync every kind against the current peers, in order. A kind is
    /// done after the first peer that answers; errors move on to the next
    /// peer.
    pub async fn full_sync_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let all_peers = self.transport.peers();
        let zone_peers = self.transport.zone_peers();

        for kind in EntityKind::ALL {
            if self.shutdown.is_shutdown() {
                break;
            }
            let candidates = match Replicators::scope_of(kind) {
                Scope::Cluster => &all_peers,
                Scope::Zone => &zone_peers,
            };
            if candidates.is_empty() {
                continue;
            }

            let mut synced = false;
            for peer in candidates {
                match self.replicators.full_sync(kind, peer).await {
                    Ok(written) => {
                        report.written += written;
                        synced = true;
                        break;
                    }
                    Err(e) => tracing::warn!("{} full sync with {} failed: {}", kind, peer, e),
                }
            }

            if synced {
                report.synced.push(kind);
            } else {
                report.failed.push(kind);
            }
        }
        report
    }

    /// Stop timers, leaf sessions and network services.
    pub async fn stop(&self) {
        tracing::info!("stopping cluster node {}", self.config.node_id);
        self.shutdown.shutdown();
        self.leaves.close_all();

        if let Some(mesh) = &self.mesh {
            mesh.transport.shutdown();
            mesh.membership.shutdown();
        }

        if !self.work_queue.shutdown(DRAIN_TIMEOUT).await {
            tracing::warn!("merge queue did not drain before stop");
        }
        self.shutdown.wait_for_drain(DRAIN_TIMEOUT).await;
    }
}
