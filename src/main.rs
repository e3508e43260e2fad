//! knot-cluster - Workspace Cluster Replication Node
//!
//! This is the composition root that wires together all the components.

use knot_cluster::adapters::outbound::{memory_stores, sqlite_stores, DashMapRoleCache};
use knot_cluster::config::load_config;
use knot_cluster::domain::services::EntityLifecycle;
use knot_cluster::domain::value_objects::Version;
use knot_cluster::infrastructure::shutdown_signal;
use knot_cluster::replication::{Cluster, HybridClock, NodeId};
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    // quinn and rustls need a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let replication = cfg.into_replication_config()?;
    let version = Version::parse(env!("CARGO_PKG_VERSION"))
        .ok_or_else(|| anyhow::anyhow!("bad package version"))?;

    tracing::info!(
        "starting knot-cluster {} node={} zone={}",
        version,
        replication.node_id,
        replication.zone
    );

    // ===== COMPOSITION ROOT =====

    // 1. Stores
    let stores = if cfg.uses_memory_store() {
        tracing::warn!("using the in-memory store, state is lost on exit");
        memory_stores()
    } else {
        tracing::info!("using SQLite store at {}", cfg.db_path);
        sqlite_stores(&cfg.db_path)?
    };

    // 2. Clock, role cache and merge side effects
    let clock = Arc::new(HybridClock::new(NodeId::new(replication.node_id.clone())));
    let lifecycle = Arc::new(EntityLifecycle::new(
        stores.clone(),
        Arc::new(DashMapRoleCache::new()),
        clock.clone(),
    ));
    lifecycle.load_roles().await;

    // 3. Cluster
    let peers = replication.bootstrap_peers.clone();
    let cluster = Arc::new(Cluster::bind(
        replication,
        version,
        stores,
        clock,
        Some(lifecycle),
    )?);
    cluster.start().await?;
    let live = cluster.join(&peers).await?;
    tracing::info!("cluster started with {} live peers", live);

    // 4. Run until a signal or a fatal leaf error
    let controller = cluster.shutdown_controller().clone();
    let mut stopped = controller.subscribe();
    tokio::spawn(shutdown_signal(controller.clone()));
    if !controller.is_shutdown() {
        let _ = stopped.recv().await;
    }

    cluster.stop().await;
    tracing::info!("knot-cluster stopped");
    Ok(())
}
