use crate::replication::{FederationRole, ReplicationConfig, TransportAuth};
use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Node identity
    pub node_id: Option<String>,
    pub zone: String,
    pub debug: bool,

    // Peer mesh
    pub gossip_addr: String,
    pub transport_addr: String,
    pub advertise_addr: Option<String>,
    pub peers: Vec<String>,
    pub cluster_name: String,
    pub cluster_key: Option<String>,
    pub cluster_token: Option<String>,
    pub compression: bool,

    // Replication timing
    pub gossip_interval_ms: u64,
    pub payload_budget: usize,
    pub tombstone_retention_secs: u64,
    pub gc_interval_secs: u64,

    // Storage
    pub db_path: String,

    // Leaf federation
    pub leaf_listen_addr: Option<String>,
    pub origin_url: Option<String>,
    pub origin_token: Option<String>,
    pub leaf_reconnect_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            zone: "default".to_string(),
            debug: false,
            gossip_addr: "0.0.0.0:4001".to_string(),
            transport_addr: "0.0.0.0:4002".to_string(),
            advertise_addr: None,
            peers: Vec::new(),
            cluster_name: "knot".to_string(),
            cluster_key: None,
            cluster_token: None,
            compression: false,
            gossip_interval_ms: 2000,
            payload_budget: 64 * 1024,
            tombstone_retention_secs: 24 * 60 * 60,
            gc_interval_secs: 60,
            db_path: "knot.db".to_string(),
            leaf_listen_addr: None,
            origin_url: None,
            origin_token: None,
            leaf_reconnect_secs: 5,
        }
    }
}

impl Config {
    /// The in-memory store is selected by `KNOT_DB_PATH=memory`.
    pub fn uses_memory_store(&self) -> bool {
        self.db_path == "memory"
    }

    pub fn into_replication_config(&self) -> anyhow::Result<ReplicationConfig> {
        let node_id = self
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()));

        let auth = match (&self.cluster_key, &self.cluster_token) {
            (Some(key), _) => TransportAuth::SharedKey(decode_hex(key).context("KNOT_CLUSTER_KEY")?),
            (None, Some(token)) => TransportAuth::BearerToken(token.clone()),
            (None, None) => TransportAuth::None,
        };

        let federation = match (&self.leaf_listen_addr, &self.origin_url) {
            (Some(_), Some(_)) => {
                anyhow::bail!("KNOT_LEAF_LISTEN_ADDR and KNOT_ORIGIN_URL are mutually exclusive")
            }
            (Some(addr), None) => FederationRole::Origin {
                listen_addr: parse_addr("KNOT_LEAF_LISTEN_ADDR", addr)?,
            },
            (None, Some(url)) => FederationRole::Leaf {
                origin_url: url.clone(),
                token: self.origin_token.clone().unwrap_or_default(),
                reconnect_delay: Duration::from_secs(self.leaf_reconnect_secs),
            },
            (None, None) => FederationRole::None,
        };

        let mut config = ReplicationConfig::new(node_id)
            .zone(self.zone.clone())
            .gossip_addr(parse_addr("KNOT_CLUSTER_GOSSIP_ADDR", &self.gossip_addr)?)
            .transport_addr(parse_addr("KNOT_CLUSTER_TRANSPORT_ADDR", &self.transport_addr)?)
            .bootstrap_peers(self.peers.clone())
            .cluster_name(self.cluster_name.clone())
            .gossip_interval(Duration::from_millis(self.gossip_interval_ms))
            .gc_interval(Duration::from_secs(self.gc_interval_secs))
            .payload_budget(self.payload_budget)
            .tombstone_retention(Duration::from_secs(self.tombstone_retention_secs))
            .compression(self.compression)
            .auth(auth)
            .federation(federation);
        if let Some(addr) = &self.advertise_addr {
            config = config.advertise_addr(parse_addr("KNOT_CLUSTER_ADVERTISE_ADDR", addr)?);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_addr(name: &str, value: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("{} is not a socket address: {}", name, value))
}

fn decode_hex(value: &str) -> anyhow::Result<Vec<u8>> {
    let value = value.trim();
    if value.len() % 2 != 0 {
        anyhow::bail!("hex string has odd length");
    }
    (0..value.len())
        .step_by(2)
        .map(|i| {
            value
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow::anyhow!("invalid hex at offset {}", i))
        })
        .collect()
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(|name| std::env::var(name).ok())
}

/// Build the configuration from any variable source.
pub fn load_config_from<F>(var: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();

    let node_id = var("KNOT_NODE_ID").filter(|v| !v.is_empty());

    let zone = var("KNOT_ZONE").unwrap_or(defaults.zone);

    let debug = var("DEBUG").is_some();

    let gossip_addr = var("KNOT_CLUSTER_GOSSIP_ADDR").unwrap_or(defaults.gossip_addr);

    let transport_addr = var("KNOT_CLUSTER_TRANSPORT_ADDR").unwrap_or(defaults.transport_addr);

    let advertise_addr = var("KNOT_CLUSTER_ADVERTISE_ADDR").filter(|v| !v.is_empty());

    let peers = var("KNOT_CLUSTER_PEERS")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let cluster_name = var("KNOT_CLUSTER_NAME").unwrap_or(defaults.cluster_name);

    let cluster_key = var("KNOT_CLUSTER_KEY").filter(|v| !v.is_empty());
    let cluster_token = var("KNOT_CLUSTER_TOKEN").filter(|v| !v.is_empty());

    let compression = flag(var("KNOT_CLUSTER_COMPRESSION"));

    let gossip_interval_ms = var("KNOT_GOSSIP_INTERVAL_MS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.gossip_interval_ms);

    let payload_budget = var("KNOT_GOSSIP_PAYLOAD_BUDGET")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.payload_budget);

    let tombstone_retention_secs = var("KNOT_TOMBSTONE_RETENTION_SECS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.tombstone_retention_secs);

    let gc_interval_secs = var("KNOT_GC_INTERVAL_SECS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.gc_interval_secs);

    let db_path = var("KNOT_DB_PATH").unwrap_or(defaults.db_path);

    // Leaf federation
    let leaf_listen_addr = var("KNOT_LEAF_LISTEN_ADDR").filter(|v| !v.is_empty());
    let origin_url = var("KNOT_ORIGIN_URL").filter(|v| !v.is_empty());
    let origin_token = var("KNOT_ORIGIN_TOKEN").filter(|v| !v.is_empty());
    let leaf_reconnect_secs = var("KNOT_LEAF_RECONNECT_SECS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.leaf_reconnect_secs);

    Ok(Config {
        node_id,
        zone,
        debug,
        gossip_addr,
        transport_addr,
        advertise_addr,
        peers,
        cluster_name,
        cluster_key,
        cluster_token,
        compression,
        gossip_interval_ms,
        payload_budget,
        tombstone_retention_secs,
        gc_interval_secs,
        db_path,
        leaf_listen_addr,
        origin_url,
        origin_token,
        leaf_reconnect_secs,
    })
}
