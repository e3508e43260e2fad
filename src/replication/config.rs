//! Replication Configuration
//!
//! Configuration for the cluster replication core.

use std::net::SocketAddr;
use std::time::Duration;

/// Smallest payload budget that still fits a realistic single record.
pub const MIN_PAYLOAD_BUDGET: usize = 1024;

/// How peers authenticate each other's frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportAuth {
    /// Frames are accepted from anyone who can reach the port.
    #[default]
    None,
    /// Every frame carries an HMAC-SHA256 tag keyed by a shared secret.
    SharedKey(Vec<u8>),
    /// Every frame carries a bearer token compared verbatim.
    BearerToken(String),
}

/// This node's place in leaf federation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FederationRole {
    #[default]
    None,
    /// Serve leaves on `listen_addr`.
    Origin { listen_addr: SocketAddr },
    /// Follow the origin reachable at `origin_url`.
    Leaf {
        origin_url: String,
        token: String,
        reconnect_delay: Duration,
    },
}

/// Configuration for the replication core.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Unique identifier for this node (e.g., "node-eu-1")
    pub node_id: String,

    /// Zone this node belongs to (e.g., "eu-west")
    pub zone: String,

    /// Address to bind for membership (default: 0.0.0.0:4001)
    pub gossip_addr: SocketAddr,

    /// Address to bind for QUIC transport (default: 0.0.0.0:4002)
    pub transport_addr: SocketAddr,

    /// Transport address announced to peers when it differs from the bind address
    pub advertise_addr: Option<SocketAddr>,

    /// Bootstrap peers to join the cluster (e.g., ["node-us.example.com:4001"])
    pub bootstrap_peers: Vec<String>,

    /// Cluster name for isolation (default: "knot")
    pub cluster_name: String,

    /// Periodic gossip round interval (default: 2s)
    pub gossip_interval: Duration,

    /// Tombstone and lock collection interval (default: 60s)
    pub gc_interval: Duration,

    /// Ceiling on the encoded size of one periodic gossip batch (default: 64KiB)
    pub payload_budget: usize,

    /// How long tombstones are kept before physical removal (default: 24h)
    pub tombstone_retention: Duration,

    /// Timeout for one full-sync request/response exchange (default: 10s)
    pub request_timeout: Duration,

    /// How long `join` waits for membership to settle (default: 5s)
    pub join_timeout: Duration,

    /// Compress mesh payloads with lz4 (default: false)
    pub compression: bool,

    /// Frame authentication between peers
    pub auth: TransportAuth,

    /// Leaf federation role
    pub federation: FederationRole,

    /// Capacity of the background merge queue (default: 1024)
    pub work_queue_capacity: usize,

    /// Workers draining the background merge queue (default: 4)
    pub work_queue_workers: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            zone: "default".to_string(),
            gossip_addr: SocketAddr::from(([0, 0, 0, 0], 4001)),
            transport_addr: SocketAddr::from(([0, 0, 0, 0], 4002)),
            advertise_addr: None,
            bootstrap_peers: Vec::new(),
            cluster_name: "knot".to_string(),
            gossip_interval: Duration::from_secs(2),
            gc_interval: Duration::from_secs(60),
            payload_budget: 64 * 1024,
            tombstone_retention: Duration::from_secs(24 * 60 * 60),
            request_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(5),
            compression: false,
            auth: TransportAuth::None,
            federation: FederationRole::None,
            work_queue_capacity: 1024,
            work_queue_workers: 4,
        }
    }
}

impl ReplicationConfig {
    /// Create a new configuration with node ID.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    /// Set the gossip address.
    pub fn gossip_addr(mut self, addr: SocketAddr) -> Self {
        self.gossip_addr = addr;
        self
    }

    /// Set the transport address.
    pub fn transport_addr(mut self, addr: SocketAddr) -> Self {
        self.transport_addr = addr;
        self
    }

    pub fn advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = Some(addr);
        self
    }

    /// Add bootstrap peers.
    pub fn bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    /// Set the cluster name.
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn payload_budget(mut self, bytes: usize) -> Self {
        self.payload_budget = bytes;
        self
    }

    pub fn tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn auth(mut self, auth: TransportAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn federation(mut self, role: FederationRole) -> Self {
        self.federation = role;
        self
    }

    /// Address peers should dial for QUIC transport.
    pub fn advertised_transport_addr(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.transport_addr)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::MissingNodeId);
        }
        if self.cluster_name.is_empty() {
            return Err(ConfigError::MissingClusterName);
        }
        if self.zone.is_empty() {
            return Err(ConfigError::MissingZone);
        }
        if self.payload_budget < MIN_PAYLOAD_BUDGET {
            return Err(ConfigError::PayloadBudgetTooSmall(self.payload_budget));
        }
        if self.gossip_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("gossip_interval"));
        }
        if self.gc_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("gc_interval"));
        }
        if self.work_queue_capacity == 0 || self.work_queue_workers == 0 {
            return Err(ConfigError::EmptyWorkQueue);
        }
        match &self.auth {
            TransportAuth::SharedKey(key) if key.is_empty() => {
                return Err(ConfigError::EmptyCredential("shared key"))
            }
            TransportAuth::BearerToken(token) if token.is_empty() => {
                return Err(ConfigError::EmptyCredential("bearer token"))
            }
            _ => {}
        }
        if let FederationRole::Leaf { origin_url, token, .. } = &self.federation {
            url::Url::parse(origin_url)
                .map_err(|e| ConfigError::InvalidOriginUrl(format!("{}: {}", origin_url, e)))?;
            if token.is_empty() {
                return Err(ConfigError::EmptyCredential("origin token"));
            }
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("node_id is required")]
    MissingNodeId,
    #[error("cluster_name is required")]
    MissingClusterName,
    #[error("zone is required")]
    MissingZone,
    #[error("payload budget {0} is below the minimum of {MIN_PAYLOAD_BUDGET} bytes")]
    PayloadBudgetTooSmall(usize),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("work queue needs a non-zero capacity and worker count")]
    EmptyWorkQueue,
    #[error("{0} must not be empty")]
    EmptyCredential(&'static str),
    #[error("invalid origin url {0}")]
    InvalidOriginUrl(String),
}
