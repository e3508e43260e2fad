//! Cluster Replication Core
//!
//! Keeps the administrative state of a multi-tenant workspace platform
//! consistent across a mesh of peer nodes and a tree of leaf nodes.
//!
//! ## Architecture
//!
//! - **Engine**: one generic replicator per entity kind doing immediate
//!   gossip, sampled periodic gossip, full sync and last-writer-wins merge
//!   on HLC timestamps, with tombstones for deletes
//! - **Locks**: zone-scoped TTL leases on physical resources
//! - **Membership (UDP)**: SWIM-style discovery carrying each node's zone
//! - **Transport (QUIC)**: authenticated fire-and-forget and request/response
//! - **Leaf federation**: origin/leaf protocol over WebSocket
//! - **Cluster**: wires everything together and owns the timers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use knot_cluster::replication::{Cluster, ReplicationConfig};
//!
//! let config = ReplicationConfig::new("node-eu-1")
//!     .zone("eu-west")
//!     .bootstrap_peers(vec!["node-us.example.com:4001".to_string()]);
//!
//! let cluster = Arc::new(Cluster::bind(config, version, stores, clock, Some(lifecycle))?);
//! cluster.start().await?;
//! cluster.join(&peers).await?;
//! ```

pub mod cluster;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod entity;
pub mod leaf;
pub mod locks;
pub mod loopback;
pub mod membership;
pub mod transport;
pub mod types;

pub use cluster::{Cluster, ClusterError, Replicators, SweepReport};
pub use codec::{CodecError, PayloadCodec};
pub use config::{ConfigError, FederationRole, ReplicationConfig, TransportAuth};
pub use dispatch::HandlerRegistry;
pub use engine::{EntityReplicator, MergeReport, ReplicationContext, ReplicationError};
pub use entity::{LeafContext, Replicated};
pub use locks::{LockError, ResourceLockManager};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use membership::{Member, MemberState, MembershipEvent, MembershipService};
pub use transport::TransportService;
pub use types::{EntityKind, HLCTimestamp, HybridClock, Message, NodeId, Peer, Scope, Topic};
