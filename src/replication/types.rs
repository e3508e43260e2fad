//! Replication Types
//!
//! Core types for the replication system: node identity, hybrid logical clock,
//! entity kinds and the messages exchanged on the peer mesh.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Hybrid Logical Clock timestamp for ordering events.
///
/// Combines wall clock time with a logical counter to ensure
/// total ordering even when wall clocks are skewed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HLCTimestamp {
    /// Wall clock time in microseconds since UNIX epoch
    pub wall_time: u64,
    /// Logical counter for events at the same wall time
    pub counter: u32,
    /// Node ID hash for tie-breaking
    pub node_hash: u32,
}

impl HLCTimestamp {
    /// Create a new timestamp for the current time.
    pub fn now(node_id: &NodeId) -> Self {
        Self {
            wall_time: wall_clock_micros(),
            counter: 0,
            node_hash: crc32fast::hash(node_id.0.as_bytes()),
        }
    }

    /// Create a timestamp that is greater than self and other.
    pub fn tick(&self, other: Option<&HLCTimestamp>, node_id: &NodeId) -> Self {
        let now = wall_clock_micros();
        let node_hash = crc32fast::hash(node_id.0.as_bytes());

        let (wall_time, counter) = match other {
            Some(o) => {
                let max_wall = now.max(self.wall_time).max(o.wall_time);
                if max_wall == self.wall_time && max_wall == o.wall_time {
                    advance(max_wall, Some(self.counter.max(o.counter)))
                } else if max_wall == self.wall_time {
                    advance(max_wall, Some(self.counter))
                } else if max_wall == o.wall_time {
                    advance(max_wall, Some(o.counter))
                } else {
                    advance(max_wall, None)
                }
            }
            None => {
                let max_wall = now.max(self.wall_time);
                if max_wall == self.wall_time {
                    advance(max_wall, Some(self.counter))
                } else {
                    advance(max_wall, None)
                }
            }
        };

        Self {
            wall_time,
            counter,
            node_hash,
        }
    }

    /// Age of the wall-clock component relative to now.
    pub fn age(&self) -> std::time::Duration {
        std::time::Duration::from_micros(wall_clock_micros().saturating_sub(self.wall_time))
    }
}

/// Next `(wall_time, counter)` after `counter` at `wall_time`. A saturated
/// counter rolls over into the next microsecond.
fn advance(wall_time: u64, counter: Option<u32>) -> (u64, u32) {
    match counter {
        None => (wall_time, 0),
        Some(c) => match c.checked_add(1) {
            Some(next) => (wall_time, next),
            None => (wall_time.saturating_add(1), 0),
        },
    }
}

/// Per-node clock handing out strictly increasing timestamps.
///
/// Every local mutation stamps its record with `now()`. Timestamps seen
/// during a merge are fed to `observe()` so the next local write orders
/// after everything this node already knows about.
#[derive(Debug)]
pub struct HybridClock {
    node_id: NodeId,
    last: Mutex<HLCTimestamp>,
}

impl HybridClock {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            last: Mutex::new(HLCTimestamp::default()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Issue a timestamp greater than any previously issued or observed one.
    pub fn now(&self) -> HLCTimestamp {
        let mut last = self.last.lock();
        let next = last.tick(None, &self.node_id);
        *last = next;
        next
    }

    /// Fold a remote timestamp into the clock.
    pub fn observe(&self, remote: HLCTimestamp) {
        let mut last = self.last.lock();
        if remote > *last {
            *last = last.tick(Some(&remote), &self.node_id);
        }
    }
}

/// Replicated entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Group,
    Role,
    Space,
    Template,
    TemplateVar,
    User,
    Volume,
    Token,
    Session,
    Script,
    Response,
    AuditLog,
    ResourceLock,
}

impl EntityKind {
    /// Every kind, in full-sync sweep order.
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Group,
        EntityKind::Role,
        EntityKind::User,
        EntityKind::Template,
        EntityKind::TemplateVar,
        EntityKind::Space,
        EntityKind::Volume,
        EntityKind::Token,
        EntityKind::Session,
        EntityKind::Script,
        EntityKind::Response,
        EntityKind::AuditLog,
        EntityKind::ResourceLock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Role => "role",
            Self::Space => "space",
            Self::Template => "template",
            Self::TemplateVar => "template_var",
            Self::User => "user",
            Self::Volume => "volume",
            Self::Token => "token",
            Self::Session => "session",
            Self::Script => "script",
            Self::Response => "response",
            Self::AuditLog => "audit_log",
            Self::ResourceLock => "resource_lock",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a kind travels on the peer mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every peer in the cluster.
    Cluster,
    /// Only peers sharing the local zone.
    Zone,
}

/// Mesh operation carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Fire-and-forget batch broadcast.
    Gossip,
    /// Request/response exchange of complete datasets.
    FullSync,
}

/// Handler routing key: which entity kind and which operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub kind: EntityKind,
    pub op: Operation,
}

impl Topic {
    pub fn gossip(kind: EntityKind) -> Self {
        Self {
            kind,
            op: Operation::Gossip,
        }
    }

    pub fn full_sync(kind: EntityKind) -> Self {
        Self {
            kind,
            op: Operation::FullSync,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.op {
            Operation::Gossip => write!(f, "{}:gossip", self.kind),
            Operation::FullSync => write!(f, "{}:fullsync", self.kind),
        }
    }
}

/// A message on the peer mesh. The payload is an encoded entity batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: Topic,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: Topic, payload: Vec<u8>) -> Self {
        Self { topic, payload }
    }
}

/// A remote node as seen by the replication core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: NodeId,
    pub zone: String,
}

impl Peer {
    pub fn new(node_id: impl Into<NodeId>, zone: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            zone: zone.into(),
        }
    }

    pub fn same_zone(&self, zone: &str) -> bool {
        self.zone == zone
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.node_id, self.zone)
    }
}
