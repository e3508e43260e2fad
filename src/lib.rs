//! knot-cluster Library
//!
//! Cluster replication core for a multi-tenant workspace platform, exposed
//! for the node binary, integration tests and embedding.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use config::load_config;
pub use domain::entities::{
    AuditLog, Group, ResourceLock, Response, Role, Script, Session, Space, Template, TemplateVar,
    Token, User, Versioned, Volume,
};
pub use domain::ports::{EntityStore, EntityStores, MergeObserver, PeerTransport, RoleCache};
pub use domain::services::{EntityEvent, EntityLifecycle};
pub use domain::value_objects::{Version, ZoneList};
pub use replication::{Cluster, ReplicationConfig};
