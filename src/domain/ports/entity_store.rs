//! Entity Store Port
//!
//! Defines the interface to the durable, locally consistent entity store.
//! Implementations may use SQLite or in-memory storage.

use crate::domain::entities::{
    AuditLog, Group, Response, Role, Script, Session, Space, Template, TemplateVar, Token, User,
    Versioned, Volume,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Errors surfaced by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("failed to encode or decode record {id}: {reason}")]
    Codec { id: String, reason: String },
}

/// Store for one entity type.
///
/// The replication core treats the store as authoritative and durable and
/// never retries a failed write. `get_all` must include tombstones so they
/// keep propagating until the local collector purges them.
#[async_trait]
pub trait EntityStore<E: Versioned>: Send + Sync {
    /// Insert or fully overwrite a record.
    async fn save(&self, entity: &E) -> Result<(), StoreError>;

    /// Get a record by id, tombstoned or not.
    async fn get(&self, id: &str) -> Result<Option<E>, StoreError>;

    /// Get every record, including tombstones.
    async fn get_all(&self) -> Result<Vec<E>, StoreError>;

    /// Physically remove a record.
    async fn delete(&self, entity: &E) -> Result<(), StoreError>;
}

/// One store per replicated entity type.
#[derive(Clone)]
pub struct EntityStores {
    pub groups: Arc<dyn EntityStore<Group>>,
    pub roles: Arc<dyn EntityStore<Role>>,
    pub users: Arc<dyn EntityStore<User>>,
    pub spaces: Arc<dyn EntityStore<Space>>,
    pub templates: Arc<dyn EntityStore<Template>>,
    pub template_vars: Arc<dyn EntityStore<TemplateVar>>,
    pub volumes: Arc<dyn EntityStore<Volume>>,
    pub tokens: Arc<dyn EntityStore<Token>>,
    pub sessions: Arc<dyn EntityStore<Session>>,
    pub scripts: Arc<dyn EntityStore<Script>>,
    pub responses: Arc<dyn EntityStore<Response>>,
    pub audit_logs: Arc<dyn EntityStore<AuditLog>>,
}
