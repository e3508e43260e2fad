mod dashmap_entity_store;
mod dashmap_role_cache;
mod sqlite_entity_store;
mod websocket_link;

pub use dashmap_entity_store::DashMapEntityStore;
pub use dashmap_role_cache::DashMapRoleCache;
pub use sqlite_entity_store::{SqliteDatabase, SqliteEntityStore};
pub use websocket_link::{connect_origin, leaf_endpoint, OriginSink, OriginStream, LEAF_PATH};

use crate::domain::entities::{
    AuditLog, Group, Response, Role, Script, Session, Space, Template, TemplateVar, Token, User,
    Volume,
};
use crate::domain::ports::EntityStores;
use std::path::Path;
use std::sync::Arc;

/// Fresh in-memory stores for every entity kind.
pub fn memory_stores() -> EntityStores {
    EntityStores {
        groups: Arc::new(DashMapEntityStore::<Group>::new()),
        roles: Arc::new(DashMapEntityStore::<Role>::new()),
        users: Arc::new(DashMapEntityStore::<User>::new()),
        spaces: Arc::new(DashMapEntityStore::<Space>::new()),
        templates: Arc::new(DashMapEntityStore::<Template>::new()),
        template_vars: Arc::new(DashMapEntityStore::<TemplateVar>::new()),
        volumes: Arc::new(DashMapEntityStore::<Volume>::new()),
        tokens: Arc::new(DashMapEntityStore::<Token>::new()),
        sessions: Arc::new(DashMapEntityStore::<Session>::new()),
        scripts: Arc::new(DashMapEntityStore::<Script>::new()),
        responses: Arc::new(DashMapEntityStore::<Response>::new()),
        audit_logs: Arc::new(DashMapEntityStore::<AuditLog>::new()),
    }
}

/// Stores backed by one SQLite file.
pub fn sqlite_stores(path: impl AsRef<Path>) -> anyhow::Result<EntityStores> {
    let db = SqliteDatabase::open(path)?;
    Ok(EntityStores {
        groups: Arc::new(db.store::<Group>()?),
        roles: Arc::new(db.store::<Role>()?),
        users: Arc::new(db.store::<User>()?),
        spaces: Arc::new(db.store::<Space>()?),
        templates: Arc::new(db.store::<Template>()?),
        template_vars: Arc::new(db.store::<TemplateVar>()?),
        volumes: Arc::new(db.store::<Volume>()?),
        tokens: Arc::new(db.store::<Token>()?),
        sessions: Arc::new(db.store::<Session>()?),
        scripts: Arc::new(db.store::<Script>()?),
        responses: Arc::new(db.store::<Response>()?),
        audit_logs: Arc::new(db.store::<AuditLog>()?),
    })
}
