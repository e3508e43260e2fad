//! Domain Entities - Replicated administrative state
//!
//! Every entity carries a stable id, an HLC `updated_at` bumped on each
//! mutation and an `is_deleted` tombstone flag. Deletion never removes a
//! record directly: the flag flips, the clock bumps, and a node-local
//! collector purges the tombstone once it has had time to propagate.

use crate::domain::value_objects::{Permission, ZoneList};
use crate::replication::types::HLCTimestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id of the synthetic Admin role seeded on every node.
pub const ADMIN_ROLE_ID: &str = "00000000-0000-0000-0000-000000000001";

/// Identity, version and tombstone of a replicated record.
pub trait Versioned {
    fn id(&self) -> &str;
    fn updated_at(&self) -> HLCTimestamp;
    fn is_deleted(&self) -> bool;

    /// Record a mutation at `ts`.
    fn stamp(&mut self, ts: HLCTimestamp);

    /// Flip the tombstone and record the deletion at `ts`.
    fn tombstone(&mut self, ts: HLCTimestamp);
}

macro_rules! versioned {
    ($($ty:ty),* $(,)?) => {$(
        impl Versioned for $ty {
            fn id(&self) -> &str {
                &self.id
            }

            fn updated_at(&self) -> HLCTimestamp {
                self.updated_at
            }

            fn is_deleted(&self) -> bool {
                self.is_deleted
            }

            fn stamp(&mut self, ts: HLCTimestamp) {
                self.updated_at = ts;
            }

            fn tombstone(&mut self, ts: HLCTimestamp) {
                self.is_deleted = true;
                self.updated_at = ts;
            }
        }
    )*};
}

/// A group of users sharing resource quotas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub max_spaces: u32,
    pub compute_units: u32,
    pub storage_units: u32,
    pub max_tunnels: u32,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

/// A named set of permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub permissions: Vec<Permission>,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

impl Role {
    /// The built-in Admin role. Seeded locally, never replicated.
    pub fn admin() -> Self {
        Self {
            id: ADMIN_ROLE_ID.to_string(),
            name: "Admin".to_string(),
            permissions: Permission::ALL.to_vec(),
            updated_at: HLCTimestamp::default(),
            is_deleted: false,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id == ADMIN_ROLE_ID
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub active: bool,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    pub ssh_public_key: String,
    pub preferred_shell: String,
    pub timezone: String,
    pub max_spaces: u32,
    pub compute_units: u32,
    pub storage_units: u32,
    pub max_tunnels: u32,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

/// A user workspace. Deployed in one zone, listed cluster-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub shared_with_user_id: Option<String>,
    pub template_id: String,
    pub zone: String,
    pub is_deployed: bool,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: String,
    pub job: String,
    pub volumes: String,
    pub zones: ZoneList,
    pub active: bool,
    /// Owned by a federation origin; local edits are refused.
    pub is_managed: bool,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

/// A variable substituted into templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVar {
    pub id: String,
    pub name: String,
    pub value: String,
    pub zones: ZoneList,
    /// Never leaves the node it was created on.
    pub local: bool,
    /// Value withheld from leaf nodes.
    pub restricted: bool,
    pub protected: bool,
    pub is_managed: bool,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

impl TemplateVar {
    /// Value-free tombstone standing in for a var that must not be shared.
    pub fn scrubbed(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.id.clone(),
            value: String::new(),
            zones: ZoneList::default(),
            local: self.local,
            restricted: self.restricted,
            protected: self.protected,
            is_managed: self.is_managed,
            updated_at: self.updated_at,
            is_deleted: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub definition: String,
    pub zone: String,
    pub active: bool,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

/// API token. Also authenticates leaf nodes against an origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub expires_after: DateTime<Utc>,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_after <= now
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub ip: String,
    pub user_agent: String,
    pub expires_after: DateTime<Utc>,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub name: String,
    pub description: String,
    pub content: String,
    pub script_type: String,
    pub zones: ZoneList,
    /// Owner. Empty for global scripts.
    pub user_id: String,
    pub active: bool,
    pub is_managed: bool,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

impl Script {
    pub fn is_global(&self) -> bool {
        self.user_id.is_empty()
    }
}

/// A stored response produced on behalf of a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub request: String,
    pub output: String,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: String,
    pub actor: String,
    pub actor_type: String,
    pub event: String,
    pub when: DateTime<Utc>,
    pub details: String,
    pub properties: BTreeMap<String, String>,
    pub updated_at: HLCTimestamp,
    pub is_deleted: bool,
}

/// Lease on a physical resource. Kept in memory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    /// The resource being locked.
    pub id: String,
    /// Capability required to release the lock.
    pub unlock_token: String,
    pub expires_after: DateTime<Utc>,
    pub updated_at: HLCTimestamp,
}

impl ResourceLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_after <= now
    }
}

versioned!(
    Group,
    Role,
    User,
    Space,
    Template,
    TemplateVar,
    Volume,
    Token,
    Session,
    Script,
    Response,
    AuditLog,
);
