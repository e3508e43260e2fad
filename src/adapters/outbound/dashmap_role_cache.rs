//! DashMap Role Cache
//!
//! Implements RoleCache using DashMap. The built-in Admin role is seeded on
//! construction and on every reload.

use crate::domain::entities::{Role, ADMIN_ROLE_ID};
use crate::domain::ports::RoleCache;
use dashmap::DashMap;

pub struct DashMapRoleCache {
    roles: DashMap<String, Role>,
}

impl DashMapRoleCache {
    pub fn new() -> Self {
        let cache = Self {
            roles: DashMap::new(),
        };
        cache.seed_admin();
        cache
    }

    fn seed_admin(&self) {
        let admin = Role::admin();
        self.roles.insert(admin.id.clone(), admin);
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl Default for DashMapRoleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleCache for DashMapRoleCache {
    fn load(&self, roles: Vec<Role>) {
        self.roles.clear();
        for role in roles {
            self.roles.insert(role.id.clone(), role);
        }
        self.seed_admin();
    }

    fn get(&self, id: &str) -> Option<Role> {
        self.roles.get(id).map(|r| r.value().clone())
    }

    fn put(&self, role: Role) {
        if role.id == ADMIN_ROLE_ID {
            return;
        }
        self.roles.insert(role.id.clone(), role);
    }

    fn delete(&self, id: &str) {
        if id == ADMIN_ROLE_ID {
            return;
        }
        self.roles.remove(id);
    }
}
