//! Role Cache Port
//!
//! In-memory view of roles used for permission checks. Kept current by the
//! merge path so remote role edits take effect without a store round trip.

use crate::domain::entities::Role;

pub trait RoleCache: Send + Sync {
    /// Replace the cache contents. The built-in Admin role is always re-seeded.
    fn load(&self, roles: Vec<Role>);

    fn get(&self, id: &str) -> Option<Role>;

    fn put(&self, role: Role);

    fn delete(&self, id: &str);
}
