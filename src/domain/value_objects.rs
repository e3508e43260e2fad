//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.

use serde::{Deserialize, Serialize};

/// Zone allow-list attached to templates and template variables.
///
/// Entries are zone names, optionally prefixed with `!` to exclude a zone.
/// An empty list applies everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneList(pub Vec<String>);

impl ZoneList {
    pub fn new<I, S>(zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(zones.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check whether `zone` is allowed by this list.
    ///
    /// # Examples
    /// ```
    /// use knot_cluster::domain::value_objects::ZoneList;
    ///
    /// assert!(ZoneList::default().allows("eu"));
    /// assert!(ZoneList::new(["eu", "us"]).allows("us"));
    /// assert!(!ZoneList::new(["eu"]).allows("us"));
    /// assert!(ZoneList::new(["!eu"]).allows("us"));
    /// assert!(!ZoneList::new(["!eu"]).allows("eu"));
    /// ```
    pub fn allows(&self, zone: &str) -> bool {
        let mut has_positive = false;
        let mut listed = false;

        for entry in &self.0 {
            match entry.strip_prefix('!') {
                Some(negated) => {
                    if negated == zone {
                        return false;
                    }
                }
                None => {
                    has_positive = true;
                    if entry == zone {
                        listed = true;
                    }
                }
            }
        }

        !has_positive || listed
    }
}

/// Permission bit granted by a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission(pub u16);

impl Permission {
    pub const MANAGE_USERS: Permission = Permission(0);
    pub const MANAGE_TEMPLATES: Permission = Permission(1);
    pub const MANAGE_SPACES: Permission = Permission(2);
    pub const MANAGE_VOLUMES: Permission = Permission(3);
    pub const MANAGE_GROUPS: Permission = Permission(4);
    pub const MANAGE_ROLES: Permission = Permission(5);
    pub const MANAGE_VARIABLES: Permission = Permission(6);
    pub const VIEW_AUDIT_LOGS: Permission = Permission(7);
    pub const MANAGE_SCRIPTS: Permission = Permission(8);
    pub const USE_SPACES: Permission = Permission(9);
    pub const USE_TUNNELS: Permission = Permission(10);
    pub const USE_API: Permission = Permission(11);
    pub const TRANSFER_SPACES: Permission = Permission(12);
    pub const SHARE_SPACES: Permission = Permission(13);
    pub const CLUSTER_INFO: Permission = Permission(14);

    /// Every permission known to this build.
    pub const ALL: [Permission; 15] = [
        Self::MANAGE_USERS,
        Self::MANAGE_TEMPLATES,
        Self::MANAGE_SPACES,
        Self::MANAGE_VOLUMES,
        Self::MANAGE_GROUPS,
        Self::MANAGE_ROLES,
        Self::MANAGE_VARIABLES,
        Self::VIEW_AUDIT_LOGS,
        Self::MANAGE_SCRIPTS,
        Self::USE_SPACES,
        Self::USE_TUNNELS,
        Self::USE_API,
        Self::TRANSFER_SPACES,
        Self::SHARE_SPACES,
        Self::CLUSTER_INFO,
    ];
}

/// Leaf software version, compared on major.minor only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
}

impl Version {
    /// Parse `major.minor[.patch][-pre]`. Missing minor defaults to 0.
    pub fn parse(s: &str) -> Option<Self> {
        let core = s.trim().trim_start_matches('v');
        let core = core.split(['-', '+']).next().unwrap_or(core);
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(m) => m.parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor })
    }

    /// True when both sides agree on major.minor.
    pub fn compatible_with(&self, other: &Version) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
