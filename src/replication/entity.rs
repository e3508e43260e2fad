//! Replication policy per entity type
//!
//! One generic replicator serves every entity type. What differs between
//! types is captured here: the mesh scope, the leaf wire message, and the
//! scrubbing applied before a record leaves this node.

use crate::domain::entities::{
    AuditLog, Group, Response, Role, Script, Session, Space, Template, TemplateVar, Token, User,
    Versioned, Volume,
};
use crate::replication::leaf::LeafMessageType;
use crate::replication::types::{EntityKind, Scope};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The tenant and zone served by one leaf session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafContext {
    pub zone: String,
    pub user_id: String,
}

/// A record type the replication core can gossip, sync and merge.
pub trait Replicated:
    Versioned + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;

    /// Which peers see this type on the mesh.
    const SCOPE: Scope = Scope::Cluster;

    /// Wire type used when pushing this entity to leaves, if ever.
    const LEAF_MESSAGE: Option<LeafMessageType> = None;

    /// False for records that must never leave or enter this node.
    fn replicable(&self) -> bool {
        true
    }

    /// The form of this record sent to mesh peers.
    fn peer_view(&self) -> Self {
        self.clone()
    }

    /// The form of this record sent to one leaf session, or `None` when the
    /// leaf must not see it at all.
    fn leaf_view(&self, _leaf: &LeafContext) -> Option<Self> {
        None
    }

    /// Applied to records arriving from an origin before they are merged.
    fn on_leaf_receipt(self) -> Self {
        self
    }
}

impl Replicated for Group {
    const KIND: EntityKind = EntityKind::Group;
    const LEAF_MESSAGE: Option<LeafMessageType> = Some(LeafMessageType::GossipGroup);

    fn leaf_view(&self, _leaf: &LeafContext) -> Option<Self> {
        Some(self.clone())
    }
}

impl Replicated for Role {
    const KIND: EntityKind = EntityKind::Role;
    const LEAF_MESSAGE: Option<LeafMessageType> = Some(LeafMessageType::GossipRole);

    fn replicable(&self) -> bool {
        !self.is_builtin()
    }

    fn leaf_view(&self, _leaf: &LeafContext) -> Option<Self> {
        Some(self.clone())
    }
}

impl Replicated for User {
    const KIND: EntityKind = EntityKind::User;
    const LEAF_MESSAGE: Option<LeafMessageType> = Some(LeafMessageType::GossipUser);

    fn leaf_view(&self, leaf: &LeafContext) -> Option<Self> {
        (self.id == leaf.user_id).then(|| self.clone())
    }
}

impl Replicated for Space {
    const KIND: EntityKind = EntityKind::Space;
}

impl Replicated for Template {
    const KIND: EntityKind = EntityKind::Template;
    const LEAF_MESSAGE: Option<LeafMessageType> = Some(LeafMessageType::GossipTemplate);

    fn leaf_view(&self, _leaf: &LeafContext) -> Option<Self> {
        Some(self.clone())
    }

    fn on_leaf_receipt(mut self) -> Self {
        self.is_managed = true;
        self
    }
}

impl Replicated for TemplateVar {
    const KIND: EntityKind = EntityKind::TemplateVar;
    const LEAF_MESSAGE: Option<LeafMessageType> = Some(LeafMessageType::GossipTemplateVar);

    fn peer_view(&self) -> Self {
        if self.local {
            self.scrubbed()
        } else {
            self.clone()
        }
    }

    fn leaf_view(&self, leaf: &LeafContext) -> Option<Self> {
        if self.local || self.restricted || !self.zones.allows(&leaf.zone) {
            Some(self.scrubbed())
        } else {
            Some(self.clone())
        }
    }

    fn on_leaf_receipt(mut self) -> Self {
        self.is_managed = true;
        self
    }
}

impl Replicated for Volume {
    const KIND: EntityKind = EntityKind::Volume;
}

impl Replicated for Token {
    const KIND: EntityKind = EntityKind::Token;
}

impl Replicated for Session {
    const KIND: EntityKind = EntityKind::Session;
    const SCOPE: Scope = Scope::Zone;
    const LEAF_MESSAGE: Option<LeafMessageType> = Some(LeafMessageType::GossipSession);

    fn leaf_view(&self, leaf: &LeafContext) -> Option<Self> {
        (self.user_id == leaf.user_id).then(|| self.clone())
    }
}

impl Replicated for Script {
    const KIND: EntityKind = EntityKind::Script;
    const LEAF_MESSAGE: Option<LeafMessageType> = Some(LeafMessageType::GossipScript);

    fn leaf_view(&self, leaf: &LeafContext) -> Option<Self> {
        (self.is_global() || self.user_id == leaf.user_id).then(|| self.clone())
    }

    fn on_leaf_receipt(mut self) -> Self {
        self.is_managed = true;
        self
    }
}

impl Replicated for Response {
    const KIND: EntityKind = EntityKind::Response;
    const LEAF_MESSAGE: Option<LeafMessageType> = Some(LeafMessageType::GossipResponse);

    fn leaf_view(&self, leaf: &LeafContext) -> Option<Self> {
        (self.user_id == leaf.user_id).then(|| self.clone())
    }
}

impl Replicated for AuditLog {
    const KIND: EntityKind = EntityKind::AuditLog;
}
