//! Entity Lifecycle Service
//!
//! Side effects of records written by the merge path. Remote changes to
//! roles refresh the role cache, deletions cascade to dependent records,
//! and anything a runtime subsystem has to act on (stopping a space or a
//! volume, re-pushing SSH keys) is published as an `EntityEvent`.

use crate::domain::entities::{Role, Script, Space, User, Versioned, Volume};
use crate::domain::ports::{EntityStores, MergeObserver, RoleCache};
use crate::replication::types::HybridClock;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Work requested of dependent subsystems after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityEvent {
    RoleChanged { role_id: String },
    UserDeleted { user_id: String },
    /// Authorized keys must be regenerated for this user's spaces.
    SshKeysChanged { user_id: String },
    SpaceStopRequested { space_id: String, zone: String },
    VolumeStopRequested { volume_id: String, zone: String },
    ScriptChanged { script_id: String },
}

pub struct EntityLifecycle {
    stores: EntityStores,
    roles: Arc<dyn RoleCache>,
    clock: Arc<HybridClock>,
    events: broadcast::Sender<EntityEvent>,
}

impl EntityLifecycle {
    pub fn new(stores: EntityStores, roles: Arc<dyn RoleCache>, clock: Arc<HybridClock>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            stores,
            roles,
            clock,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.events.subscribe()
    }

    pub fn role_cache(&self) -> &Arc<dyn RoleCache> {
        &self.roles
    }

    /// Fill the role cache from the store.
    pub async fn load_roles(&self) {
        match self.stores.roles.get_all().await {
            Ok(roles) => {
                let live: Vec<Role> = roles.into_iter().filter(|r| !r.is_deleted).collect();
                tracing::info!("loaded {} roles into cache", live.len());
                self.roles.load(live);
            }
            Err(e) => tracing::error!("failed to load roles: {}", e),
        }
    }

    fn publish(&self, event: EntityEvent) {
        tracing::debug!("lifecycle event {:?}", event);
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// A user is gone: tombstone their spaces and drop their credentials.
    async fn cascade_user_delete(&self, user: &User) {
        match self.stores.spaces.get_all().await {
            Ok(spaces) => {
                for mut space in spaces
                    .into_iter()
                    .filter(|s| s.user_id == user.id && !s.is_deleted)
                {
                    let zone = space.zone.clone();
                    space.tombstone(self.clock.now());
                    if let Err(e) = self.stores.spaces.save(&space).await {
                        tracing::error!("failed to tombstone space {}: {}", space.id, e);
                        continue;
                    }
                    self.publish(EntityEvent::SpaceStopRequested {
                        space_id: space.id.clone(),
                        zone,
                    });
                }
            }
            Err(e) => tracing::error!("failed to list spaces of user {}: {}", user.id, e),
        }

        match self.stores.sessions.get_all().await {
            Ok(sessions) => {
                for session in sessions.iter().filter(|s| s.user_id == user.id) {
                    if let Err(e) = self.stores.sessions.delete(session).await {
                        tracing::error!("failed to delete session {}: {}", session.id, e);
                    }
                }
            }
            Err(e) => tracing::error!("failed to list sessions of user {}: {}", user.id, e),
        }

        match self.stores.tokens.get_all().await {
            Ok(tokens) => {
                for token in tokens.iter().filter(|t| t.user_id == user.id) {
                    if let Err(e) = self.stores.tokens.delete(token).await {
                        tracing::error!("failed to delete token {}: {}", token.id, e);
                    }
                }
            }
            Err(e) => tracing::error!("failed to list tokens of user {}: {}", user.id, e),
        }

        self.publish(EntityEvent::UserDeleted {
            user_id: user.id.clone(),
        });
    }
}

#[async_trait]
impl MergeObserver<Role> for EntityLifecycle {
    async fn merged(&self, _previous: Option<Role>, current: &Role) {
        if current.is_deleted {
            self.roles.delete(&current.id);
        } else {
            self.roles.put(current.clone());
        }
        self.publish(EntityEvent::RoleChanged {
            role_id: current.id.clone(),
        });
    }
}

#[async_trait]
impl MergeObserver<User> for EntityLifecycle {
    async fn merged(&self, previous: Option<User>, current: &User) {
        let was_deleted = previous.as_ref().map(|p| p.is_deleted).unwrap_or(false);
        if current.is_deleted {
            if !was_deleted {
                self.cascade_user_delete(current).await;
            }
            return;
        }

        let keys_changed = match &previous {
            Some(p) => p.ssh_public_key != current.ssh_public_key || p.active != current.active,
            None => !current.ssh_public_key.is_empty(),
        };
        if keys_changed {
            self.publish(EntityEvent::SshKeysChanged {
                user_id: current.id.clone(),
            });
        }
    }
}

#[async_trait]
impl MergeObserver<Space> for EntityLifecycle {
    async fn merged(&self, previous: Option<Space>, current: &Space) {
        if current.is_deleted {
            if !previous.as_ref().map(|p| p.is_deleted).unwrap_or(false) {
                self.publish(EntityEvent::SpaceStopRequested {
                    space_id: current.id.clone(),
                    zone: current.zone.clone(),
                });
            }
            return;
        }

        let Some(previous) = previous else {
            return;
        };
        if previous.shared_with_user_id != current.shared_with_user_id {
            let affected = [
                Some(&current.user_id),
                previous.shared_with_user_id.as_ref(),
                current.shared_with_user_id.as_ref(),
            ];
            let mut notified: Vec<&String> = Vec::new();
            for user_id in affected.into_iter().flatten() {
                if !notified.contains(&user_id) {
                    notified.push(user_id);
                    self.publish(EntityEvent::SshKeysChanged {
                        user_id: user_id.clone(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl MergeObserver<Volume> for EntityLifecycle {
    async fn merged(&self, previous: Option<Volume>, current: &Volume) {
        let was_running = previous.map(|p| p.active && !p.is_deleted).unwrap_or(false);
        let now_stopped = current.is_deleted || !current.active;
        if was_running && now_stopped {
            self.publish(EntityEvent::VolumeStopRequested {
                volume_id: current.id.clone(),
                zone: current.zone.clone(),
            });
        }
    }
}

#[async_trait]
impl MergeObserver<Script> for EntityLifecycle {
    async fn merged(&self, _previous: Option<Script>, current: &Script) {
        self.publish(EntityEvent::ScriptChanged {
            script_id: current.id.clone(),
        });
    }
}
