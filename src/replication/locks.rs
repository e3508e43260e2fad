//! Resource Lock Manager
//!
//! TTL leases on physical resources, replicated to peers of the local zone
//! only. A lock is held until its holder releases it with the matching
//! unlock token or until `expires_after` passes. Locks live in memory; the
//! table is guarded by one reader/writer lock that is never held across a
//! network call.

use crate::domain::entities::ResourceLock;
use crate::domain::ports::{PeerTransport, TransportError};
use crate::replication::codec::{take_within_budget, PayloadCodec};
use crate::replication::dispatch::HandlerRegistry;
use crate::replication::engine::ReplicationError;
use crate::replication::types::{EntityKind, HybridClock, Message, Peer, Topic};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("resource {0} is already locked")]
    AlreadyLocked(String),
    #[error("resource {0} is not locked")]
    NotLocked(String),
    #[error("unlock token does not match the holder of {0}")]
    InvalidToken(String),
    #[error("invalid lock ttl: {0:?}")]
    InvalidTtl(Duration),
}

#[derive(Clone)]
pub struct ResourceLockManager {
    locks: Arc<RwLock<HashMap<String, ResourceLock>>>,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<HybridClock>,
    codec: PayloadCodec,
    payload_budget: usize,
}

impl ResourceLockManager {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        clock: Arc<HybridClock>,
        codec: PayloadCodec,
        payload_budget: usize,
    ) -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
            transport,
            clock,
            codec,
            payload_budget,
        }
    }

    pub fn register(&self, registry: &HandlerRegistry) {
        let this = self.clone();
        registry.handle_func(Topic::gossip(EntityKind::ResourceLock), move |from, payload| {
            let this = this.clone();
            async move { this.handle_gossip(&from, &payload) }
        });

        let this = self.clone();
        registry.handle_func_with_reply(
            Topic::full_sync(EntityKind::ResourceLock),
            move |from, payload| {
                let this = this.clone();
                async move { this.handle_full_sync(&from, &payload) }
            },
        );

        let this = self.clone();
        registry.handle_gossip_func(EntityKind::ResourceLock.as_str(), move || {
            let this = this.clone();
            async move { this.gossip_sample().await }
        });
    }

    /// Take a lease on `resource_id`. Returns the token needed to release it.
    pub async fn lock(&self, resource_id: &str, ttl: Duration) -> Result<String, LockError> {
        let ttl_delta = chrono::Duration::from_std(ttl).map_err(|_| LockError::InvalidTtl(ttl))?;
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl(ttl));
        }

        let now = Utc::now();
        let lock = {
            let mut locks = self.locks.write();
            if let Some(held) = locks.get(resource_id) {
                if !held.is_expired(now) {
                    return Err(LockError::AlreadyLocked(resource_id.to_string()));
                }
            }
            let lock = ResourceLock {
                id: resource_id.to_string(),
                unlock_token: uuid::Uuid::new_v4().to_string(),
                expires_after: now + ttl_delta,
                updated_at: self.clock.now(),
            };
            locks.insert(lock.id.clone(), lock.clone());
            lock
        };

        tracing::debug!("locked {} until {}", lock.id, lock.expires_after);
        self.gossip(&lock).await;
        Ok(lock.unlock_token)
    }

    /// Release a lease early. The released entry expires now and is gossiped
    /// so zone peers drop it too.
    pub async fn unlock(&self, resource_id: &str, unlock_token: &str) -> Result<(), LockError> {
        let now = Utc::now();
        let lock = {
            let mut locks = self.locks.write();
            let held = match locks.get_mut(resource_id) {
                Some(held) if !held.is_expired(now) => held,
                _ => return Err(LockError::NotLocked(resource_id.to_string())),
            };
            if held.unlock_token != unlock_token {
                return Err(LockError::InvalidToken(resource_id.to_string()));
            }
            held.expires_after = now;
            held.updated_at = self.clock.now();
            held.clone()
        };

        tracing::debug!("unlocked {}", lock.id);
        self.gossip(&lock).await;
        Ok(())
    }

    pub fn is_locked(&self, resource_id: &str) -> bool {
        self.get(resource_id).is_some()
    }

    /// The live lease on `resource_id`, if any.
    pub fn get(&self, resource_id: &str) -> Option<ResourceLock> {
        let now = Utc::now();
        self.locks
            .read()
            .get(resource_id)
            .filter(|l| !l.is_expired(now))
            .cloned()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn gc(&self) -> usize {
        let now = Utc::now();
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, l| !l.is_expired(now));
        let removed = before - locks.len();
        if removed > 0 {
            tracing::debug!("collected {} expired locks", removed);
        }
        removed
    }

    fn live_locks(&self, now: DateTime<Utc>) -> Vec<ResourceLock> {
        self.locks
            .read()
            .values()
            .filter(|l| !l.is_expired(now))
            .cloned()
            .collect()
    }

    fn same_zone(&self, from: &Peer) -> bool {
        from.same_zone(&self.transport.local().zone)
    }

    async fn gossip(&self, lock: &ResourceLock) {
        let peers = self.transport.zone_peers();
        if peers.is_empty() {
            return;
        }
        match self.codec.encode(std::slice::from_ref(lock)) {
            Ok(payload) => {
                self.transport
                    .send(&peers, Message::new(Topic::gossip(EntityKind::ResourceLock), payload))
                    .await;
            }
            Err(e) => tracing::error!("failed to encode lock {}: {}", lock.id, e),
        }
    }

    /// Merge remote leases. Expired entries are accepted only as updates to
    /// a lease this node holds, which is how an early release propagates.
    fn merge(&self, batch: Vec<ResourceLock>, from_full_sync: bool) -> usize {
        let now = Utc::now();
        let mut applied = 0;
        let mut locks = self.locks.write();

        for remote in batch {
            self.clock.observe(remote.updated_at);
            let expired = remote.is_expired(now);

            match locks.get(&remote.id) {
                Some(local) if remote.updated_at > local.updated_at => {
                    if expired && from_full_sync {
                        continue;
                    }
                }
                Some(_) => continue,
                None if expired => continue,
                None => {}
            }

            locks.insert(remote.id.clone(), remote);
            applied += 1;
        }

        applied
    }

    pub fn handle_gossip(&self, from: &Peer, payload: &[u8]) {
        if !self.same_zone(from) {
            tracing::warn!("ignoring lock gossip from {} outside zone", from);
            return;
        }
        match self.codec.decode(payload) {
            Ok(batch) => {
                self.merge(batch, false);
            }
            Err(e) => tracing::warn!("discarding lock gossip from {}: {}", from, e),
        }
    }

    /// Reply with live local leases. Requests from another zone get an
    /// empty set and change nothing. The remote set is merged inline since
    /// a lock merge only touches the in-memory table.
    pub fn handle_full_sync(&self, from: &Peer, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let encode = |locks: &[ResourceLock]| {
            self.codec
                .encode(locks)
                .map_err(|e| TransportError::Codec(e.to_string()))
        };

        if !self.same_zone(from) {
            tracing::warn!("refusing lock full sync from {} outside zone", from);
            return encode(&[]);
        }

        let remote: Vec<ResourceLock> = self
            .codec
            .decode(payload)
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let reply = encode(&self.live_locks(Utc::now()))?;
        self.merge(remote, true);
        Ok(reply)
    }

    pub async fn do_full_sync(&self, peer: &Peer) -> Result<usize, ReplicationError> {
        let payload = self.codec.encode(&self.live_locks(Utc::now()))?;
        let response = self
            .transport
            .send_to_with_response(
                peer,
                Message::new(Topic::full_sync(EntityKind::ResourceLock), payload),
            )
            .await?;
        let remote: Vec<ResourceLock> = self.codec.decode(&response)?;
        Ok(self.merge(remote, true))
    }

    pub async fn gossip_sample(&self) {
        let peers = self.transport.zone_peers();
        if peers.is_empty() {
            return;
        }

        let batch = take_within_budget(self.live_locks(Utc::now()), self.payload_budget);
        if batch.is_empty() {
            return;
        }
        match self.codec.encode(&batch) {
            Ok(payload) => {
                self.transport
                    .send(&peers, Message::new(Topic::gossip(EntityKind::ResourceLock), payload))
                    .await;
            }
            Err(e) => tracing::error!("failed to encode lock gossip round: {}", e),
        }
    }
}
