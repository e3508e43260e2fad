//! DashMap Entity Store
//!
//! Implements EntityStore using DashMap for lock-free concurrent access.
//! Nothing survives a restart; used by tests and ephemeral nodes.

use crate::domain::entities::Versioned;
use crate::domain::ports::{EntityStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;

/// In-memory store for one entity type, keyed by record id.
pub struct DashMapEntityStore<E> {
    records: DashMap<String, E>,
}

impl<E> DashMapEntityStore<E> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<E> Default for DashMapEntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E> EntityStore<E> for DashMapEntityStore<E>
where
    E: Versioned + Clone + Send + Sync + 'static,
{
    async fn save(&self, entity: &E) -> Result<(), StoreError> {
        self.records.insert(entity.id().to_string(), entity.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<E>, StoreError> {
        Ok(self.records.get(id).map(|e| e.value().clone()))
    }

    async fn get_all(&self) -> Result<Vec<E>, StoreError> {
        Ok(self.records.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete(&self, entity: &E) -> Result<(), StoreError> {
        self.records.remove(entity.id());
        Ok(())
    }
}
