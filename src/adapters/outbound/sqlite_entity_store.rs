//! SQLite Entity Store
//!
//! Implements EntityStore on a local SQLite file. Each entity kind gets its
//! own table holding the id, the HLC columns, the tombstone flag and the
//! record itself as JSON. Statements run on the blocking pool.

use crate::domain::ports::{EntityStore, StoreError};
use crate::replication::entity::Replicated;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

/// Shared handle to one SQLite database.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    /// Create the table for `E` if missing and return its store.
    pub fn store<E: Replicated>(&self) -> Result<SqliteEntityStore<E>> {
        let table = E::KIND.as_str();
        self.conn.lock().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                wall_time INTEGER NOT NULL,
                counter INTEGER NOT NULL,
                node_hash INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_deleted ON {table}(is_deleted);"
        ))?;
        Ok(SqliteEntityStore {
            conn: self.conn.clone(),
            table,
            _entity: PhantomData,
        })
    }
}

pub struct SqliteEntityStore<E> {
    conn: Arc<Mutex<Connection>>,
    table: &'static str,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Replicated> SqliteEntityStore<E> {
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &'static str) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let table = self.table;
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard, table)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {}", e)))?
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decode<E: Replicated>(id: &str, body: &str) -> Result<E, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Codec {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl<E: Replicated> EntityStore<E> for SqliteEntityStore<E> {
    async fn save(&self, entity: &E) -> Result<(), StoreError> {
        let id = entity.id().to_string();
        let ts = entity.updated_at();
        let deleted = entity.is_deleted();
        let body = serde_json::to_string(entity).map_err(|e| StoreError::Codec {
            id: id.clone(),
            reason: e.to_string(),
        })?;

        self.blocking(move |conn, table| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (id, wall_time, counter, node_hash, is_deleted, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        wall_time = excluded.wall_time,
                        counter = excluded.counter,
                        node_hash = excluded.node_hash,
                        is_deleted = excluded.is_deleted,
                        body = excluded.body"
                ),
                params![
                    id,
                    ts.wall_time as i64,
                    ts.counter as i64,
                    ts.node_hash as i64,
                    deleted,
                    body
                ],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<E>, StoreError> {
        let id = id.to_string();
        self.blocking(move |conn, table| {
            let body: Option<String> = conn
                .query_row(
                    &format!("SELECT body FROM {table} WHERE id = ?1"),
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend)?;
            body.map(|b| decode(&id, &b)).transpose()
        })
        .await
    }

    async fn get_all(&self) -> Result<Vec<E>, StoreError> {
        self.blocking(|conn, table| {
            let mut stmt = conn
                .prepare(&format!("SELECT id, body FROM {table}"))
                .map_err(backend)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(backend)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend)?;

            let mut records = Vec::with_capacity(rows.len());
            for (id, body) in rows {
                match decode(&id, &body) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("skipping unreadable {} record: {}", table, e),
                }
            }
            Ok(records)
        })
        .await
    }

    async fn delete(&self, entity: &E) -> Result<(), StoreError> {
        let id = entity.id().to_string();
        self.blocking(move |conn, table| {
            conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])
                .map_err(backend)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{Session, User, Versioned};
    use crate::replication::types::HLCTimestamp;

    #[tokio::test]
    async fn test_save_get_and_overwrite() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let users = db.store::<User>().unwrap();

        let mut user = User { id: "u1".into(), username: "ada".into(), ..Default::default() };
        users.save(&user).await.unwrap();

        user.username = "grace".into();
        user.stamp(HLCTimestamp { wall_time: 7, counter: 1, node_hash: 3 });
        users.save(&user).await.unwrap();

        let stored = users.get("u1").await.unwrap().unwrap();
        assert_eq!(stored, user);
        assert_eq!(users.get_all().await.unwrap().len(), 1);
        assert!(users.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tables_are_per_kind() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let users = db.store::<User>().unwrap();
        let sessions = db.store::<Session>().unwrap();

        users.save(&User { id: "x".into(), ..Default::default() }).await.unwrap();
        assert!(sessions.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tombstone_listed_then_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::open(dir.path().join("state.db")).unwrap();
        let users = db.store::<User>().unwrap();

        let mut user = User { id: "u1".into(), ..Default::default() };
        user.tombstone(HLCTimestamp { wall_time: 9, counter: 0, node_hash: 0 });
        users.save(&user).await.unwrap();
        assert!(users.get_all().await.unwrap()[0].is_deleted);

        users.delete(&user).await.unwrap();
        assert!(users.get_all().await.unwrap().is_empty());
    }
}
