//! Key-value repositories
//!
//! Process-wide records (who has voted, and with which receipt) live behind
//! [`KeyValueRepository`] so callers pick the lifetime: in memory for a
//! single run, or SQLite for state that survives restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use rusqlite::{params, Connection, OptionalExtension};

use crate::{StoreError, StoreResult};

/// Key under which a citizen's participation is recorded
pub fn participation_key(citizen_id: &str) -> String {
    format!("voted:{}", citizen_id)
}

pub trait KeyValueRepository {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn put(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Returns whether the key was present
    fn remove(&self, key: &str) -> StoreResult<bool>;

    fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueRepository for MemoryRepository {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.remove(key).is_some())
    }
}

/// Repository backed by a `kv` table. May share a database file with
/// [`crate::BallotStore`].
pub struct SqliteRepository {
    conn: Connection,
}

impl SqliteRepository {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(SqliteRepository { conn })
    }
}

impl KeyValueRepository for SqliteRepository {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?)
    }

    fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn exercise(repo: &dyn KeyValueRepository) {
        assert_eq!(repo.get("voted:alice").unwrap(), None);
        repo.put("voted:alice", "r1").unwrap();
        assert_eq!(repo.get("voted:alice").unwrap().as_deref(), Some("r1"));
        repo.put("voted:alice", "r2").unwrap();
        assert_eq!(repo.get("voted:alice").unwrap().as_deref(), Some("r2"));
        assert!(repo.contains("voted:alice").unwrap());
        assert!(repo.remove("voted:alice").unwrap());
        assert!(!repo.remove("voted:alice").unwrap());
    }

    #[test]
    fn test_memory_repository() {
        exercise(&MemoryRepository::new());
    }

    #[test]
    fn test_sqlite_repository() {
        exercise(&SqliteRepository::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_repository_survives_reopen() {
        let tf = NamedTempFile::new().unwrap();
        SqliteRepository::open(tf.path())
            .unwrap()
            .put(&participation_key("bob"), "receipt")
            .unwrap();

        let reopened = SqliteRepository::open(tf.path()).unwrap();
        assert!(reopened.contains("voted:bob").unwrap());
    }
}
