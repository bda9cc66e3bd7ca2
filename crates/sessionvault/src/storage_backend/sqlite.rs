//! Embedded database backend: one `kv_store` table behind an r2d2 pool.
//!
//! A commit is a single SQLite transaction. Overwritten values are copied into
//! `kv_backups` first and the newest `backups_to_keep` copies are retained per key.

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::migration::{self, MigrationManager};
use super::schema::DatabaseStats;
use super::{validate_key, StorageBackend, WriteOp};
use crate::disk_space::DiskGuard;
use crate::error::{Result, StorageError};

type SqlitePool = Pool<SqliteConnectionManager>;

pub struct SqliteBackend {
    pool: Arc<SqlitePool>,
    write_lock: Mutex<()>,
    guard: DiskGuard,
    backups_to_keep: usize,
}

impl SqliteBackend {
    pub fn open(db_path: &Path, guard: DiskGuard, backups_to_keep: usize) -> Result<Self> {
        info!("Opening kv database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder().max_size(8).build(manager)?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        Ok(Self {
            pool: Arc::new(pool),
            write_lock: Mutex::new(()),
            guard,
            backups_to_keep,
        })
    }

    /// Every pooled in-memory connection is its own database, so the pool holds one.
    pub fn open_in_memory(backups_to_keep: usize) -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self {
            pool: Arc::new(pool),
            write_lock: Mutex::new(()),
            guard: DiskGuard::unlimited(),
            backups_to_keep,
        })
    }

    pub async fn stats(&self) -> Result<DatabaseStats> {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok(migration::get_database_stats(&conn)?)
        })
        .await?
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row("SELECT value FROM kv_store WHERE key = ?1", [&key], |row| row.get(0))
                .optional()?)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let _lock = self.write_lock.lock().await;
        let key = key.to_string();
        self.with_conn(move |conn| Ok(conn.execute("DELETE FROM kv_store WHERE key = ?1", [&key])? > 0))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row("SELECT 1 FROM kv_store WHERE key = ?1", [&key], |_| Ok(()))
                .optional()?
                .is_some())
        })
        .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map([&prefix], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        for op in &ops {
            validate_key(op.key())?;
        }
        let growth: u64 = ops.iter().map(WriteOp::growth_bytes).sum();
        self.guard.check(growth.saturating_mul(2))?;

        let _lock = self.write_lock.lock().await;
        let keep = self.backups_to_keep as i64;
        let count = ops.len();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| StorageError::Transaction {
                    phase: "begin",
                    reason: e.to_string(),
                })?;
            for op in &ops {
                match op {
                    WriteOp::Put { key, value } => {
                        if keep > 0 {
                            tx.execute(
                                "INSERT INTO kv_backups (key, value)
                                 SELECT key, value FROM kv_store WHERE key = ?1",
                                [key],
                            )?;
                            tx.execute(
                                "DELETE FROM kv_backups WHERE key = ?1 AND id NOT IN (
                                    SELECT id FROM kv_backups WHERE key = ?1 ORDER BY id DESC LIMIT ?2
                                 )",
                                params![key, keep],
                            )?;
                        }
                        tx.execute(
                            "INSERT INTO kv_store (key, value, updated_at)
                             VALUES (?1, ?2, CURRENT_TIMESTAMP)
                             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                 updated_at = excluded.updated_at",
                            params![key, value],
                        )?;
                    }
                    WriteOp::Delete { key } => {
                        tx.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
                    }
                }
            }
            tx.commit().map_err(|e| StorageError::Transaction {
                phase: "commit",
                reason: e.to_string(),
            })?;
            Ok(())
        })
        .await?;

        debug!("Committed {} ops to kv database", count);
        Ok(())
    }

    async fn load_backup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM kv_backups WHERE key = ?1 ORDER BY id DESC LIMIT 1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_delete() {
        let backend = SqliteBackend::open_in_memory(3).unwrap();
        backend.save("sessions/a/metadata", b"one").await.unwrap();
        assert_eq!(backend.load("sessions/a/metadata").await.unwrap(), Some(b"one".to_vec()));
        assert!(backend.exists("sessions/a/metadata").await.unwrap());

        assert!(backend.delete("sessions/a/metadata").await.unwrap());
        assert!(!backend.delete("sessions/a/metadata").await.unwrap());
        assert_eq!(backend.load("sessions/a/metadata").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let backend = SqliteBackend::open_in_memory(0).unwrap();
        backend
            .commit(vec![
                WriteOp::put("sessions/b/metadata", b"b".to_vec()),
                WriteOp::put("sessions/a/metadata", b"a".to_vec()),
                WriteOp::put("notes/n1", b"n".to_vec()),
            ])
            .await
            .unwrap();

        let keys = backend.list_keys("sessions/").await.unwrap();
        assert_eq!(keys, vec!["sessions/a/metadata", "sessions/b/metadata"]);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_bounded_backups() {
        let backend = SqliteBackend::open_in_memory(2).unwrap();
        for i in 0..5u8 {
            backend.save("k", &[i]).await.unwrap();
        }
        assert_eq!(backend.load_backup("k").await.unwrap(), Some(vec![3]));
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.total_backups, 2);
        assert_eq!(stats.total_keys, 1);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let backend = SqliteBackend::open(&path, DiskGuard::unlimited(), 1).unwrap();
            backend.save("tasks/t1", b"task").await.unwrap();
        }
        let backend = SqliteBackend::open(&path, DiskGuard::unlimited(), 1).unwrap();
        assert_eq!(backend.load("tasks/t1").await.unwrap(), Some(b"task".to_vec()));
    }
}
