//! Storage backends - key/blob persistence behind one async contract
//!
//! Every backend serializes its writes through a fair async mutex, so operations
//! against one backend instance run one at a time in arrival order.

pub mod blob_io;
pub mod filesystem;
pub mod memory;
pub mod migration;
pub mod schema;
pub mod sqlite;

pub use blob_io::BlobIo;
pub use filesystem::{FileSystemBackend, RecoveryReport};
pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{BackendKind, StorageConfig};
use crate::disk_space::DiskGuard;
use crate::error::{Result, StorageError};

/// One mutation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WriteOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        WriteOp::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        WriteOp::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }

    /// Bytes this op can add to the store.
    pub fn growth_bytes(&self) -> u64 {
        match self {
            WriteOp::Put { value, .. } => value.len() as u64,
            WriteOp::Delete { .. } => 0,
        }
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.commit(vec![WriteOp::put(key, value.to_vec())]).await
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply every op or none of them.
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Most recent verified backup of `key`, if the backend keeps any.
    async fn load_backup(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Staged multi-key write. Nothing reaches the backend before [`Transaction::commit`].
pub struct Transaction {
    backend: Arc<dyn StorageBackend>,
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn begin(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            ops: Vec::new(),
        }
    }

    pub fn save(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::put(key, value));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::delete(key));
        self
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub async fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        debug!("Committing {} ops on {}", self.ops.len(), self.backend.name());
        self.backend.commit(self.ops).await
    }

    pub fn rollback(self) {
        debug!("Rolled back transaction with {} queued ops", self.ops.len());
    }
}

/// Keys are `/`-separated segments of `[A-Za-z0-9._-]`, without `.`/`..` segments.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    for segment in key.split('/') {
        let valid = !segment.is_empty()
            && segment != "."
            && segment != ".."
            && !segment.starts_with('.')
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

/// Build the backend named by the configuration.
///
/// `Auto` prefers the file system and falls back to an in-memory embedded database
/// when the data directory cannot be written.
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let guard = if config.min_free_bytes == 0 {
        DiskGuard::unlimited()
    } else {
        DiskGuard::new(&config.data_dir, config.min_free_bytes)
    };

    match config.backend {
        BackendKind::FileSystem => Ok(Arc::new(FileSystemBackend::open(
            &config.data_dir,
            guard,
            config.backups_to_keep,
        )?)),
        BackendKind::Sqlite => Ok(Arc::new(SqliteBackend::open(
            &config.data_dir.join("sessionvault.db"),
            guard,
            config.backups_to_keep,
        )?)),
        BackendKind::Memory => Ok(Arc::new(InMemoryBackend::new())),
        BackendKind::Auto => {
            if data_dir_is_writable(&config.data_dir) {
                info!("Using file system backend at {}", config.data_dir.display());
                Ok(Arc::new(FileSystemBackend::open(
                    &config.data_dir,
                    guard,
                    config.backups_to_keep,
                )?))
            } else {
                warn!(
                    "Data directory {} is not writable. Falling back to in-memory embedded database.",
                    config.data_dir.display()
                );
                Ok(Arc::new(SqliteBackend::open_in_memory(config.backups_to_keep)?))
            }
        }
    }
}

fn data_dir_is_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".write-probe-{}", uuid::Uuid::new_v4()));
    let ok = std::fs::write(&probe, b"ok").is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}
