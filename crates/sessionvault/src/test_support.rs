//! Backends for exercising interleavings in unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::error::Result;
use crate::storage_backend::{InMemoryBackend, StorageBackend, WriteOp};

/// In-memory backend that, once armed, holds the next read of one key until
/// released. The held read returns what was stored when it began.
pub struct GatedBackend {
    pub inner: InMemoryBackend,
    key: String,
    armed: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedBackend {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            key: key.into(),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.inner.load(key).await?;
        if key == self.key && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_keys(prefix).await
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.inner.commit(ops).await
    }

    async fn load_backup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.load_backup(key).await
    }
}
