//! Volatile backend used for tests, tooling, and as the last-resort fallback.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{validate_key, StorageBackend, WriteOp};
use crate::error::{Result, StorageError};

const BACKUPS_TO_KEEP: usize = 3;

#[derive(Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, Vec<u8>>,
    backups: DashMap<String, VecDeque<Vec<u8>>>,
    /// Shared by readers, held exclusively while a batch is applied.
    batch_lock: RwLock<()>,
    failures_remaining: AtomicUsize,
    commits: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a retryable backend error.
    pub fn inject_failures(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrite raw bytes without backups, for corrupting data in tests.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), value);
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let _read = self.batch_lock.read().await;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let _lock = self.batch_lock.write().await;
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let _read = self.batch_lock.read().await;
        Ok(self.entries.contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let _read = self.batch_lock.read().await;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        for op in &ops {
            validate_key(op.key())?;
        }
        let _lock = self.batch_lock.write().await;

        if self.take_injected_failure() {
            return Err(StorageError::Backend("injected failure".to_string()));
        }

        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    if let Some(previous) = self.entries.insert(key.clone(), value) {
                        let mut history = self.backups.entry(key).or_default();
                        history.push_front(previous);
                        history.truncate(BACKUPS_TO_KEEP);
                    }
                }
                WriteOp::Delete { key } => {
                    self.entries.remove(&key);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_backup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _read = self.batch_lock.read().await;
        Ok(self
            .backups
            .get(key)
            .and_then(|history| history.front().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_injected_failure_leaves_state_untouched() {
        let backend = InMemoryBackend::new();
        backend.inject_failures(1);

        let ops = vec![WriteOp::put("a", b"1".to_vec()), WriteOp::put("b", b"2".to_vec())];
        assert!(backend.commit(ops.clone()).await.is_err());
        assert!(backend.is_empty());

        backend.commit(ops).await.unwrap();
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_backup_holds_previous_value() {
        let backend = InMemoryBackend::new();
        backend.save("k", b"v1").await.unwrap();
        backend.save("k", b"v2").await.unwrap();
        assert_eq!(backend.load_backup("k").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_a_partial_batch() {
        let backend = Arc::new(InMemoryBackend::new());
        for round in 0..20 {
            let prefix = format!("batch/{}/", round);
            let ops: Vec<WriteOp> = (0..500)
                .map(|i| WriteOp::put(format!("{}{:04}", prefix, i), vec![1]))
                .collect();

            let writer = {
                let backend = backend.clone();
                tokio::spawn(async move { backend.commit(ops).await })
            };
            loop {
                let seen = backend.list_keys(&prefix).await.unwrap().len();
                assert!(seen == 0 || seen == 500, "saw {} of 500 keys", seen);
                let last = backend.exists(&format!("{}0499", prefix)).await.unwrap();
                let first = backend.exists(&format!("{}0000", prefix)).await.unwrap();
                assert!(!last || first);
                if seen == 500 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            writer.await.unwrap().unwrap();
        }
    }
}
