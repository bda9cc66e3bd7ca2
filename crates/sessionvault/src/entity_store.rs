//! Single-key records (notes, tasks) stored under `<collection>/<id>`.

use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use crate::cache_management::LruCache;
use crate::disk_space::{estimate_json_size, DiskGuard};
use crate::error::Result;
use crate::persistence_queue::{PersistenceQueue, Priority};
use crate::records::Entity;
use crate::storage_backend::{BlobIo, WriteOp};

pub struct EntityStore<T: Entity> {
    io: BlobIo,
    queue: Arc<PersistenceQueue>,
    cache: LruCache,
    guard: DiskGuard,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> EntityStore<T> {
    pub fn new(io: BlobIo, queue: Arc<PersistenceQueue>, cache: LruCache, guard: DiskGuard) -> Self {
        Self {
            io,
            queue,
            cache,
            guard,
            _entity: PhantomData,
        }
    }

    pub fn key(id: &str) -> String {
        format!("{}/{}", T::COLLECTION, id)
    }

    fn prefix() -> String {
        format!("{}/", T::COLLECTION)
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>> {
        let key = Self::key(id);
        if let Some(entity) = self.cache.get_json::<T>(&key) {
            return Ok(Some(entity));
        }
        let ticket = self.cache.fill_ticket(&key);
        let entity: Option<T> = self.io.read_json(&key).await?;
        if let Some(e) = &entity {
            self.cache.fill_json(key, ticket, e);
        }
        Ok(entity)
    }

    /// Validate, stamp `updated_at`, and persist at normal priority.
    pub async fn save(&self, mut entity: T) -> Result<T> {
        entity.validate()?;
        entity.touch();
        self.guard.check(estimate_json_size(&entity)?)?;

        let key = Self::key(entity.entity_id());
        let op = self.io.put_json(key.clone(), &entity)?;
        self.queue.write(Priority::Normal, vec![op]).await?;
        self.cache.insert_json(key, &entity);

        debug!("Saved {} {}", T::COLLECTION, entity.entity_id());
        Ok(entity)
    }

    /// Remove the entity. Returns what was stored, if anything.
    pub async fn delete(&self, id: &str) -> Result<Option<T>> {
        let key = Self::key(id);
        let existing = self.io.read_json::<T>(&key).await?;
        if existing.is_none() && !self.io.backend().exists(&key).await? {
            return Ok(None);
        }

        self.queue.write(Priority::Critical, vec![WriteOp::delete(key.clone())]).await?;
        self.cache.invalidate(&key);
        debug!("Deleted {} {}", T::COLLECTION, id);
        Ok(existing)
    }

    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let prefix = Self::prefix();
        let keys = self.io.backend().list_keys(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .filter(|id| !id.contains('/'))
            .map(str::to_string)
            .collect())
    }

    /// Every stored entity. Unreadable entries are skipped.
    pub async fn load_all(&self) -> Result<Vec<T>> {
        let ids = self.list_ids().await?;
        let loaded = futures::future::join_all(ids.iter().map(|id| self.get(id))).await;
        let mut out = Vec::with_capacity(loaded.len());
        for (id, result) in ids.iter().zip(loaded) {
            match result {
                Ok(Some(entity)) => out.push(entity),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable {} {}: {}", T::COLLECTION, id, e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Codec;
    use crate::error::StorageError;
    use crate::config::{CacheConfig, QueueConfig};
    use crate::records::{Note, Task};
    use crate::storage_backend::{InMemoryBackend, StorageBackend};
    use std::time::Duration;

    fn stores() -> (EntityStore<Note>, EntityStore<Task>, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = PersistenceQueue::start(
            backend.clone(),
            QueueConfig {
                normal_batch_delay: Duration::from_millis(2),
                ..QueueConfig::default()
            },
        );
        let io = BlobIo::new(backend.clone(), Codec::default());
        let cache = LruCache::new(&CacheConfig::default());
        (
            EntityStore::new(io.clone(), queue.clone(), cache.clone(), DiskGuard::unlimited()),
            EntityStore::new(io, queue, cache, DiskGuard::unlimited()),
            backend,
        )
    }

    #[tokio::test]
    async fn test_note_crud() {
        let (notes, _, backend) = stores();
        let saved = notes.save(Note::new("n1", "storage engine ideas")).await.unwrap();
        assert!(backend.exists("notes/n1").await.unwrap());
        assert_eq!(notes.get("n1").await.unwrap().unwrap().content, saved.content);

        let removed = notes.delete("n1").await.unwrap().unwrap();
        assert_eq!(removed.id, "n1");
        assert!(notes.get("n1").await.unwrap().is_none());
        assert!(notes.delete("n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_collections_are_separate() {
        let (notes, tasks, _) = stores();
        notes.save(Note::new("x", "note")).await.unwrap();
        tasks.save(Task::new("x", "task")).await.unwrap();
        tasks.save(Task::new("y", "another")).await.unwrap();

        assert_eq!(notes.list_ids().await.unwrap(), vec!["x"]);
        assert_eq!(tasks.list_ids().await.unwrap(), vec!["x", "y"]);
        assert_eq!(tasks.load_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_task_is_rejected() {
        let (_, tasks, backend) = stores();
        let result = tasks.save(Task::new("t1", "   ")).await;
        assert!(matches!(result, Err(StorageError::InvalidRecord(_))));
        assert!(backend.is_empty());
    }
}
