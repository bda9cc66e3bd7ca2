//! Chunked record store.
//!
//! A session is persisted as a small metadata blob plus fixed-size chunks of each
//! array field. Chunks load on demand and in parallel. Appends touch one chunk and
//! the metadata only.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::keys;
use crate::cache_management::{FillTicket, LruCache};
use crate::config::ChunkConfig;
use crate::disk_space::{estimate_json_size, DiskGuard};
use crate::error::{Result, StorageError};
use crate::persistence_queue::{PersistenceQueue, Priority, QueueTicket};
use crate::records::{
    AudioSegment, ChunkItem, ChunkManifest, ChunkedField, DetailField, Screenshot, Session,
    SessionMetadata, VideoChunk,
};
use crate::storage_backend::{BlobIo, WriteOp};

pub struct ChunkedStore {
    io: BlobIo,
    queue: Arc<PersistenceQueue>,
    cache: LruCache,
    guard: DiskGuard,
    chunks: ChunkConfig,
    record_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChunkedStore {
    pub fn new(
        io: BlobIo,
        queue: Arc<PersistenceQueue>,
        cache: LruCache,
        guard: DiskGuard,
        chunks: ChunkConfig,
    ) -> Self {
        Self {
            io,
            queue,
            cache,
            guard,
            chunks,
            record_locks: DashMap::new(),
        }
    }

    pub fn chunk_config(&self) -> &ChunkConfig {
        &self.chunks
    }

    pub(crate) fn record_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.record_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry unless another task still holds or awaits it.
    fn release_record_lock(&self, id: &str) {
        self.record_locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    pub(crate) fn record_lock_count(&self) -> usize {
        self.record_locks.len()
    }

    fn chunk_size(&self, field: ChunkedField) -> usize {
        match field {
            ChunkedField::Screenshots => self.chunks.screenshots,
            ChunkedField::AudioSegments => self.chunks.audio_segments,
            ChunkedField::VideoChunks => self.chunks.video_chunks,
        }
    }

    // ===== Metadata =====

    pub async fn load_metadata(&self, id: &str) -> Result<Option<SessionMetadata>> {
        let key = keys::metadata_key(id);
        if let Some(metadata) = self.cache.get_json::<SessionMetadata>(&key) {
            return Ok(Some(metadata));
        }
        let ticket = self.cache.fill_ticket(&key);
        let metadata: Option<SessionMetadata> = self.io.read_json(&key).await?;
        if let Some(m) = &metadata {
            self.cache.fill_json(key, ticket, m);
        }
        Ok(metadata)
    }

    /// Persist metadata at critical priority. The stored version is always one past
    /// the newest version on disk.
    pub async fn save_metadata(&self, metadata: SessionMetadata) -> Result<SessionMetadata> {
        let lock = self.record_lock(metadata.id());
        let _guard = lock.lock().await;
        self.save_metadata_locked(metadata).await
    }

    async fn save_metadata_locked(&self, mut metadata: SessionMetadata) -> Result<SessionMetadata> {
        metadata.validate()?;
        let key = keys::metadata_key(metadata.id());

        let stored_version = self
            .io
            .read_json::<SessionMetadata>(&key)
            .await
            .ok()
            .flatten()
            .map_or(0, |m| m.version);
        metadata.version = stored_version.max(metadata.version) + 1;
        metadata.updated_at = Utc::now();

        self.guard.check(estimate_json_size(&metadata)?)?;
        let op = self.io.put_json(key.clone(), &metadata)?;
        self.queue.write(Priority::Critical, vec![op]).await?;

        self.cache.insert_json(key, &metadata);
        debug!("Saved metadata for session {} (v{})", metadata.id(), metadata.version);
        Ok(metadata)
    }

    pub async fn list_session_ids(&self) -> Result<Vec<String>> {
        let keys = self.io.backend().list_keys(keys::SESSIONS_ROOT).await?;
        Ok(keys
            .iter()
            .filter_map(|k| keys::session_id_from_metadata_key(k))
            .map(str::to_string)
            .collect())
    }

    // ===== Chunks =====

    /// One chunk. A cache hit returns items without inline payloads.
    pub async fn load_chunk<T: ChunkItem>(&self, id: &str, index: usize) -> Result<Vec<T>> {
        let key = keys::chunk_key(id, T::FIELD, index);
        if let Some(items) = self.cache.get_json::<Vec<T>>(&key) {
            return Ok(items);
        }
        let ticket = self.cache.fill_ticket(&key);
        let items = self.read_chunk::<T>(&key).await?;
        self.cache_stripped(key, &items, Some(ticket));
        Ok(items)
    }

    /// One chunk straight from the backend, inline payloads included.
    pub async fn load_chunk_with_payloads<T: ChunkItem>(&self, id: &str, index: usize) -> Result<Vec<T>> {
        self.read_chunk(&keys::chunk_key(id, T::FIELD, index)).await
    }

    /// Every chunk of one field, fetched concurrently and concatenated in order.
    pub async fn load_all_chunks<T: ChunkItem>(&self, id: &str) -> Result<Vec<T>> {
        let Some(metadata) = self.load_metadata(id).await? else {
            return Ok(Vec::new());
        };
        let manifest = *metadata.manifest(T::FIELD);
        let chunks = try_join_all((0..manifest.chunk_count).map(|i| self.load_chunk::<T>(id, i))).await?;
        Ok(self.concat_checked(id, T::FIELD, &manifest, chunks))
    }

    pub async fn load_all_chunks_with_payloads<T: ChunkItem>(&self, id: &str) -> Result<Vec<T>> {
        let Some(metadata) = self.load_metadata(id).await? else {
            return Ok(Vec::new());
        };
        let manifest = *metadata.manifest(T::FIELD);
        let chunks = try_join_all(
            (0..manifest.chunk_count).map(|i| self.load_chunk_with_payloads::<T>(id, i)),
        )
        .await?;
        Ok(self.concat_checked(id, T::FIELD, &manifest, chunks))
    }

    fn concat_checked<T>(
        &self,
        id: &str,
        field: ChunkedField,
        manifest: &ChunkManifest,
        chunks: Vec<Vec<T>>,
    ) -> Vec<T> {
        let items: Vec<T> = chunks.into_iter().flatten().collect();
        if items.len() != manifest.count {
            warn!(
                "Session {} {} manifest says {} items, chunks hold {}",
                id,
                field,
                manifest.count,
                items.len()
            );
        }
        items
    }

    async fn read_chunk<T: ChunkItem>(&self, key: &str) -> Result<Vec<T>> {
        Ok(self.io.read_json::<Vec<T>>(key).await?.unwrap_or_default())
    }

    /// Cache a copy without inline payloads. Reads pass their ticket; writes pass `None`.
    fn cache_stripped<T: ChunkItem>(&self, key: String, items: &[T], ticket: Option<FillTicket>) {
        let mut stripped = items.to_vec();
        let mut removed = 0;
        for item in stripped.iter_mut() {
            if item.strip_payload() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Caching {} with {} payloads stripped", key, removed);
        }
        match ticket {
            Some(ticket) => {
                self.cache.fill_json(key, ticket, &stripped);
            }
            None => self.cache.insert_json(key, &stripped),
        }
    }

    /// Append one item to a chunked field. Appends to the same record never interleave.
    pub async fn append_item<T: ChunkItem>(&self, id: &str, item: T) -> Result<SessionMetadata> {
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;

        self.guard.check(estimate_json_size(&item)?)?;

        let metadata_key = keys::metadata_key(id);
        let mut metadata: SessionMetadata = self
            .io
            .read_json(&metadata_key)
            .await?
            .ok_or_else(|| StorageError::InvalidRecord(format!("unknown session '{}'", id)))?;

        let target = metadata.manifest(T::FIELD).append_target();
        let chunk_key = keys::chunk_key(id, T::FIELD, target);
        let mut chunk: Vec<T> = self.read_chunk(&chunk_key).await?;
        chunk.push(item);

        let op = self.io.put_json(chunk_key.clone(), &chunk)?;
        self.queue.write(Priority::Normal, vec![op]).await?;
        self.cache_stripped(chunk_key, &chunk, None);

        metadata.manifest_mut(T::FIELD).record_append();
        self.save_metadata_locked(metadata).await
    }

    // ===== Full records =====

    /// Split a full session into chunks, details and metadata. Chunks and details are
    /// written before the metadata that points at them.
    pub async fn save_full_record(&self, session: &Session) -> Result<SessionMetadata> {
        session.info.validate()?;
        let id = session.info.id.as_str();
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;

        self.guard.check(estimate_json_size(session)?)?;

        let previous: Option<SessionMetadata> = self.io.read_json(&keys::metadata_key(id)).await?;
        let mut metadata = SessionMetadata::new(session.info.clone(), &self.chunks);
        if let Some(prev) = &previous {
            metadata.version = prev.version;
        }

        let mut ops: Vec<WriteOp> = Vec::new();
        let mut cached_chunks: Vec<(String, Vec<u8>)> = Vec::new();

        self.split_field(id, &session.screenshots, previous.as_ref(), &mut metadata, &mut ops, &mut cached_chunks)?;
        self.split_field(id, &session.audio_segments, previous.as_ref(), &mut metadata, &mut ops, &mut cached_chunks)?;
        self.split_field(id, &session.video_chunks, previous.as_ref(), &mut metadata, &mut ops, &mut cached_chunks)?;

        let details = session.details()?;
        for field in DetailField::ALL {
            let key = keys::detail_key(id, field);
            match details.iter().find(|(f, _)| *f == field) {
                Some((_, value)) => {
                    ops.push(self.io.put_json(key, value)?);
                    metadata.set_detail(field, true);
                }
                None if previous.as_ref().is_some_and(|p| p.has_detail(field)) => {
                    ops.push(WriteOp::delete(key));
                }
                None => {}
            }
        }

        let tickets: Vec<QueueTicket> = self
            .queue
            .enqueue_batch(ops.into_iter().map(|op| (Priority::Normal, vec![op])).collect())?;
        for ticket in tickets {
            ticket.wait().await?;
        }

        self.cache.invalidate_prefix(&keys::session_prefix(id));
        for (key, payload) in cached_chunks {
            self.cache.insert(key, payload);
        }

        let saved = self.save_metadata_locked(metadata).await?;
        info!(
            "Saved session {}: {} screenshots, {} audio segments, {} video chunks",
            id, saved.screenshots.count, saved.audio_segments.count, saved.video_chunks.count
        );
        Ok(saved)
    }

    fn split_field<T: ChunkItem>(
        &self,
        id: &str,
        items: &[T],
        previous: Option<&SessionMetadata>,
        metadata: &mut SessionMetadata,
        ops: &mut Vec<WriteOp>,
        cached: &mut Vec<(String, Vec<u8>)>,
    ) -> Result<()> {
        let manifest = ChunkManifest::for_count(items.len(), self.chunk_size(T::FIELD));
        for (index, chunk) in items.chunks(manifest.chunk_size).enumerate() {
            let key = keys::chunk_key(id, T::FIELD, index);
            ops.push(self.io.put_json(key.clone(), chunk)?);

            let mut stripped = chunk.to_vec();
            stripped.iter_mut().for_each(|item| {
                item.strip_payload();
            });
            cached.push((key, serde_json::to_vec(&stripped)?));
        }

        // Chunks past the new end belonged to a longer previous version.
        if let Some(prev) = previous {
            for index in manifest.chunk_count..prev.manifest(T::FIELD).chunk_count {
                ops.push(WriteOp::delete(keys::chunk_key(id, T::FIELD, index)));
            }
        }

        *metadata.manifest_mut(T::FIELD) = manifest;
        Ok(())
    }

    pub async fn load_full_record(&self, id: &str) -> Result<Option<Session>> {
        let Some(metadata) = self.load_metadata(id).await? else {
            return Ok(None);
        };

        let (screenshots, audio_segments, video_chunks) = tokio::try_join!(
            self.load_all_chunks_with_payloads::<Screenshot>(id),
            self.load_all_chunks_with_payloads::<AudioSegment>(id),
            self.load_all_chunks_with_payloads::<VideoChunk>(id),
        )?;

        let mut session = Session::new(metadata.info.clone());
        session.screenshots = screenshots;
        session.audio_segments = audio_segments;
        session.video_chunks = video_chunks;

        for field in DetailField::ALL.into_iter().filter(|f| metadata.has_detail(*f)) {
            match self.load_detail(id, field).await? {
                Some(value) => session.set_detail(field, value)?,
                None => warn!("Session {} flags {} but it is missing", id, field.as_str()),
            }
        }
        Ok(Some(session))
    }

    pub async fn load_detail(&self, id: &str, field: DetailField) -> Result<Option<serde_json::Value>> {
        let key = keys::detail_key(id, field);
        if let Some(value) = self.cache.get_json(&key) {
            return Ok(Some(value));
        }
        let ticket = self.cache.fill_ticket(&key);
        let value: Option<serde_json::Value> = self.io.read_json(&key).await?;
        if let Some(v) = &value {
            self.cache.fill_json(key, ticket, v);
        }
        Ok(value)
    }

    /// Write one detail value (or remove it with `None`) and update the metadata flag.
    pub async fn save_detail(
        &self,
        id: &str,
        field: DetailField,
        value: Option<serde_json::Value>,
    ) -> Result<SessionMetadata> {
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;

        let mut metadata: SessionMetadata = self
            .io
            .read_json(&keys::metadata_key(id))
            .await?
            .ok_or_else(|| StorageError::InvalidRecord(format!("unknown session '{}'", id)))?;

        let key = keys::detail_key(id, field);
        let op = match &value {
            Some(v) => {
                self.guard.check(estimate_json_size(v)?)?;
                self.io.put_json(key.clone(), v)?
            }
            None => WriteOp::delete(key.clone()),
        };
        self.queue.write(Priority::Normal, vec![op]).await?;
        self.cache.invalidate(&key);

        metadata.set_detail(field, value.is_some());
        self.save_metadata_locked(metadata).await
    }

    /// Remove metadata, chunks and details in one transaction. Returns the removed metadata.
    pub async fn delete_record(&self, id: &str) -> Result<Option<SessionMetadata>> {
        let lock = self.record_lock(id);
        let _guard = lock.lock().await;

        // Unreadable metadata reads as None; the keys below are still removed.
        let metadata: Option<SessionMetadata> = self.io.read_json(&keys::metadata_key(id)).await?;

        let prefix = keys::session_prefix(id);
        let keys = self.io.backend().list_keys(&prefix).await?;
        if keys.is_empty() {
            return Ok(None);
        }

        let ops: Vec<WriteOp> = keys.into_iter().map(WriteOp::delete).collect();
        let count = ops.len();
        self.queue.write(Priority::Critical, ops).await?;
        self.cache.invalidate_prefix(&prefix);
        drop(_guard);
        drop(lock);
        self.release_record_lock(id);

        info!("Deleted session {} ({} keys)", id, count);
        Ok(metadata)
    }
}
