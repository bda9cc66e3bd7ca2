//! Storage engine facade.
//!
//! Wires one backend, one persistence queue, one cache and the disk guard into the
//! record, attachment, entity and index components, and keeps them consistent:
//! attachment references follow the records that hold them, and every record
//! write is mirrored into the unified index. Index maintenance is best effort;
//! record writes are not.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache_management::{CacheStats, LruCache};
use crate::chunked_store::ChunkedStore;
use crate::compression::Codec;
use crate::config::{BackendKind, StorageConfig};
use crate::content_store::{
    AttachmentMetadata, AttachmentPayload, AttachmentTypeCounts, CasStats, ContentStore, GcReport,
};
use crate::disk_space::{DiskGuard, DiskSpaceInfo};
use crate::entity_store::EntityStore;
use crate::error::{Result, StorageError};
use crate::index_engine::{
    check_collection, EntityKind, EntityRef, IndexDoc, Indexable, IntegrityReport, Query, QueryEngine,
    QueryResult, RecordSource, SessionQueryFilters, UnifiedIndex,
};
use crate::metrics;
use crate::persistence_queue::{PersistenceQueue, QueueEvent, QueueStats};
use crate::records::{ChunkItem, DetailField, Note, Session, SessionMetadata, SessionSummaryView, Task, Video};
use crate::storage_backend::{open_backend, BlobIo, StorageBackend};

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub backend: &'static str,
    pub sessions: usize,
    pub notes: usize,
    pub tasks: usize,
    pub queue: QueueStats,
    pub cache: CacheStats,
    pub attachments: CasStats,
    pub attachment_types: AttachmentTypeCounts,
    pub disk: Option<DiskSpaceInfo>,
    pub index_errors: u64,
}

pub struct StorageEngine {
    backend: Arc<dyn StorageBackend>,
    io: BlobIo,
    queue: Arc<PersistenceQueue>,
    cache: LruCache,
    guard: DiskGuard,
    records: ChunkedStore,
    attachments: ContentStore,
    notes: EntityStore<Note>,
    tasks: EntityStore<Task>,
    index: Arc<UnifiedIndex>,
    query: QueryEngine,
    index_errors: AtomicU64,
}

impl StorageEngine {
    /// Open the backend named by `config` and bring every component up.
    pub async fn open(config: StorageConfig) -> Result<Self> {
        let backend = open_backend(&config)?;
        Self::with_backend(config, backend).await
    }

    pub async fn with_backend(config: StorageConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        metrics::init_metrics();

        let guard = if config.min_free_bytes == 0 || config.backend == BackendKind::Memory {
            DiskGuard::unlimited()
        } else {
            DiskGuard::new(&config.data_dir, config.min_free_bytes)
        };
        let io = BlobIo::new(Arc::clone(&backend), Codec::new(config.compression_threshold));
        let queue = PersistenceQueue::start(Arc::clone(&backend), config.queue.clone());
        let cache = LruCache::new(&config.cache);

        let records = ChunkedStore::new(
            io.clone(),
            Arc::clone(&queue),
            cache.clone(),
            guard.clone(),
            config.chunks.clone(),
        );
        let attachments = ContentStore::open(io.clone(), Arc::clone(&queue), cache.clone(), guard.clone()).await?;
        let notes = EntityStore::new(io.clone(), Arc::clone(&queue), cache.clone(), guard.clone());
        let tasks = EntityStore::new(io.clone(), Arc::clone(&queue), cache.clone(), guard.clone());
        let index = Arc::new(UnifiedIndex::new());

        let engine = Self {
            backend,
            io,
            queue,
            cache,
            guard,
            records,
            attachments,
            notes,
            tasks,
            query: QueryEngine::new(Arc::clone(&index)),
            index,
            index_errors: AtomicU64::new(0),
        };
        engine.spawn_event_logger();
        engine.load_indexes().await?;

        info!("Storage engine ready on {} backend", engine.backend.name());
        Ok(engine)
    }

    fn spawn_event_logger(&self) {
        let mut events = self.queue.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    QueueEvent::Failed {
                        priority,
                        retries,
                        keys,
                        reason,
                        ..
                    } => error!(
                        "{} write of {} key(s) failed after {} retries: {}",
                        priority.as_str(),
                        keys.len(),
                        retries,
                        reason
                    ),
                    QueueEvent::Dropped { keys, .. } => {
                        warn!("Dropped low-priority write of {} key(s) on overflow", keys.len())
                    }
                }
            }
        });
    }

    async fn load_indexes(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            let manager = self.index.manager(kind);
            if !manager.restore(&self.io).await? {
                info!("No usable {} indexes on disk, rebuilding", kind);
                self.rebuild_collection(kind).await?;
            }
        }
        // Relationships are not persisted; derive them from the records.
        for kind in EntityKind::ALL {
            let docs = self.collection_docs(kind).await?;
            self.index.relink(kind, &docs);
        }
        Ok(())
    }

    async fn rebuild_collection(&self, kind: EntityKind) -> Result<()> {
        let docs = self.collection_docs(kind).await?;
        self.index.build(kind, &docs);
        self.persist_collection(kind);
        Ok(())
    }

    /// Rebuild every index from the stored records.
    pub async fn rebuild_indexes(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            self.rebuild_collection(kind).await?;
        }
        Ok(())
    }

    async fn collection_docs(&self, kind: EntityKind) -> Result<Vec<IndexDoc>> {
        Ok(match kind {
            EntityKind::Session => {
                let mut docs = Vec::new();
                for id in self.records.list_session_ids().await? {
                    match self.records.load_metadata(&id).await {
                        Ok(Some(metadata)) => docs.push(metadata.index_doc()),
                        Ok(None) => {}
                        Err(e) => warn!("Skipping session {} while indexing: {}", id, e),
                    }
                }
                docs
            }
            EntityKind::Note => self.notes.load_all().await?.iter().map(Indexable::index_doc).collect(),
            EntityKind::Task => self.tasks.load_all().await?.iter().map(Indexable::index_doc).collect(),
        })
    }

    fn index_failed(&self, what: &str, e: &StorageError) {
        self.index_errors.fetch_add(1, Ordering::Relaxed);
        metrics::inc_index_error();
        error!("Index maintenance failed ({}): {}", what, e);
    }

    fn persist_collection(&self, kind: EntityKind) {
        if let Err(e) = self.index.manager(kind).persist(&self.io, &self.queue) {
            self.index_failed(kind.collection(), &e);
        }
    }

    fn index_upsert(&self, doc: IndexDoc) {
        let kind = doc.kind;
        self.index.upsert(&doc);
        self.persist_collection(kind);
    }

    fn index_remove(&self, kind: EntityKind, id: &str) {
        self.index.remove(kind, id);
        self.persist_collection(kind);
    }

    // ===== Sessions =====

    pub async fn save_metadata(&self, metadata: SessionMetadata) -> Result<SessionMetadata> {
        let saved = self.records.save_metadata(metadata).await?;
        self.index_upsert(saved.index_doc());
        Ok(saved)
    }

    pub async fn load_metadata(&self, id: &str) -> Result<Option<SessionMetadata>> {
        self.records.load_metadata(id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>> {
        let mut out = Vec::new();
        for id in self.records.list_session_ids().await? {
            if let Some(metadata) = self.records.load_metadata(&id).await? {
                out.push(metadata);
            }
        }
        Ok(out)
    }

    /// List-view rows, newest session first.
    pub async fn session_summaries(&self) -> Result<Vec<SessionSummaryView>> {
        let mut sessions = self.list_sessions().await?;
        sessions.sort_by(|a, b| b.info.start_time.cmp(&a.info.start_time));
        Ok(sessions.iter().map(SessionMetadata::summary_view).collect())
    }

    /// Append one item to a chunked field. An item pointing at an attachment adds a
    /// reference for this session first, and a failed append takes it back.
    pub async fn append_item<T: ChunkItem>(&self, session_id: &str, item: T) -> Result<SessionMetadata> {
        if self.records.load_metadata(session_id).await?.is_none() {
            return Err(StorageError::InvalidRecord(format!("unknown session '{}'", session_id)));
        }
        let referenced = match item.attachment_hash() {
            Some(hash) => {
                let added = self.attachments.add_reference(hash, session_id, item.item_id()).await?;
                added.then(|| hash.to_string())
            }
            None => None,
        };

        match self.records.append_item(session_id, item).await {
            Ok(saved) => {
                self.index_upsert(saved.index_doc());
                Ok(saved)
            }
            Err(e) => {
                if let Some(hash) = referenced {
                    if let Err(undo) = self.attachments.remove_reference(&hash, session_id).await {
                        warn!("Failed to take back reference on {} for {}: {}", hash, session_id, undo);
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn session_count(&self) -> Result<usize> {
        Ok(self.records.list_session_ids().await?.len())
    }

    pub async fn load_chunk<T: ChunkItem>(&self, session_id: &str, index: usize) -> Result<Vec<T>> {
        self.records.load_chunk(session_id, index).await
    }

    pub async fn load_all_chunks<T: ChunkItem>(&self, session_id: &str) -> Result<Vec<T>> {
        self.records.load_all_chunks(session_id).await
    }

    pub async fn load_all_chunks_with_payloads<T: ChunkItem>(&self, session_id: &str) -> Result<Vec<T>> {
        self.records.load_all_chunks_with_payloads(session_id).await
    }

    /// Save a whole session. Attachment references are reconciled with the hashes the
    /// previous version held.
    pub async fn save_full_record(&self, session: &Session) -> Result<SessionMetadata> {
        let id = session.info.id.as_str();
        let before = self.stored_attachment_hashes(id).await?;
        let after: BTreeSet<String> = session.attachment_hashes().into_iter().collect();

        for hash in after.difference(&before) {
            let attachment_id = attachment_id_for(session, hash);
            self.attachments.add_reference(hash, id, &attachment_id).await?;
        }

        let saved = self.records.save_full_record(session).await?;

        for hash in before.difference(&after) {
            self.attachments.remove_reference(hash, id).await?;
        }
        self.index_upsert(saved.index_doc());
        Ok(saved)
    }

    pub async fn load_full_record(&self, id: &str) -> Result<Option<Session>> {
        self.records.load_full_record(id).await
    }

    pub async fn load_detail(&self, id: &str, field: DetailField) -> Result<Option<serde_json::Value>> {
        self.records.load_detail(id, field).await
    }

    pub async fn save_detail(
        &self,
        id: &str,
        field: DetailField,
        value: Option<serde_json::Value>,
    ) -> Result<SessionMetadata> {
        let saved = self.records.save_detail(id, field, value).await?;
        self.index_upsert(saved.index_doc());
        Ok(saved)
    }

    /// Delete a session, release its attachment references, and drop it from the indexes.
    pub async fn delete_record(&self, id: &str) -> Result<Option<SessionMetadata>> {
        let hashes = self.stored_attachment_hashes(id).await?;
        let removed = self.records.delete_record(id).await?;
        if removed.is_none() && hashes.is_empty() {
            if self.index.manager(EntityKind::Session).contains(id) {
                self.index_remove(EntityKind::Session, id);
            }
            return Ok(None);
        }
        for hash in &hashes {
            self.attachments.remove_reference(hash, id).await?;
        }
        self.index_remove(EntityKind::Session, id);
        info!("Deleted session {} and released {} attachment(s)", id, hashes.len());
        Ok(removed)
    }

    async fn stored_attachment_hashes(&self, id: &str) -> Result<BTreeSet<String>> {
        let Some(metadata) = self.records.load_metadata(id).await? else {
            return Ok(BTreeSet::new());
        };
        let (screenshots, audio, video_chunks) = tokio::try_join!(
            self.records.load_all_chunks::<crate::records::Screenshot>(id),
            self.records.load_all_chunks::<crate::records::AudioSegment>(id),
            self.records.load_all_chunks::<crate::records::VideoChunk>(id),
        )?;

        let mut hashes: BTreeSet<String> = screenshots
            .iter()
            .filter_map(|s| s.attachment_hash().map(str::to_string))
            .chain(audio.iter().filter_map(|a| a.attachment_hash().map(str::to_string)))
            .chain(video_chunks.iter().filter_map(|v| v.attachment_hash().map(str::to_string)))
            .collect();
        if metadata.has_video {
            if let Some(value) = self.records.load_detail(id, DetailField::Video).await? {
                match serde_json::from_value::<Video>(value) {
                    Ok(video) => hashes.extend(video.attachment_hash),
                    Err(e) => warn!("Session {} has an unreadable video detail: {}", id, e),
                }
            }
        }
        Ok(hashes)
    }

    // ===== Attachments =====

    pub async fn put_attachment(&self, payload: impl Into<AttachmentPayload>, mime_type: &str) -> Result<String> {
        self.attachments.put(payload, mime_type).await
    }

    pub async fn get_attachment(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        self.attachments.get(hash).await
    }

    pub async fn attachment_exists(&self, hash: &str) -> Result<bool> {
        self.attachments.exists(hash).await
    }

    pub async fn attachment_metadata_many(&self, hashes: &[String]) -> Result<HashMap<String, AttachmentMetadata>> {
        self.attachments.get_metadata_many(hashes).await
    }

    pub async fn attachments_exist(&self, hashes: &[String]) -> Result<Vec<String>> {
        self.attachments.exists_many(hashes).await
    }

    pub async fn attachment_counts_by_type(&self) -> Result<AttachmentTypeCounts> {
        self.attachments.counts_by_type().await
    }

    pub async fn attachment_metadata(&self, hash: &str) -> Result<Option<AttachmentMetadata>> {
        self.attachments.get_metadata(hash).await
    }

    pub async fn add_reference(&self, hash: &str, session_id: &str, attachment_id: &str) -> Result<bool> {
        self.attachments.add_reference(hash, session_id, attachment_id).await
    }

    pub async fn remove_reference(&self, hash: &str, session_id: &str) -> Result<usize> {
        self.attachments.remove_reference(hash, session_id).await
    }

    pub async fn collect_garbage(&self) -> Result<GcReport> {
        self.attachments.collect_garbage().await
    }

    pub async fn attachment_stats(&self) -> Result<CasStats> {
        self.attachments.get_stats().await
    }

    // ===== Notes and tasks =====

    pub async fn save_note(&self, note: Note) -> Result<Note> {
        let saved = self.notes.save(note).await?;
        self.index_upsert(saved.index_doc());
        Ok(saved)
    }

    pub async fn get_note(&self, id: &str) -> Result<Option<Note>> {
        self.notes.get(id).await
    }

    pub async fn delete_note(&self, id: &str) -> Result<Option<Note>> {
        let removed = self.notes.delete(id).await?;
        self.index_remove(EntityKind::Note, id);
        Ok(removed)
    }

    pub async fn list_notes(&self) -> Result<Vec<Note>> {
        self.notes.load_all().await
    }

    pub async fn save_task(&self, task: Task) -> Result<Task> {
        let saved = self.tasks.save(task).await?;
        self.index_upsert(saved.index_doc());
        Ok(saved)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.tasks.get(id).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<Option<Task>> {
        let removed = self.tasks.delete(id).await?;
        self.index_remove(EntityKind::Task, id);
        Ok(removed)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.tasks.load_all().await
    }

    // ===== Search =====

    pub async fn query(&self, query: &Query) -> Result<QueryResult> {
        self.query.execute(query, self).await
    }

    pub async fn query_sessions(&self, filters: SessionQueryFilters) -> Result<QueryResult> {
        let query = filters.into_query()?;
        self.query(&query).await
    }

    pub fn related(&self, start: &EntityRef, max_depth: usize) -> Vec<(EntityRef, usize)> {
        self.index.related(start, max_depth)
    }

    pub fn search_text(&self, text: &str) -> Vec<EntityRef> {
        self.index.search_text(text)
    }

    /// Compare every index with the stored records. Never modifies anything.
    pub async fn check_index(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport {
            collection: "all".to_string(),
            ..IntegrityReport::default()
        };
        for kind in EntityKind::ALL {
            let docs = self.collection_docs(kind).await?;
            let snapshot = self.index.manager(kind).snapshot();
            report.merge(check_collection(kind, &snapshot, &docs));
        }
        if report.is_healthy() {
            info!("Index check passed: {} records, {} warnings", report.checked, report.warnings.len());
        } else {
            warn!("Index check found {} errors", report.errors.len());
        }
        Ok(report)
    }

    // ===== Lifecycle =====

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn queue(&self) -> &Arc<PersistenceQueue> {
        &self.queue
    }

    pub fn index_error_count(&self) -> u64 {
        self.index_errors.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let counts = self.index.counts();
        let disk = match self.guard.info() {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("Disk space unavailable: {}", e);
                None
            }
        };
        Ok(EngineStats {
            backend: self.backend.name(),
            sessions: counts.get(&EntityKind::Session).copied().unwrap_or_default(),
            notes: counts.get(&EntityKind::Note).copied().unwrap_or_default(),
            tasks: counts.get(&EntityKind::Task).copied().unwrap_or_default(),
            queue: self.queue.stats(),
            cache: self.cache.stats(),
            attachments: self.attachments.get_stats().await?,
            attachment_types: self.attachments.counts_by_type().await?,
            disk,
            index_errors: self.index_error_count(),
        })
    }

    /// Wait until every queued write, index persistence included, has executed.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Persist indexes, drain the queue, and stop its worker.
    pub async fn shutdown(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            self.persist_collection(kind);
        }
        self.queue.shutdown().await
    }
}

fn attachment_id_for(session: &Session, hash: &str) -> String {
    let matches = |h: Option<&str>| h == Some(hash);
    session
        .screenshots
        .iter()
        .find(|s| matches(s.attachment_hash()))
        .and_then(|s| s.attachment_id.clone().or_else(|| Some(s.id.clone())))
        .or_else(|| {
            session
                .audio_segments
                .iter()
                .find(|a| matches(a.attachment_hash()))
                .and_then(|a| a.attachment_id.clone().or_else(|| Some(a.id.clone())))
        })
        .or_else(|| {
            session
                .video_chunks
                .iter()
                .find(|v| matches(v.attachment_hash()))
                .and_then(|v| v.attachment_id.clone().or_else(|| Some(v.id.clone())))
        })
        .or_else(|| session.video.as_ref().and_then(|v| v.full_video_attachment_id.clone()))
        .unwrap_or_else(|| hash.to_string())
}

#[async_trait]
impl RecordSource for StorageEngine {
    async fn load_docs(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<IndexDoc>> {
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            let doc = match kind {
                EntityKind::Session => self.records.load_metadata(id).await?.map(|m| m.index_doc()),
                EntityKind::Note => self.notes.get(id).await?.map(|n| n.index_doc()),
                EntityKind::Task => self.tasks.get(id).await?.map(|t| t.index_doc()),
            };
            match doc {
                Some(d) => docs.push(d),
                None => debug!("Indexed {}/{} has no record", kind, id),
            }
        }
        Ok(docs)
    }
}
