//! Content-addressable attachment store with reference counting.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::canonical::{content_hash, is_valid_hash, AttachmentPayload};
use crate::cache_management::LruCache;
use crate::disk_space::DiskGuard;
use crate::error::Result;
use crate::metrics;
use crate::persistence_queue::{PersistenceQueue, Priority};
use crate::storage_backend::{BlobIo, WriteOp};

pub const CAS_ROOT: &str = "attachments-ca/";
pub const HASH_INDEX_KEY: &str = "attachments-ca/hash-index";
const DEFAULT_MIME: &str = "application/octet-stream";

pub fn data_key(hash: &str) -> String {
    format!("{}{}/{}/data", CAS_ROOT, &hash[..2], hash)
}

pub fn metadata_key(hash: &str) -> String {
    format!("{}{}/{}/metadata", CAS_ROOT, &hash[..2], hash)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentReference {
    pub session_id: String,
    pub attachment_id: String,
    pub added_at: DateTime<Utc>,
}

/// `ref_count` always equals `references.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    pub hash: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub references: Vec<AttachmentReference>,
    #[serde(default)]
    pub ref_count: usize,
}

impl AttachmentMetadata {
    fn sync_ref_count(&mut self) {
        self.ref_count = self.references.len();
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub scanned: usize,
    pub deleted: usize,
    pub freed_bytes: u64,
    pub errors: Vec<String>,
}

/// Attachment counts grouped by the top-level MIME type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentTypeCounts {
    pub total: usize,
    pub images: usize,
    pub video: usize,
    pub audio: usize,
    pub other: usize,
}

impl AttachmentTypeCounts {
    fn record(&mut self, mime_type: &str) {
        self.total += 1;
        match mime_type.split('/').next().unwrap_or_default().trim() {
            "image" => self.images += 1,
            "video" => self.video += 1,
            "audio" => self.audio += 1,
            _ => self.other += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CasStats {
    pub total_attachments: usize,
    pub total_references: usize,
    pub total_size: u64,
    pub unreferenced: usize,
    /// Bytes not stored thanks to deduplication.
    pub dedup_saved_bytes: u64,
}

pub struct ContentStore {
    io: BlobIo,
    queue: Arc<PersistenceQueue>,
    cache: LruCache,
    guard: DiskGuard,
    hash_index: RwLock<BTreeSet<String>>,
    hash_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ContentStore {
    /// Load the hash index and reconcile it with the metadata actually stored.
    pub async fn open(
        io: BlobIo,
        queue: Arc<PersistenceQueue>,
        cache: LruCache,
        guard: DiskGuard,
    ) -> Result<Self> {
        let store = Self {
            io,
            queue,
            cache,
            guard,
            hash_index: RwLock::new(BTreeSet::new()),
            hash_locks: DashMap::new(),
        };

        let persisted: Option<BTreeSet<String>> = match store.io.read_json::<Vec<String>>(HASH_INDEX_KEY).await {
            Ok(hashes) => hashes.map(|h| h.into_iter().collect()),
            Err(e) => {
                warn!("Attachment hash index unreadable ({}), rebuilding from metadata", e);
                None
            }
        };
        let scanned: BTreeSet<String> = store.scan_hashes().await?.into_iter().collect();
        let stale = match &persisted {
            Some(listed) if *listed == scanned => false,
            Some(listed) => {
                warn!(
                    "Attachment hash index lists {} hashes but {} are stored, reconciling",
                    listed.len(),
                    scanned.len()
                );
                true
            }
            None => !scanned.is_empty(),
        };

        info!("Content store opened with {} attachments", scanned.len());
        *store.hash_index.write().await = scanned;
        if stale {
            store.persist_hash_index().await?;
        }
        Ok(store)
    }

    async fn scan_hashes(&self) -> Result<Vec<String>> {
        let keys = self.io.backend().list_keys(CAS_ROOT).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_suffix("/metadata"))
            .filter_map(|k| k.rsplit('/').next())
            .filter(|h| is_valid_hash(h))
            .map(str::to_string)
            .collect())
    }

    fn hash_lock(&self, hash: &str) -> Arc<Mutex<()>> {
        self.hash_locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn hash_index_op(index: &BTreeSet<String>, io: &BlobIo) -> Result<WriteOp> {
        let snapshot: Vec<&String> = index.iter().collect();
        io.put_json(HASH_INDEX_KEY, &snapshot)
    }

    async fn persist_hash_index(&self) -> Result<()> {
        let op = Self::hash_index_op(&*self.hash_index.read().await, &self.io)?;
        self.queue.write(Priority::Normal, vec![op]).await
    }

    /// Drop the lock entry unless another task still holds or awaits it.
    fn release_hash_lock(&self, hash: &str) {
        self.hash_locks.remove_if(hash, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn read_metadata(&self, hash: &str) -> Result<Option<AttachmentMetadata>> {
        self.io.read_json(&metadata_key(hash)).await
    }

    async fn write_metadata(&self, metadata: &AttachmentMetadata) -> Result<()> {
        let op = self.io.put_json(metadata_key(&metadata.hash), metadata)?;
        self.queue.write(Priority::Normal, vec![op]).await
    }

    /// Store a payload and return its hash. Identical content is stored once.
    pub async fn put(&self, payload: impl Into<AttachmentPayload>, mime_type: &str) -> Result<String> {
        let canonical = payload.into().canonicalize()?;
        let hash = content_hash(&canonical.bytes);
        let mime_type = match (mime_type.trim(), canonical.data_url_mime) {
            ("", Some(from_url)) => from_url,
            ("", None) => DEFAULT_MIME.to_string(),
            (given, _) => given.to_string(),
        };

        let lock = self.hash_lock(&hash);
        let _guard = lock.lock().await;

        if let Some(mut existing) = self.read_metadata(&hash).await? {
            existing.last_accessed_at = Utc::now();
            self.write_metadata(&existing).await?;
            debug!("Deduplicated attachment {} ({} bytes)", hash, existing.size);
            return Ok(hash);
        }

        let size = canonical.bytes.len() as u64;
        self.guard.check(size)?;

        let now = Utc::now();
        let metadata = AttachmentMetadata {
            hash: hash.clone(),
            mime_type,
            size,
            created_at: now,
            last_accessed_at: now,
            references: Vec::new(),
            ref_count: 0,
        };
        let mut ops = vec![
            self.io.put_bytes(data_key(&hash), &canonical.bytes),
            self.io.put_json(metadata_key(&hash), &metadata)?,
        ];
        // The index snapshot commits together with the attachment it lists.
        {
            let mut index = self.hash_index.write().await;
            index.insert(hash.clone());
            ops.push(Self::hash_index_op(&index, &self.io)?);
        }
        if let Err(e) = self.queue.write(Priority::Normal, ops).await {
            self.hash_index.write().await.remove(&hash);
            return Err(e);
        }

        self.cache.insert(data_key(&hash), canonical.bytes);

        debug!("Stored new attachment {} ({} bytes)", hash, size);
        Ok(hash)
    }

    pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        if !is_valid_hash(hash) {
            warn!("Rejected malformed attachment hash '{}'", hash);
            return Ok(None);
        }
        let key = data_key(hash);
        if let Some(bytes) = self.cache.get(&key) {
            return Ok(Some(bytes.as_ref().clone()));
        }
        let ticket = self.cache.fill_ticket(&key);
        let bytes = self.io.read_bytes(&key).await?;
        match &bytes {
            Some(b) => {
                self.cache.fill(key, ticket, b.clone());
            }
            None => debug!("Attachment {} not found", hash),
        }
        Ok(bytes)
    }

    pub async fn exists(&self, hash: &str) -> Result<bool> {
        if !is_valid_hash(hash) || !self.hash_index.read().await.contains(hash) {
            return Ok(false);
        }
        self.io.backend().exists(&data_key(hash)).await
    }

    pub async fn get_metadata(&self, hash: &str) -> Result<Option<AttachmentMetadata>> {
        if !is_valid_hash(hash) {
            return Ok(None);
        }
        self.read_metadata(hash).await
    }

    /// Metadata for many hashes, read concurrently. Unknown or malformed hashes are left out.
    pub async fn get_metadata_many(&self, hashes: &[String]) -> Result<HashMap<String, AttachmentMetadata>> {
        let reads = hashes.iter().map(|hash| async move { (hash, self.get_metadata(hash).await) });
        let mut found = HashMap::with_capacity(hashes.len());
        for (hash, result) in join_all(reads).await {
            if let Some(metadata) = result? {
                found.insert(hash.clone(), metadata);
            }
        }
        Ok(found)
    }

    /// The subset of `hashes` that is stored, in input order.
    pub async fn exists_many(&self, hashes: &[String]) -> Result<Vec<String>> {
        let checks = hashes.iter().map(|hash| async move { (hash, self.exists(hash).await) });
        let mut present = Vec::new();
        for (hash, result) in join_all(checks).await {
            if result? {
                present.push(hash.clone());
            }
        }
        Ok(present)
    }

    /// Record that `session_id` uses `hash`. A second reference from the same session is a no-op.
    pub async fn add_reference(&self, hash: &str, session_id: &str, attachment_id: &str) -> Result<bool> {
        if !is_valid_hash(hash) {
            warn!("Cannot reference malformed hash '{}'", hash);
            return Ok(false);
        }
        let lock = self.hash_lock(hash);
        let _guard = lock.lock().await;

        let Some(mut metadata) = self.read_metadata(hash).await? else {
            warn!("Cannot reference unknown attachment {}", hash);
            return Ok(false);
        };
        if metadata.references.iter().any(|r| r.session_id == session_id) {
            return Ok(false);
        }

        metadata.references.push(AttachmentReference {
            session_id: session_id.to_string(),
            attachment_id: attachment_id.to_string(),
            added_at: Utc::now(),
        });
        metadata.sync_ref_count();
        self.write_metadata(&metadata).await?;
        debug!("Attachment {} now has {} references", hash, metadata.ref_count);
        Ok(true)
    }

    /// Drop every reference `session_id` holds on `hash`. Returns how many were removed.
    pub async fn remove_reference(&self, hash: &str, session_id: &str) -> Result<usize> {
        if !is_valid_hash(hash) {
            return Ok(0);
        }
        let lock = self.hash_lock(hash);
        let _guard = lock.lock().await;

        let Some(mut metadata) = self.read_metadata(hash).await? else {
            warn!("Cannot dereference unknown attachment {}", hash);
            return Ok(0);
        };
        let before = metadata.references.len();
        metadata.references.retain(|r| r.session_id != session_id);
        let removed = before - metadata.references.len();
        if removed > 0 {
            metadata.sync_ref_count();
            self.write_metadata(&metadata).await?;
        }
        Ok(removed)
    }

    /// Delete every attachment nobody references. Best effort: one failure does not stop the scan.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        let hashes: Vec<String> = self.hash_index.read().await.iter().cloned().collect();
        let mut report = GcReport {
            scanned: hashes.len(),
            ..GcReport::default()
        };
        let mut forgotten = 0usize;

        for hash in hashes {
            let lock = self.hash_lock(&hash);
            let guard = lock.lock().await;
            if self.sweep(&hash, &mut report).await {
                forgotten += 1;
            }
            drop(guard);
            drop(lock);
            self.release_hash_lock(&hash);
        }

        if forgotten > 0 {
            self.persist_hash_index().await?;
        }

        metrics::add_gc_freed(report.freed_bytes);
        info!(
            "Attachment GC: scanned {}, deleted {}, freed {} bytes, {} errors",
            report.scanned,
            report.deleted,
            report.freed_bytes,
            report.errors.len()
        );
        Ok(report)
    }

    /// Delete `hash` if nothing references it. The caller holds the hash lock, so the
    /// index entry goes away before a concurrent `put` of the same bytes can run.
    /// Returns whether the hash left the index.
    async fn sweep(&self, hash: &str, report: &mut GcReport) -> bool {
        let metadata = match self.read_metadata(hash).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                warn!("Hash index lists {} without metadata", hash);
                self.hash_index.write().await.remove(hash);
                return true;
            }
            Err(e) => {
                report.errors.push(format!("{}: {}", hash, e));
                return false;
            }
        };
        if metadata.ref_count > 0 || !metadata.references.is_empty() {
            return false;
        }

        let ops = vec![WriteOp::delete(data_key(hash)), WriteOp::delete(metadata_key(hash))];
        match self.queue.write(Priority::Critical, ops).await {
            Ok(()) => {
                self.hash_index.write().await.remove(hash);
                self.cache.invalidate(&data_key(hash));
                report.deleted += 1;
                report.freed_bytes += metadata.size;
                true
            }
            Err(e) => {
                error!("Failed to delete unreferenced attachment {}: {}", hash, e);
                report.errors.push(format!("{}: {}", hash, e));
                false
            }
        }
    }

    pub async fn get_stats(&self) -> Result<CasStats> {
        let hashes: Vec<String> = self.hash_index.read().await.iter().cloned().collect();
        let mut stats = CasStats::default();
        for hash in hashes {
            let Some(metadata) = self.read_metadata(&hash).await? else {
                continue;
            };
            stats.total_attachments += 1;
            stats.total_references += metadata.ref_count;
            stats.total_size += metadata.size;
            if metadata.ref_count == 0 {
                stats.unreferenced += 1;
            }
            stats.dedup_saved_bytes += metadata.size * metadata.ref_count.saturating_sub(1) as u64;
        }
        Ok(stats)
    }

    pub async fn counts_by_type(&self) -> Result<AttachmentTypeCounts> {
        let hashes = self.hashes().await;
        let mut counts = AttachmentTypeCounts::default();
        for metadata in self.get_metadata_many(&hashes).await?.values() {
            counts.record(&metadata.mime_type);
        }
        Ok(counts)
    }

    pub async fn hashes(&self) -> Vec<String> {
        self.hash_index.read().await.iter().cloned().collect()
    }
}
