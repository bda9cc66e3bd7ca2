//! Deduplicated attachment storage keyed by content hash

pub mod canonical;
pub mod store;

pub use canonical::{content_hash, is_valid_hash, AttachmentPayload};
pub use store::{AttachmentMetadata, AttachmentReference, AttachmentTypeCounts, CasStats, ContentStore, GcReport};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_management::LruCache;
    use crate::compression::Codec;
    use crate::config::{CacheConfig, QueueConfig};
    use crate::disk_space::DiskGuard;
    use crate::error::StorageError;
    use crate::persistence_queue::PersistenceQueue;
    use crate::storage_backend::{BlobIo, InMemoryBackend, StorageBackend};
    use crate::test_support::GatedBackend;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::Arc;
    use std::time::Duration;

    fn queue_config() -> QueueConfig {
        QueueConfig {
            normal_batch_delay: Duration::from_millis(2),
            retry_base_delay: Duration::from_millis(1),
            ..QueueConfig::default()
        }
    }

    async fn open_on(backend: Arc<dyn StorageBackend>, queue: Arc<PersistenceQueue>) -> ContentStore {
        ContentStore::open(
            BlobIo::new(backend, Codec::default()),
            queue,
            LruCache::new(&CacheConfig::default()),
            DiskGuard::unlimited(),
        )
        .await
        .unwrap()
    }

    async fn open_store() -> (ContentStore, Arc<InMemoryBackend>, Arc<PersistenceQueue>) {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = PersistenceQueue::start(backend.clone(), queue_config());
        let store = open_on(backend.clone(), queue.clone()).await;
        (store, backend, queue)
    }

    #[tokio::test]
    async fn test_identical_content_is_stored_once() {
        let (store, backend, _) = open_store().await;
        let first = store.put(b"same bytes".as_slice(), "image/png").await.unwrap();
        let second = store.put(b"same bytes".as_slice(), "image/png").await.unwrap();
        assert_eq!(first, second);

        let data_keys: Vec<String> = backend
            .list_keys("attachments-ca/")
            .await
            .unwrap()
            .into_iter()
            .filter(|k| k.ends_with("/data"))
            .collect();
        assert_eq!(data_keys.len(), 1);
        assert_eq!(store.get(&first).await.unwrap().unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn test_data_url_and_plain_base64_share_a_hash() {
        let (store, _, _) = open_store().await;
        let plain = STANDARD.encode(b"pixels");
        let url = format!("data:image/jpeg;base64,{}", plain);

        let a = store.put(plain, "").await.unwrap();
        let b = store.put(url, "").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, content_hash(b"pixels"));

        // The first writer decides the MIME type; plain base64 has none.
        let metadata = store.get_metadata(&a).await.unwrap().unwrap();
        assert_eq!(metadata.mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_references_and_garbage_collection() {
        let (store, backend, _) = open_store().await;
        let hash = store.put(b"shared clip".as_slice(), "audio/wav").await.unwrap();

        assert!(store.add_reference(&hash, "s1", "a1").await.unwrap());
        assert!(store.add_reference(&hash, "s2", "a2").await.unwrap());
        assert!(!store.add_reference(&hash, "s1", "a3").await.unwrap());
        assert_eq!(store.get_metadata(&hash).await.unwrap().unwrap().ref_count, 2);

        // Referenced attachments survive collection.
        let report = store.collect_garbage().await.unwrap();
        assert_eq!(report.deleted, 0);

        assert_eq!(store.remove_reference(&hash, "s1").await.unwrap(), 1);
        assert_eq!(store.remove_reference(&hash, "s2").await.unwrap(), 1);
        assert_eq!(store.get_metadata(&hash).await.unwrap().unwrap().ref_count, 0);

        let report = store.collect_garbage().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.freed_bytes, "shared clip".len() as u64);
        assert!(report.errors.is_empty());
        assert!(!store.exists(&hash).await.unwrap());
        assert!(!backend.exists(&store::data_key(&hash)).await.unwrap());
        assert!(store.get(&hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_large_attachment_shared_by_two_sessions() {
        let (store, _, _) = open_store().await;
        let payload = vec![7u8; 1024 * 1024];

        let hash = store.put(payload.clone(), "video/mp4").await.unwrap();
        store.add_reference(&hash, "s1", "v1").await.unwrap();
        let again = store.put(payload, "video/mp4").await.unwrap();
        store.add_reference(&again, "s2", "v2").await.unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_attachments, 1);
        assert_eq!(stats.total_references, 2);
        assert_eq!(stats.total_size, 1024 * 1024);
        assert_eq!(stats.dedup_saved_bytes, 1024 * 1024);
    }

    #[tokio::test]
    async fn test_invalid_base64_writes_nothing() {
        let (store, backend, _) = open_store().await;
        let result = store.put("%%% not base64 %%%", "image/png").await;
        assert!(matches!(result, Err(StorageError::Decode(_))));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_hash_index_survives_reopen() {
        let (store, backend, queue) = open_store().await;
        let hash = store.put(b"persist me".as_slice(), "text/plain").await.unwrap();
        queue.flush().await;

        let reopened = ContentStore::open(
            BlobIo::new(backend.clone(), Codec::default()),
            queue.clone(),
            LruCache::new(&CacheConfig::default()),
            DiskGuard::unlimited(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.hashes().await, vec![hash.clone()]);

        // Losing the index falls back to a metadata scan.
        backend.delete(store::HASH_INDEX_KEY).await.unwrap();
        let rebuilt = ContentStore::open(
            BlobIo::new(backend, Codec::default()),
            queue,
            LruCache::new(&CacheConfig::default()),
            DiskGuard::unlimited(),
        )
        .await
        .unwrap();
        assert_eq!(rebuilt.hashes().await, vec![hash]);
    }

    #[tokio::test]
    async fn test_malformed_hashes_are_rejected() {
        let (store, _, _) = open_store().await;
        assert!(store.get("../../etc/passwd").await.unwrap().is_none());
        assert!(!store.exists("abc").await.unwrap());
        assert!(!store.add_reference("XYZ", "s1", "a1").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_commits_hash_index_with_the_data() {
        let (store, backend, _) = open_store().await;
        let hash = store.put(b"indexed".as_slice(), "image/png").await.unwrap();

        let io = BlobIo::new(backend.clone(), Codec::default());
        let listed: Vec<String> = io.read_json(store::HASH_INDEX_KEY).await.unwrap().unwrap();
        assert_eq!(listed, vec![hash]);
    }

    #[tokio::test]
    async fn test_reopen_reconciles_a_stale_hash_index() {
        let (store, backend, queue) = open_store().await;
        let kept = store.put(b"kept".as_slice(), "image/png").await.unwrap();
        let newer = store.put(b"newer".as_slice(), "audio/wav").await.unwrap();

        // An index snapshot that missed the newest attachment and lists a deleted one.
        let io = BlobIo::new(backend.clone(), Codec::default());
        let gone = content_hash(b"gone");
        let stale = vec![kept.clone(), gone.clone()];
        backend
            .commit(vec![io.put_json(store::HASH_INDEX_KEY, &stale).unwrap()])
            .await
            .unwrap();

        let reopened = open_on(backend.clone(), queue).await;
        let mut expected = vec![kept, newer.clone()];
        expected.sort();
        assert_eq!(reopened.hashes().await, expected);
        assert!(reopened.exists(&newer).await.unwrap());
        assert!(!reopened.exists(&gone).await.unwrap());
        assert_eq!(reopened.get_stats().await.unwrap().total_attachments, 2);

        let listed: Vec<String> = io.read_json(store::HASH_INDEX_KEY).await.unwrap().unwrap();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_put_during_collection_is_not_forgotten() {
        let (first, second) = {
            let a = content_hash(b"swept first");
            let b = content_hash(b"swept second");
            if a < b {
                ((b"swept first".as_slice(), a), (b"swept second".as_slice(), b))
            } else {
                ((b"swept second".as_slice(), b), (b"swept first".as_slice(), a))
            }
        };
        let backend = Arc::new(GatedBackend::new(store::metadata_key(&second.1)));
        let queue = PersistenceQueue::start(backend.clone(), queue_config());
        let store = open_on(backend.clone(), queue.clone()).await;
        store.put(first.0, "image/png").await.unwrap();
        store.put(second.0, "image/png").await.unwrap();
        backend.arm();

        // Collection removes the first attachment, then stalls on the second while
        // the first is stored again.
        let collect = store.collect_garbage();
        let reput = async {
            backend.entered.notified().await;
            let hash = store.put(first.0, "image/png").await.unwrap();
            backend.release.notify_one();
            hash
        };
        let (report, hash) = tokio::join!(collect, reput);
        assert_eq!(report.unwrap().deleted, 2);
        assert_eq!(hash, first.1);

        assert!(store.exists(&first.1).await.unwrap());
        assert_eq!(store.get(&first.1).await.unwrap().unwrap(), first.0);
        assert!(!store.exists(&second.1).await.unwrap());

        let reopened = open_on(backend.clone(), queue).await;
        assert_eq!(reopened.hashes().await, vec![first.1]);
    }

    #[tokio::test]
    async fn test_batch_metadata_existence_and_type_counts() {
        let (store, _, _) = open_store().await;
        let image = store.put(b"png".as_slice(), "image/png").await.unwrap();
        let clip = store.put(b"mp4".as_slice(), "video/mp4").await.unwrap();
        let voice = store.put(b"wav".as_slice(), "audio/wav").await.unwrap();
        let doc = store.put(b"pdf".as_slice(), "application/pdf").await.unwrap();
        let missing = content_hash(b"never stored");

        let wanted = vec![image.clone(), missing.clone(), voice.clone(), "bad".to_string()];
        let found = store.get_metadata_many(&wanted).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&image].mime_type, "image/png");
        assert_eq!(found[&voice].mime_type, "audio/wav");

        let present = store
            .exists_many(&[missing, doc.clone(), clip.clone()])
            .await
            .unwrap();
        assert_eq!(present, vec![doc, clip]);

        let counts = store.counts_by_type().await.unwrap();
        assert_eq!(
            counts,
            AttachmentTypeCounts {
                total: 4,
                images: 1,
                video: 1,
                audio: 1,
                other: 1,
            }
        );
    }
}
