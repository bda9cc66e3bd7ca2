//! Chunked persistence for large session records

pub mod keys;
pub mod store;

pub use store::ChunkedStore;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_management::LruCache;
    use crate::compression::Codec;
    use crate::config::{CacheConfig, ChunkConfig, QueueConfig};
    use crate::disk_space::{DiskGuard, FixedSpaceProbe};
    use crate::error::StorageError;
    use crate::persistence_queue::PersistenceQueue;
    use crate::records::{AudioSegment, DetailField, Screenshot, Session, SessionInfo, SessionMetadata};
    use crate::storage_backend::{BlobIo, InMemoryBackend, StorageBackend};
    use crate::test_support::GatedBackend;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn queue_config() -> QueueConfig {
        QueueConfig {
            normal_batch_delay: Duration::from_millis(2),
            retry_base_delay: Duration::from_millis(1),
            ..QueueConfig::default()
        }
    }

    fn store_with(backend: Arc<InMemoryBackend>, guard: DiskGuard) -> ChunkedStore {
        let queue = PersistenceQueue::start(backend.clone(), queue_config());
        ChunkedStore::new(
            BlobIo::new(backend, Codec::default()),
            queue,
            LruCache::new(&CacheConfig::default()),
            guard,
            ChunkConfig::default(),
        )
    }

    fn store() -> (ChunkedStore, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        (store_with(backend.clone(), DiskGuard::unlimited()), backend)
    }

    fn screenshot(i: usize, data: Option<&str>) -> Screenshot {
        Screenshot {
            id: format!("shot-{}", i),
            attachment_id: None,
            attachment_hash: None,
            timestamp: Utc::now(),
            relative_time: Some(i as f64),
            ai_analysis: None,
            data: data.map(str::to_string),
        }
    }

    async fn create(store: &ChunkedStore, id: &str) -> SessionMetadata {
        let metadata = SessionMetadata::new(SessionInfo::new(id, "Focus"), store.chunk_config());
        store.save_metadata(metadata).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_25_items_makes_two_chunks() {
        let (store, _) = store();
        create(&store, "s1").await;

        for i in 0..25 {
            store.append_item("s1", screenshot(i, None)).await.unwrap();
        }

        let metadata = store.load_metadata("s1").await.unwrap().unwrap();
        assert_eq!(metadata.screenshots.count, 25);
        assert_eq!(metadata.screenshots.chunk_count, 2);
        assert_eq!(metadata.version, 26);

        let first: Vec<Screenshot> = store.load_chunk("s1", 0).await.unwrap();
        let second: Vec<Screenshot> = store.load_chunk("s1", 1).await.unwrap();
        assert_eq!(first.len(), 20);
        assert_eq!(second.len(), 5);

        let all: Vec<Screenshot> = store.load_all_chunks("s1").await.unwrap();
        assert_eq!(all.len(), 25);
        assert!(all.iter().enumerate().all(|(i, s)| s.id == format!("shot-{}", i)));
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_lose_items() {
        let (store, _) = store();
        let store = Arc::new(store);
        create(&store, "s1").await;

        let handles: Vec<_> = (0..30)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .append_item(
                            "s1",
                            AudioSegment {
                                id: format!("seg-{}", i),
                                attachment_id: None,
                                attachment_hash: None,
                                timestamp: Utc::now(),
                                duration: 5.0,
                                start_time: None,
                                transcription: None,
                            },
                        )
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let segments: Vec<AudioSegment> = store.load_all_chunks("s1").await.unwrap();
        assert_eq!(segments.len(), 30);
        assert_eq!(store.load_metadata("s1").await.unwrap().unwrap().audio_segments.count, 30);
    }

    #[tokio::test]
    async fn test_cached_chunks_are_stripped_but_payload_read_is_full() {
        let (store, _) = store();
        create(&store, "s1").await;
        store.append_item("s1", screenshot(0, Some("aGVsbG8="))).await.unwrap();

        let cached: Vec<Screenshot> = store.load_chunk("s1", 0).await.unwrap();
        assert!(cached[0].data.is_none());

        let full: Vec<Screenshot> = store.load_chunk_with_payloads("s1", 0).await.unwrap();
        assert_eq!(full[0].data.as_deref(), Some("aGVsbG8="));
    }

    #[tokio::test]
    async fn test_full_record_round_trip_and_shrink() {
        let (store, backend) = store();
        let mut session = Session::new(SessionInfo::new("s2", "Research"));
        session.screenshots = (0..45).map(|i| screenshot(i, None)).collect();
        session.transcript = Some("we talked about storage".into());
        session.summary = Some(serde_json::json!({"highlights": ["chunking"]}));

        let metadata = store.save_full_record(&session).await.unwrap();
        assert_eq!(metadata.screenshots.chunk_count, 3);
        assert!(metadata.has_transcript && metadata.has_summary);

        let loaded = store.load_full_record("s2").await.unwrap().unwrap();
        assert_eq!(loaded.screenshots.len(), 45);
        assert_eq!(loaded.transcript, session.transcript);
        assert_eq!(loaded.summary, session.summary);

        // Shrinking removes the chunks and details the new version no longer has.
        session.screenshots.truncate(5);
        session.transcript = None;
        store.save_full_record(&session).await.unwrap();
        assert!(!backend.exists("sessions/s2/screenshots/chunk-002").await.unwrap());
        assert!(!backend.exists("sessions/s2/transcript").await.unwrap());

        let loaded = store.load_full_record("s2").await.unwrap().unwrap();
        assert_eq!(loaded.screenshots.len(), 5);
        assert!(loaded.transcript.is_none());
    }

    #[tokio::test]
    async fn test_detail_save_sets_flag() {
        let (store, _) = store();
        create(&store, "s1").await;
        let metadata = store
            .save_detail("s1", DetailField::CanvasSpec, Some(serde_json::json!({"layout": "grid"})))
            .await
            .unwrap();
        assert!(metadata.has_canvas_spec);

        let metadata = store.save_detail("s1", DetailField::CanvasSpec, None).await.unwrap();
        assert!(!metadata.has_canvas_spec);
        assert!(store.load_detail("s1", DetailField::CanvasSpec).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_record_removes_every_key() {
        let (store, backend) = store();
        let mut session = Session::new(SessionInfo::new("s3", "Cleanup"));
        session.screenshots = (0..3).map(|i| screenshot(i, None)).collect();
        session.notes = Some("remember".into());
        store.save_full_record(&session).await.unwrap();

        let removed = store.delete_record("s3").await.unwrap().unwrap();
        assert_eq!(removed.screenshots.count, 3);
        assert!(backend.list_keys("sessions/s3/").await.unwrap().is_empty());
        assert!(store.load_metadata("s3").await.unwrap().is_none());
        assert!(store.delete_record("s3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_to_unknown_session_fails() {
        let (store, _) = store();
        let result = store.append_item("missing", screenshot(0, None)).await;
        assert!(matches!(result, Err(StorageError::InvalidRecord(_))));
    }

    #[tokio::test]
    async fn test_insufficient_space_writes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let guard = DiskGuard::with_probe(
            "/data",
            100 * 1024 * 1024,
            Arc::new(FixedSpaceProbe {
                available: 50 * 1024 * 1024,
                total: 1024 * 1024 * 1024,
            }),
        );
        let store = store_with(backend.clone(), guard);

        let metadata = SessionMetadata::new(SessionInfo::new("s4", "Full disk"), store.chunk_config());
        let result = store.save_metadata(metadata).await;
        match result {
            Err(e @ StorageError::InsufficientSpace { .. }) => {
                assert!(e.user_message().contains("Please free up space"));
            }
            other => panic!("Expected InsufficientSpace, got {:?}", other),
        }
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_list_session_ids() {
        let (store, _) = store();
        create(&store, "b").await;
        create(&store, "a").await;
        store.append_item("a", screenshot(0, None)).await.unwrap();
        assert_eq!(store.list_session_ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_slow_read_does_not_overwrite_newer_cached_chunk() {
        let chunk = keys::chunk_key("s1", crate::records::ChunkedField::Screenshots, 0);
        let backend = Arc::new(GatedBackend::new(chunk.clone()));
        let cache = LruCache::new(&CacheConfig::default());
        let store = ChunkedStore::new(
            BlobIo::new(backend.clone(), Codec::default()),
            PersistenceQueue::start(backend.clone(), queue_config()),
            cache.clone(),
            DiskGuard::unlimited(),
            ChunkConfig::default(),
        );
        create(&store, "s1").await;
        store.append_item("s1", screenshot(0, None)).await.unwrap();
        cache.invalidate(&chunk);
        backend.arm();

        let reader = store.load_chunk::<Screenshot>("s1", 0);
        let writer = async {
            backend.entered.notified().await;
            store.append_item("s1", screenshot(1, None)).await.unwrap();
            backend.release.notify_one();
        };
        let (stale, ()) = tokio::join!(reader, writer);
        assert_eq!(stale.unwrap().len(), 1);

        let current: Vec<Screenshot> = store.load_chunk("s1", 0).await.unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!(store.load_all_chunks::<Screenshot>("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_keeps_a_lock_that_is_still_held() {
        let (store, _) = store();
        create(&store, "s1").await;

        let held = store.record_lock("s1");
        let deleting = store.delete_record("s1");
        let waiter = async {
            // Queued behind the delete with the same lock instance.
            let _guard = held.lock().await;
            Arc::ptr_eq(&held, &store.record_lock("s1"))
        };
        let (removed, same_lock) = tokio::join!(deleting, waiter);
        assert!(removed.unwrap().is_some());
        assert!(same_lock);
        drop(held);

        create(&store, "s1").await;
        store.delete_record("s1").await.unwrap();
        assert_eq!(store.record_lock_count(), 0);
    }
}
