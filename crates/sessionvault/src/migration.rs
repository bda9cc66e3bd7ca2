//! One-time import of the legacy single-blob session store.
//!
//! The legacy store kept every session in one JSON document, either a bare array or
//! an object with `sessions`, `notes` and `tasks` arrays. Each session is written
//! through the engine, read back and compared before the completion marker is
//! stored. A failed comparison aborts the import without writing the marker, so the
//! next run starts over.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::engine::StorageEngine;
use crate::persistence_queue::Priority;
use crate::records::{Note, Session, Task};
use crate::storage_backend::WriteOp;

pub const MARKER_KEY: &str = "migrations/legacy-sessions-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationMarker {
    pub completed_at: DateTime<Utc>,
    pub sessions: usize,
    pub notes: usize,
    pub tasks: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub already_complete: bool,
    pub sessions: usize,
    pub notes: usize,
    pub tasks: usize,
    /// Entries that could not be parsed, with the reason.
    pub skipped: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyDocument {
    #[serde(default)]
    sessions: Vec<serde_json::Value>,
    #[serde(default)]
    notes: Vec<serde_json::Value>,
    #[serde(default)]
    tasks: Vec<serde_json::Value>,
}

fn parse_document(raw: &[u8]) -> anyhow::Result<LegacyDocument> {
    let value: serde_json::Value = serde_json::from_slice(raw).context("Legacy store is not valid JSON")?;
    match value {
        serde_json::Value::Array(sessions) => Ok(LegacyDocument {
            sessions,
            ..LegacyDocument::default()
        }),
        object @ serde_json::Value::Object(_) => {
            serde_json::from_value(object).context("Legacy store has an unexpected shape")
        }
        other => bail!("Legacy store must be an array or object, found {}", other),
    }
}

pub async fn is_complete(engine: &StorageEngine) -> anyhow::Result<bool> {
    Ok(engine.backend().exists(MARKER_KEY).await?)
}

pub async fn import_legacy_file(engine: &StorageEngine, path: &Path) -> anyhow::Result<MigrationReport> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read legacy store {}", path.display()))?;
    import_legacy(engine, &raw).await
}

pub async fn import_legacy(engine: &StorageEngine, raw: &[u8]) -> anyhow::Result<MigrationReport> {
    if is_complete(engine).await? {
        info!("Legacy migration already complete, skipping");
        return Ok(MigrationReport {
            already_complete: true,
            ..MigrationReport::default()
        });
    }

    let document = parse_document(raw)?;
    info!(
        "Migrating legacy store: {} sessions, {} notes, {} tasks",
        document.sessions.len(),
        document.notes.len(),
        document.tasks.len()
    );
    let mut report = MigrationReport::default();

    for (position, value) in document.sessions.into_iter().enumerate() {
        let session: Session = match serde_json::from_value(value) {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping legacy session #{}: {}", position, e);
                report.skipped.push(format!("session #{}: {}", position, e));
                continue;
            }
        };
        let id = session.info.id.clone();
        engine
            .save_full_record(&session)
            .await
            .with_context(|| format!("Failed to write session {}", id))?;
        verify_session(engine, &session)
            .await
            .with_context(|| format!("Round-trip check failed for session {}", id))?;
        report.sessions += 1;
    }

    for (position, value) in document.notes.into_iter().enumerate() {
        match serde_json::from_value::<Note>(value) {
            Ok(note) => {
                let id = note.id.clone();
                engine
                    .save_note(note)
                    .await
                    .with_context(|| format!("Failed to write note {}", id))?;
                report.notes += 1;
            }
            Err(e) => report.skipped.push(format!("note #{}: {}", position, e)),
        }
    }

    for (position, value) in document.tasks.into_iter().enumerate() {
        match serde_json::from_value::<Task>(value) {
            Ok(task) => {
                let id = task.id.clone();
                engine
                    .save_task(task)
                    .await
                    .with_context(|| format!("Failed to write task {}", id))?;
                report.tasks += 1;
            }
            Err(e) => report.skipped.push(format!("task #{}: {}", position, e)),
        }
    }

    engine.flush().await;
    let marker = MigrationMarker {
        completed_at: Utc::now(),
        sessions: report.sessions,
        notes: report.notes,
        tasks: report.tasks,
    };
    let marker_bytes = serde_json::to_vec(&marker)?;
    engine
        .queue()
        .write(Priority::Critical, vec![WriteOp::put(MARKER_KEY, marker_bytes)])
        .await
        .context("Failed to write migration marker")?;

    info!(
        "Legacy migration complete: {} sessions, {} notes, {} tasks, {} skipped",
        report.sessions,
        report.notes,
        report.tasks,
        report.skipped.len()
    );
    Ok(report)
}

/// Read the session back and compare it with what was written.
async fn verify_session(engine: &StorageEngine, expected: &Session) -> anyhow::Result<()> {
    let Some(stored) = engine.load_full_record(&expected.info.id).await? else {
        bail!("session is missing after write");
    };

    let mut expected = expected.clone();
    // Empty text details are not stored.
    if expected.transcript.as_deref() == Some("") {
        expected.transcript = None;
    }
    if expected.notes.as_deref() == Some("") {
        expected.notes = None;
    }

    if stored.screenshots.len() != expected.screenshots.len()
        || stored.audio_segments.len() != expected.audio_segments.len()
        || stored.video_chunks.len() != expected.video_chunks.len()
    {
        bail!(
            "item counts differ: wrote {}/{}/{}, read {}/{}/{}",
            expected.screenshots.len(),
            expected.audio_segments.len(),
            expected.video_chunks.len(),
            stored.screenshots.len(),
            stored.audio_segments.len(),
            stored.video_chunks.len()
        );
    }
    if stored != expected {
        bail!("stored content differs from the legacy record");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use serde_json::json;

    fn legacy_session(id: &str, screenshots: usize) -> serde_json::Value {
        let shots: Vec<_> = (0..screenshots)
            .map(|i| {
                json!({
                    "id": format!("{}-shot-{}", id, i),
                    "timestamp": "2024-05-01T10:00:00Z",
                    "relative_time": i as f64 * 2.5
                })
            })
            .collect();
        json!({
            "id": id,
            "name": format!("Legacy {}", id),
            "start_time": "2024-05-01T09:00:00Z",
            "status": "completed",
            "tags": ["imported"],
            "screenshots": shots,
            "transcript": "hello from the old store",
            "notes": ""
        })
    }

    #[tokio::test]
    async fn test_imports_array_and_writes_marker() {
        let engine = StorageEngine::open(StorageConfig::in_memory()).await.unwrap();
        let raw = serde_json::to_vec(&json!([legacy_session("a", 3), legacy_session("b", 0)])).unwrap();

        let report = import_legacy(&engine, &raw).await.unwrap();
        assert_eq!(report.sessions, 2);
        assert!(report.skipped.is_empty());
        assert!(is_complete(&engine).await.unwrap());

        let a = engine.load_full_record("a").await.unwrap().unwrap();
        assert_eq!(a.screenshots.len(), 3);
        assert_eq!(a.transcript.as_deref(), Some("hello from the old store"));
        assert_eq!(a.notes, None);

        let again = import_legacy(&engine, &raw).await.unwrap();
        assert!(again.already_complete);
        assert_eq!(again.sessions, 0);
    }

    #[tokio::test]
    async fn test_object_form_with_notes_and_bad_entries() {
        let engine = StorageEngine::open(StorageConfig::in_memory()).await.unwrap();
        let raw = serde_json::to_vec(&json!({
            "sessions": [legacy_session("s1", 1), {"name": "missing id"}],
            "notes": [{
                "id": "n1",
                "content": "follow up",
                "created_at": "2024-05-02T00:00:00Z",
                "updated_at": "2024-05-02T00:00:00Z"
            }],
            "tasks": [{"id": "t1"}]
        }))
        .unwrap();

        let report = import_legacy(&engine, &raw).await.unwrap();
        assert_eq!(report.sessions, 1);
        assert_eq!(report.notes, 1);
        assert_eq!(report.tasks, 0);
        assert_eq!(report.skipped.len(), 2);
        assert!(engine.get_note("n1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_document_leaves_no_marker() {
        let engine = StorageEngine::open(StorageConfig::in_memory()).await.unwrap();
        assert!(import_legacy(&engine, b"not json").await.is_err());
        assert!(import_legacy(&engine, b"42").await.is_err());
        assert!(!is_complete(&engine).await.unwrap());
    }
}
