//! File system backend.
//!
//! Each key maps to `<root>/<key>.val`. A commit runs in four steps:
//!
//! 1. stage every new value under `.staging/<tx>/<n>.data`
//! 2. copy each value about to be overwritten into `.backups/<key>.bak/` and verify the copy
//! 3. write `.staging/<tx>/COMMIT` (the commit point)
//! 4. move staged files into place, apply deletes, prune old backups, drop the staging dir
//!
//! A failure before step 3 discards the staging dir and leaves live data untouched.
//! A staging dir that already holds `COMMIT` is rolled forward by [`FileSystemBackend::recover`],
//! which runs on open and before every commit.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{validate_key, StorageBackend, WriteOp};
use crate::disk_space::DiskGuard;
use crate::error::{Result, StorageError};

const VALUE_EXT: &str = "val";
const STAGING_DIR: &str = ".staging";
const BACKUP_DIR: &str = ".backups";
const COMMIT_MARKER: &str = "COMMIT";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub rolled_forward: usize,
    pub discarded: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitManifest {
    tx_id: String,
    created_at: chrono::DateTime<Utc>,
    ops: Vec<ManifestOp>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestOp {
    key: String,
    delete: bool,
}

#[derive(Debug, Clone)]
struct Layout {
    root: PathBuf,
    backups_to_keep: usize,
}

pub struct FileSystemBackend {
    layout: Arc<Layout>,
    guard: DiskGuard,
    write_lock: Mutex<()>,
}

impl FileSystemBackend {
    pub fn open(root: impl Into<PathBuf>, guard: DiskGuard, backups_to_keep: usize) -> Result<Self> {
        let layout = Layout {
            root: root.into(),
            backups_to_keep,
        };
        fs::create_dir_all(&layout.root)?;
        fs::create_dir_all(layout.root.join(STAGING_DIR))?;

        let report = layout.recover()?;
        if report.rolled_forward > 0 || report.discarded > 0 {
            info!(
                "Recovered storage at {}: {} commits rolled forward, {} discarded",
                layout.root.display(),
                report.rolled_forward,
                report.discarded
            );
        }

        Ok(Self {
            layout: Arc::new(layout),
            guard,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Roll forward committed staging dirs and discard incomplete ones.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let _lock = self.write_lock.lock().await;
        let layout = Arc::clone(&self.layout);
        tokio::task::spawn_blocking(move || layout.recover()).await?
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Layout) -> Result<T> + Send + 'static,
    {
        let layout = Arc::clone(&self.layout);
        tokio::task::spawn_blocking(move || f(&layout)).await?
    }
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |layout| read_optional(&layout.value_path(&key)))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let _lock = self.write_lock.lock().await;
        let key = key.to_string();
        self.blocking(move |layout| layout.remove_value(&key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |layout| Ok(layout.value_path(&key).is_file()))
            .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.blocking(move |layout| layout.list_keys(&prefix)).await
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        for op in &ops {
            validate_key(op.key())?;
        }

        // Staged copy plus backup of the value being replaced.
        let growth: u64 = ops.iter().map(WriteOp::growth_bytes).sum();
        self.guard.check(growth.saturating_mul(2))?;

        let _lock = self.write_lock.lock().await;
        self.blocking(move |layout| {
            layout.recover()?;
            layout.commit(ops)
        })
        .await
    }

    async fn load_backup(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let key = key.to_string();
        self.blocking(move |layout| match layout.backup_files(&key)?.first() {
            Some(path) => read_optional(path),
            None => Ok(None),
        })
        .await
    }
}

impl Layout {
    fn value_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, VALUE_EXT))
    }

    fn backup_dir(&self, key: &str) -> PathBuf {
        self.root.join(BACKUP_DIR).join(format!("{}.bak", key))
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        let tx_id = Uuid::new_v4().to_string();
        let staging = self.root.join(STAGING_DIR).join(&tx_id);

        let prepared = self
            .stage(&staging, &ops)
            .map_err(|e| fail_phase("staging", e))
            .and_then(|_| self.backup_targets(&tx_id, &ops).map_err(|e| fail_phase("backup", e)))
            .and_then(|_| {
                let manifest = CommitManifest {
                    tx_id: tx_id.clone(),
                    created_at: Utc::now(),
                    ops: ops
                        .iter()
                        .map(|op| ManifestOp {
                            key: op.key().to_string(),
                            delete: matches!(op, WriteOp::Delete { .. }),
                        })
                        .collect(),
                };
                write_durable(&staging.join(COMMIT_MARKER), &serde_json::to_vec(&manifest)?)
                    .map_err(|e| fail_phase("commit", e))
            });

        if let Err(e) = prepared {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!("Failed to discard staging dir {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }

        // From here the commit is durable; an interrupted finalize is rolled forward later.
        self.finalize(&staging).map_err(|e| fail_phase("finalize", e))?;
        debug!("Committed transaction {} ({} ops)", tx_id, ops.len());
        Ok(())
    }

    fn stage(&self, staging: &Path, ops: &[WriteOp]) -> Result<()> {
        fs::create_dir_all(staging)?;
        for (index, op) in ops.iter().enumerate() {
            if let WriteOp::Put { value, .. } = op {
                write_durable(&staging.join(format!("{}.data", index)), value)?;
            }
        }
        Ok(())
    }

    fn backup_targets(&self, tx_id: &str, ops: &[WriteOp]) -> Result<()> {
        if self.backups_to_keep == 0 {
            return Ok(());
        }
        let stamp = Utc::now().timestamp_millis();
        for (index, op) in ops.iter().enumerate() {
            let WriteOp::Put { key, .. } = op else { continue };
            let Some(current) = read_optional(&self.value_path(key))? else {
                continue;
            };

            let dir = self.backup_dir(key);
            fs::create_dir_all(&dir)?;
            let backup = dir.join(format!("{:020}-{}-{}.bak", stamp, &tx_id[..8], index));
            write_durable(&backup, &current)?;

            if fs::read(&backup)? != current {
                let _ = fs::remove_file(&backup);
                return Err(StorageError::integrity(key.as_str(), "backup verification failed"));
            }
        }
        Ok(())
    }

    fn finalize(&self, staging: &Path) -> Result<()> {
        let manifest: CommitManifest = serde_json::from_slice(&fs::read(staging.join(COMMIT_MARKER))?)?;

        for (index, op) in manifest.ops.iter().enumerate() {
            if op.delete {
                self.remove_value(&op.key)?;
                continue;
            }
            let staged = staging.join(format!("{}.data", index));
            let target = self.value_path(&op.key);
            match fs::rename(&staged, &target) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound && !staged.exists() && target.exists() => {
                    // Moved by an earlier, interrupted finalize.
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::rename(&staged, &target)?;
                }
                Err(e) => return Err(e.into()),
            }
            self.prune_backups(&op.key)?;
        }

        fs::remove_dir_all(staging)?;
        Ok(())
    }

    fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let staging_root = self.root.join(STAGING_DIR);
        let entries = match fs::read_dir(&staging_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        let mut pending: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        pending.sort_by_key(|path| {
            fs::metadata(path.join(COMMIT_MARKER))
                .and_then(|m| m.modified())
                .ok()
        });

        for staging in pending {
            if staging.join(COMMIT_MARKER).is_file() {
                warn!("Rolling forward interrupted commit {}", staging.display());
                self.finalize(&staging)?;
                report.rolled_forward += 1;
            } else {
                debug!("Discarding uncommitted staging dir {}", staging.display());
                fs::remove_dir_all(&staging)?;
                report.discarded += 1;
            }
        }
        Ok(report)
    }

    fn remove_value(&self, key: &str) -> Result<bool> {
        let path = self.value_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.prune_empty_parents(&path);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    /// Backup files for `key`, newest first.
    fn backup_files(&self, key: &str) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = match fs::read_dir(self.backup_dir(key)) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "bak"))
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        files.sort();
        files.reverse();
        Ok(files)
    }

    fn prune_backups(&self, key: &str) -> Result<()> {
        for stale in self.backup_files(key)?.into_iter().skip(self.backups_to_keep) {
            fs::remove_file(&stale)?;
        }
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let start_rel = prefix.rfind('/').map(|i| &prefix[..i]).unwrap_or("");
        let start = if start_rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(start_rel)
        };

        let mut keys = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if hidden {
                    continue;
                }
                if entry.file_type()?.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == VALUE_EXT) {
                    if let Some(key) = self.key_for(&path) {
                        if key.starts_with(prefix) {
                            keys.push(key);
                        }
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?.with_extension("");
        let segments: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(segments.join("/"))
    }
}

fn fail_phase(phase: &'static str, e: StorageError) -> StorageError {
    match e {
        StorageError::InsufficientSpace { .. } => e,
        other => StorageError::Transaction {
            phase,
            reason: other.to_string(),
        },
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file and rename, so readers never see a partial file.
fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
