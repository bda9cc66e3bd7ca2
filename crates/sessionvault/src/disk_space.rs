//! Disk space preflight checks.
//!
//! Every write that can grow storage asks a [`DiskGuard`] first. The guard keeps a
//! minimum amount of free space on the volume so the OS and other applications keep
//! working when the data directory fills up.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpaceInfo {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub available_mb: u64,
    pub path: String,
}

/// Source of free-space numbers for a path.
pub trait SpaceProbe: Send + Sync {
    /// `(available, total)` bytes for the volume holding `path`.
    fn space_for(&self, path: &Path) -> Result<(u64, u64)>;
}

/// Reads the mounted volumes through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpaceProbe;

impl SpaceProbe for SystemSpaceProbe {
    fn space_for(&self, path: &Path) -> Result<(u64, u64)> {
        let target = resolve_existing(path);
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point that prefixes the path owns it.
        let disk = disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .ok_or_else(|| {
                StorageError::Backend(format!("No mounted volume found for {}", target.display()))
            })?;

        Ok((disk.available_space(), disk.total_space()))
    }
}

/// Fixed numbers, for tests and for hosts without volume information.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe {
    pub available: u64,
    pub total: u64,
}

impl SpaceProbe for FixedSpaceProbe {
    fn space_for(&self, _path: &Path) -> Result<(u64, u64)> {
        Ok((self.available, self.total))
    }
}

#[derive(Clone)]
pub struct DiskGuard {
    root: PathBuf,
    min_free_bytes: u64,
    probe: Arc<dyn SpaceProbe>,
}

impl std::fmt::Debug for DiskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskGuard")
            .field("root", &self.root)
            .field("min_free_bytes", &self.min_free_bytes)
            .finish()
    }
}

impl DiskGuard {
    pub fn new(root: impl Into<PathBuf>, min_free_bytes: u64) -> Self {
        Self::with_probe(root, min_free_bytes, Arc::new(SystemSpaceProbe))
    }

    pub fn with_probe(root: impl Into<PathBuf>, min_free_bytes: u64, probe: Arc<dyn SpaceProbe>) -> Self {
        Self {
            root: root.into(),
            min_free_bytes,
            probe,
        }
    }

    /// Guard that never refuses a write (in-memory backends).
    pub fn unlimited() -> Self {
        Self::with_probe(
            PathBuf::from("."),
            0,
            Arc::new(FixedSpaceProbe {
                available: u64::MAX,
                total: u64::MAX,
            }),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fails with [`StorageError::InsufficientSpace`] unless `required_bytes` plus the
    /// minimum free threshold fit on the volume.
    pub fn check(&self, required_bytes: u64) -> Result<()> {
        let (available, _) = match self.probe.space_for(&self.root) {
            Ok(space) => space,
            Err(e) => {
                // Unknown volume: let the write proceed, the OS will report ENOSPC.
                warn!("Disk space check skipped for {}: {}", self.root.display(), e);
                return Ok(());
            }
        };

        let needed = required_bytes.saturating_add(self.min_free_bytes);
        if available < needed {
            return Err(StorageError::InsufficientSpace {
                available_mb: available / MB,
                required_mb: needed.div_ceil(MB),
                path: self.root.to_string_lossy().to_string(),
            });
        }

        debug!("Disk preflight ok: {} bytes needed, {} available", needed, available);
        Ok(())
    }

    pub fn info(&self) -> Result<DiskSpaceInfo> {
        let (available, total) = self.probe.space_for(&self.root)?;
        Ok(DiskSpaceInfo {
            total,
            available,
            used: total.saturating_sub(available),
            available_mb: available / MB,
            path: self.root.to_string_lossy().to_string(),
        })
    }
}

/// Serialized JSON length plus 20% for envelopes, backups and filesystem slack.
pub fn estimate_json_size<T: Serialize>(data: &T) -> Result<u64> {
    let json = serde_json::to_vec(data)?;
    Ok((json.len() as f64 * 1.2) as u64)
}

fn resolve_existing(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    loop {
        if let Ok(canonical) = current.canonicalize() {
            return canonical;
        }
        if !current.pop() {
            return PathBuf::from("/");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(available: u64, min_free: u64) -> DiskGuard {
        DiskGuard::with_probe(
            "/data",
            min_free,
            Arc::new(FixedSpaceProbe {
                available,
                total: available * 2,
            }),
        )
    }

    #[test]
    fn test_check_passes_with_headroom() {
        let g = guard(500 * MB, 100 * MB);
        assert!(g.check(10 * MB).is_ok());
    }

    #[test]
    fn test_check_counts_minimum_free_space() {
        let g = guard(150 * MB, 100 * MB);
        // 60 MB fits on disk but not above the 100 MB floor
        match g.check(60 * MB) {
            Err(StorageError::InsufficientSpace {
                available_mb,
                required_mb,
                ..
            }) => {
                assert_eq!(available_mb, 150);
                assert_eq!(required_mb, 160);
            }
            other => panic!("Expected InsufficientSpace, got {:?}", other),
        }
    }

    #[test]
    fn test_unlimited_guard_never_refuses() {
        assert!(DiskGuard::unlimited().check(u64::MAX).is_ok());
    }

    #[test]
    fn test_info_reports_used_space() {
        let info = guard(300 * MB, 0).info().unwrap();
        assert_eq!(info.total, 600 * MB);
        assert_eq!(info.used, 300 * MB);
        assert_eq!(info.available_mb, 300);
    }

    #[test]
    fn test_estimate_json_size() {
        #[derive(Serialize)]
        struct TestData {
            name: String,
            value: i32,
        }

        let size = estimate_json_size(&TestData {
            name: "test".to_string(),
            value: 42,
        })
        .unwrap();
        // {"name":"test","value":42} is 26 bytes, plus 20%
        assert_eq!(size, 31);
    }

    #[test]
    fn test_system_probe_resolves_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SystemSpaceProbe;
        if let Ok((available, total)) = probe.space_for(&dir.path().join("not/yet/created")) {
            assert!(total >= available);
        }
    }
}
