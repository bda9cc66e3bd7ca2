// sessionvault/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Which storage backend the engine writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// File system when the data directory is usable, embedded database otherwise.
    Auto,
    FileSystem,
    Sqlite,
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "fs" | "filesystem" | "file" => Ok(BackendKind::FileSystem),
            "sqlite" | "db" | "embedded" => Ok(BackendKind::Sqlite),
            "memory" | "mem" => Ok(BackendKind::Memory),
            other => Err(anyhow::anyhow!(
                "Unknown backend '{}'. Expected auto, filesystem, sqlite or memory",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub normal_batch_delay: Duration,
    pub low_batch_size: usize,
    /// Oldest low item age after which the low lane drains even when not idle.
    pub low_max_wait: Duration,
    pub idle_poll_interval: Duration,
    pub retry_base_delay: Duration,
    pub critical_max_retries: u32,
    pub normal_max_retries: u32,
    pub low_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            normal_batch_delay: Duration::from_millis(100),
            low_batch_size: 10,
            low_max_wait: Duration::from_secs(1),
            idle_poll_interval: Duration::from_millis(20),
            retry_base_delay: Duration::from_millis(100),
            critical_max_retries: 1,
            normal_max_retries: 3,
            low_max_retries: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_bytes: u64,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024,
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub screenshots: usize,
    pub audio_segments: usize,
    pub video_chunks: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            screenshots: 20,
            audio_segments: 100,
            video_chunks: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub backend: BackendKind,
    /// Free space that must remain on the volume after any write.
    pub min_free_bytes: u64,
    pub backups_to_keep: usize,
    /// Payloads smaller than this are stored uncompressed.
    pub compression_threshold: usize,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub chunks: ChunkConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backend: BackendKind::Auto,
            min_free_bytes: 100 * 1024 * 1024,
            backups_to_keep: 3,
            compression_threshold: 1024,
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            chunks: ChunkConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let data_dir = env::var("SESSIONVAULT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let backend = match env::var("SESSIONVAULT_BACKEND") {
            Ok(raw) => raw.parse().context("SESSIONVAULT_BACKEND is invalid")?,
            Err(_) => BackendKind::Auto,
        };

        let queue = QueueConfig {
            max_queue_size: env_or("SESSIONVAULT_QUEUE_MAX_SIZE", defaults.queue.max_queue_size)?,
            normal_batch_delay: Duration::from_millis(env_or("SESSIONVAULT_NORMAL_BATCH_MS", 100u64)?),
            low_batch_size: env_or("SESSIONVAULT_LOW_BATCH_SIZE", defaults.queue.low_batch_size)?,
            retry_base_delay: Duration::from_millis(env_or("SESSIONVAULT_RETRY_BASE_MS", 100u64)?),
            ..defaults.queue
        };

        let cache = CacheConfig {
            max_bytes: env_or("SESSIONVAULT_CACHE_BYTES", defaults.cache.max_bytes)?,
            ttl: Duration::from_secs(env_or("SESSIONVAULT_CACHE_TTL_SECS", 300u64)?),
        };

        let chunks = ChunkConfig {
            screenshots: env_or("SESSIONVAULT_SCREENSHOT_CHUNK", defaults.chunks.screenshots)?,
            audio_segments: env_or("SESSIONVAULT_AUDIO_CHUNK", defaults.chunks.audio_segments)?,
            video_chunks: env_or("SESSIONVAULT_VIDEO_CHUNK", defaults.chunks.video_chunks)?,
        };

        let min_free_mb: u64 = env_or("SESSIONVAULT_MIN_FREE_MB", 100u64)?;

        let config = Self {
            data_dir,
            backend,
            min_free_bytes: min_free_mb * 1024 * 1024,
            backups_to_keep: env_or("SESSIONVAULT_BACKUPS_TO_KEEP", defaults.backups_to_keep)?,
            compression_threshold: env_or(
                "SESSIONVAULT_COMPRESSION_THRESHOLD",
                defaults.compression_threshold,
            )?,
            queue,
            cache,
            chunks,
        };
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration used by tests and throwaway tooling.
    pub fn in_memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            min_free_bytes: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunks.screenshots == 0 || self.chunks.audio_segments == 0 || self.chunks.video_chunks == 0 {
            return Err(anyhow::anyhow!("Chunk sizes must be greater than zero"));
        }
        if self.queue.low_batch_size == 0 {
            return Err(anyhow::anyhow!("SESSIONVAULT_LOW_BATCH_SIZE must be greater than zero"));
        }
        if self.queue.max_queue_size == 0 {
            return Err(anyhow::anyhow!("SESSIONVAULT_QUEUE_MAX_SIZE must be greater than zero"));
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Data Dir: {}", self.data_dir.display());
        info!("- Backend: {:?}", self.backend);
        info!("- Min Free Space: {} MB", self.min_free_bytes / (1024 * 1024));
        info!("- Backups Kept: {}", self.backups_to_keep);
        info!("- Compression Threshold: {} bytes", self.compression_threshold);
        info!("- Cache: {} MB, TTL {}s", self.cache.max_bytes / (1024 * 1024), self.cache.ttl.as_secs());
        info!(
            "- Queue: max {}, normal window {}ms, low batch {}",
            self.queue.max_queue_size,
            self.queue.normal_batch_delay.as_millis(),
            self.queue.low_batch_size
        );
        info!(
            "- Chunk Sizes: screenshots {}, audio {}, video {}",
            self.chunks.screenshots, self.chunks.audio_segments, self.chunks.video_chunks
        );
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Default Value Tests =====

    #[test]
    fn test_default_chunk_sizes() {
        let config = StorageConfig::default();
        assert_eq!(config.chunks.screenshots, 20);
        assert_eq!(config.chunks.audio_segments, 100);
        assert_eq!(config.chunks.video_chunks, 50);
    }

    #[test]
    fn test_default_queue_lanes() {
        let queue = QueueConfig::default();
        assert_eq!(queue.critical_max_retries, 1);
        assert_eq!(queue.normal_max_retries, 3);
        assert_eq!(queue.low_max_retries, 5);
        assert_eq!(queue.low_batch_size, 10);
        assert_eq!(queue.normal_batch_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_min_free_space_threshold() {
        assert_eq!(StorageConfig::default().min_free_bytes, 100 * 1024 * 1024);
        assert_eq!(StorageConfig::in_memory().min_free_bytes, 0);
    }

    // ===== Parsing Tests =====

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("auto".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert_eq!("FS".parse::<BackendKind>().unwrap(), BackendKind::FileSystem);
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!(" memory ".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("indexeddb".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_chunk_size() {
        let mut config = StorageConfig::default();
        config.chunks.screenshots = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_falls_back_to_default() {
        let value: usize = env_or("SESSIONVAULT_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
