//! Error taxonomy for the storage engine.
//!
//! Decode and capacity errors fail fast, I/O and backend errors are retried by the
//! persistence queue, integrity errors are recovered from backups where possible.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Insufficient disk space: {available_mb} MB available, {required_mb} MB required at {path}")]
    InsufficientSpace {
        available_mb: u64,
        required_mb: u64,
        path: String,
    },

    #[error("Failed to decode content: {0}")]
    Decode(String),

    #[error("Integrity check failed for {key}: {reason}")]
    Integrity { key: String, reason: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Transaction failed during {phase}: {reason}")]
    Transaction { phase: &'static str, reason: String },

    #[error("Write dropped from queue: {0}")]
    QueueDropped(String),

    #[error("Write failed after {retries} retries: {reason}")]
    QueueFailed { retries: u32, reason: String },

    #[error("Persistence queue is shut down")]
    QueueClosed,
}

impl StorageError {
    /// Transient failures the persistence queue may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::Backend(_) | StorageError::Transaction { .. }
        )
    }

    /// Message suitable for showing to the person using the application.
    pub fn user_message(&self) -> String {
        match self {
            StorageError::InsufficientSpace {
                available_mb,
                required_mb,
                ..
            } => format!(
                "Not enough disk space. {} MB available, {} MB needed. Please free up space and try again.",
                available_mb, required_mb
            ),
            StorageError::QueueFailed { .. } | StorageError::QueueDropped(_) => format!(
                "Some changes could not be saved ({}). Check available disk space and try again.",
                self
            ),
            other => other.to_string(),
        }
    }

    pub fn integrity(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::Integrity {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        StorageError::Backend(format!("Failed to get connection from pool: {}", e))
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Backend(format!("Blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_error_is_actionable() {
        let err = StorageError::InsufficientSpace {
            available_mb: 12,
            required_mb: 150,
            path: "/data".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("12 MB available"));
        assert!(msg.contains("150 MB needed"));
        assert!(msg.contains("free up space"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retry_classification() {
        let io = StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(io.is_retryable());
        assert!(StorageError::Backend("locked".into()).is_retryable());
        assert!(!StorageError::Decode("bad base64".into()).is_retryable());
        assert!(!StorageError::integrity("k", "checksum").is_retryable());
    }
}
