// sessionvault/src/lib.rs

pub mod cache_management;
pub mod chunked_store;
pub mod compression;
pub mod config;
pub mod content_store;
pub mod disk_space;
pub mod engine;
pub mod entity_store;
pub mod error;
pub mod index_engine;
pub mod metrics;
pub mod migration;
pub mod persistence_queue;
pub mod records;
pub mod storage_backend;
pub mod telemetry;

#[cfg(test)]
mod test_support;

// Public API exports
pub use config::{BackendKind, StorageConfig};
pub use engine::{EngineStats, StorageEngine};
pub use error::{Result, StorageError};
pub use records::{AudioSegment, Note, Screenshot, Session, SessionInfo, SessionMetadata, SessionStatus, Task, VideoChunk};

pub use content_store::{AttachmentMetadata, AttachmentTypeCounts, CasStats, GcReport};
pub use index_engine::{EntityKind, EntityRef, Query, QueryOperator, QueryResult, SessionQueryFilters, SortOrder};
pub use persistence_queue::{Priority, QueueEvent};
