//! Persistence queue - every write to the backend goes through here

pub mod queue;
pub mod types;

pub use queue::PersistenceQueue;
pub use types::{Priority, QueueEvent, QueueItem, QueueStats, QueueTicket};
