use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Result, StorageError};
use crate::storage_backend::WriteOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn max_retries(&self, config: &QueueConfig) -> u32 {
        match self {
            Priority::Critical => config.critical_max_retries,
            Priority::Normal => config.normal_max_retries,
            Priority::Low => config.low_max_retries,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) type Reply = oneshot::Sender<Result<()>>;

pub struct QueueItem {
    pub id: Uuid,
    pub priority: Priority,
    pub ops: Vec<WriteOp>,
    pub retries: u32,
    pub enqueued_at: Instant,
    /// Set while the item waits out a retry backoff.
    pub(crate) not_before: Option<Instant>,
    pub(crate) reply: Option<Reply>,
}

impl QueueItem {
    pub(crate) fn new(priority: Priority, ops: Vec<WriteOp>, reply: Reply) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            ops,
            retries: 0,
            enqueued_at: Instant::now(),
            not_before: None,
            reply: Some(reply),
        }
    }

    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| now >= t)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.ops.iter().map(|op| op.key().to_string()).collect()
    }

    pub(crate) fn resolve(&mut self, outcome: Result<()>) {
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("ops", &self.ops.len())
            .field("retries", &self.retries)
            .finish()
    }
}

/// Completion handle for one queued write.
#[derive(Debug)]
pub struct QueueTicket {
    pub id: Uuid,
    pub(crate) rx: oneshot::Receiver<Result<()>>,
}

impl QueueTicket {
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(StorageError::QueueClosed))
    }
}

/// Terminal outcomes broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Failed {
        item_id: Uuid,
        priority: Priority,
        retries: u32,
        keys: Vec<String>,
        reason: String,
    },
    Dropped {
        item_id: Uuid,
        keys: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending_critical: usize,
    pub pending_normal: usize,
    pub pending_low: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub completed: u64,
    /// Includes dropped items.
    pub failed: u64,
    pub dropped: u64,
    pub retried: u64,
    pub batches: u64,
    pub transactions: u64,
    pub ops_queued: u64,
    pub ops_committed: u64,
}

impl QueueStats {
    pub fn pending(&self) -> usize {
        self.pending_critical + self.pending_normal + self.pending_low
    }

    pub fn coalescing_summary(&self) -> String {
        format!(
            "{} ops queued → {} transactions executed",
            self.ops_committed, self.transactions
        )
    }
}

/// `base × 2^retries`, capped to keep the shift in range.
pub(crate) fn backoff(base: Duration, retries: u32) -> Duration {
    base.saturating_mul(1u32 << retries.min(16))
}
