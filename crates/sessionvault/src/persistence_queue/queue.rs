//! Three-lane write scheduler.
//!
//! * critical: dispatched as soon as the worker sees it
//! * normal: flushed once the oldest item has waited `normal_batch_delay`
//! * low: drained in batches of `low_batch_size` when the other lanes are empty,
//!   or regardless of traffic once its oldest item is older than `low_max_wait`
//!
//! Items flushed together run as one backend transaction. A failed batch falls
//! back to per-item dispatch so one bad item cannot sink its neighbours.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::{backoff, Priority, QueueEvent, QueueItem, QueueStats, QueueTicket};
use crate::config::QueueConfig;
use crate::error::{Result, StorageError};
use crate::metrics;
use crate::storage_backend::{StorageBackend, Transaction, WriteOp};

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct Lanes {
    critical: VecDeque<QueueItem>,
    normal: VecDeque<QueueItem>,
    low: VecDeque<QueueItem>,
    in_flight: usize,
    last_low_flush: Option<Instant>,
    stats: QueueStats,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueItem> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pending(&self) -> usize {
        self.critical.len() + self.normal.len() + self.low.len()
    }

    fn is_drained(&self) -> bool {
        self.pending() == 0 && self.in_flight == 0
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            pending_critical: self.critical.len(),
            pending_normal: self.normal.len(),
            pending_low: self.low.len(),
            in_flight: self.in_flight,
            ..self.stats.clone()
        }
    }
}

enum Step {
    Dispatch(Priority, Vec<QueueItem>),
    Wait(Option<Instant>),
    Exit,
}

struct Shared {
    backend: Arc<dyn StorageBackend>,
    config: QueueConfig,
    lanes: Mutex<Lanes>,
    wake: Notify,
    drained: Notify,
    events: broadcast::Sender<QueueEvent>,
    closed: AtomicBool,
    flushers: AtomicUsize,
}

pub struct PersistenceQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceQueue {
    /// Start the queue worker on the current tokio runtime.
    pub fn start(backend: Arc<dyn StorageBackend>, config: QueueConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            backend,
            config,
            lanes: Mutex::new(Lanes::default()),
            wake: Notify::new(),
            drained: Notify::new(),
            events,
            closed: AtomicBool::new(false),
            flushers: AtomicUsize::new(0),
        });

        let worker = tokio::spawn(run_worker(Arc::clone(&shared)));
        info!("Persistence queue started on {} backend", shared.backend.name());

        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.shared.backend
    }

    pub fn enqueue(&self, priority: Priority, ops: Vec<WriteOp>) -> Result<QueueTicket> {
        Ok(self
            .enqueue_batch(vec![(priority, ops)])?
            .pop()
            .ok_or(StorageError::QueueClosed)?)
    }

    /// Enqueue several items under one lock, preserving their order within each lane.
    pub fn enqueue_batch(&self, items: Vec<(Priority, Vec<WriteOp>)>) -> Result<Vec<QueueTicket>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StorageError::QueueClosed);
        }

        let mut tickets = Vec::with_capacity(items.len());
        let mut dropped = Vec::new();
        {
            let mut lanes = self.shared.lock();
            for (priority, ops) in items {
                let (tx, rx) = oneshot::channel();
                let item = QueueItem::new(priority, ops, tx);
                tickets.push(QueueTicket { id: item.id, rx });

                if item.ops.is_empty() {
                    let mut item = item;
                    item.resolve(Ok(()));
                    continue;
                }

                lanes.stats.enqueued += 1;
                lanes.stats.ops_queued += item.ops.len() as u64;
                lanes.lane_mut(priority).push_back(item);
            }

            // Over the ceiling: shed the oldest low-priority work only.
            while lanes.pending() > self.shared.config.max_queue_size {
                match lanes.low.pop_front() {
                    Some(item) => {
                        lanes.stats.dropped += 1;
                        lanes.stats.failed += 1;
                        dropped.push(item);
                    }
                    None => break,
                }
            }
            metrics::set_queue_depth(lanes.pending());
        }

        for mut item in dropped {
            warn!("Queue full, dropping low-priority write {}", item.id);
            metrics::inc_write(item.priority.as_str(), "dropped");
            let _ = self.shared.events.send(QueueEvent::Dropped {
                item_id: item.id,
                keys: item.keys(),
            });
            item.resolve(Err(StorageError::QueueDropped(format!(
                "queue exceeded {} items",
                self.shared.config.max_queue_size
            ))));
        }

        self.shared.wake.notify_one();
        Ok(tickets)
    }

    /// Enqueue and wait for the write to commit or fail.
    pub async fn write(&self, priority: Priority, ops: Vec<WriteOp>) -> Result<()> {
        self.enqueue(priority, ops)?.wait().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.lock().snapshot()
    }

    /// Flush every lane, ignoring batching windows, and wait until nothing is pending.
    pub async fn flush(&self) {
        self.shared.flushers.fetch_add(1, Ordering::SeqCst);
        self.shared.wake.notify_one();
        self.shared.wait_drained().await;
        self.shared.flushers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Stop accepting writes, drain all lanes, and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Draining persistence queue ({} pending)", self.stats().pending());
        self.shared.wake.notify_one();

        let worker = self
            .worker
            .lock()
            .map_err(|_| StorageError::Backend("queue worker handle poisoned".to_string()))?
            .take();
        if let Some(handle) = worker {
            handle.await?;
        }
        let stats = self.stats();
        info!(
            "Persistence queue stopped: {} completed, {} failed, {}",
            stats.completed,
            stats.failed,
            stats.coalescing_summary()
        );
        Ok(())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lanes> {
        // Lane state stays consistent across a panicking holder; keep going.
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn forcing(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.flushers.load(Ordering::SeqCst) > 0
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let drained = self.lock().is_drained();
            if drained {
                return;
            }
            notified.await;
        }
    }

    fn next_step(&self) -> Step {
        let now = Instant::now();
        let force = self.forcing();
        let config = &self.config;
        let mut guard = self.lock();
        let lanes = &mut *guard;

        if lanes.is_drained() && self.closed.load(Ordering::SeqCst) {
            return Step::Exit;
        }

        let mut deadline: Option<Instant> = None;
        let mut wake_at = |t: Instant| {
            deadline = Some(deadline.map_or(t, |d| d.min(t)));
        };

        // Critical
        if let Some(head) = lanes.critical.front() {
            if head.is_ready(now) {
                let batch = take_ready(&mut lanes.critical, now, usize::MAX);
                return dispatch(lanes, Priority::Critical, batch);
            }
            if let Some(t) = head.not_before {
                wake_at(t);
            }
        }

        // Normal
        if let Some(head) = lanes.normal.front() {
            let window_end = head.enqueued_at + config.normal_batch_delay;
            let ready_at = head.not_before.map_or(window_end, |t| t.max(window_end));
            if head.is_ready(now) && (force || now >= window_end || head.retries > 0) {
                let batch = take_ready(&mut lanes.normal, now, usize::MAX);
                return dispatch(lanes, Priority::Normal, batch);
            }
            wake_at(if force { head.not_before.unwrap_or(now) } else { ready_at });
        }

        // Low
        if let Some(head) = lanes.low.front() {
            let idle = lanes.critical.is_empty() && lanes.normal.is_empty();
            let poll_at = lanes
                .last_low_flush
                .map_or(now, |t| t + config.idle_poll_interval);
            let starve_at = head.enqueued_at + config.low_max_wait;
            let starving = now >= starve_at;

            if head.is_ready(now) && (force || starving || (idle && now >= poll_at)) {
                lanes.last_low_flush = Some(now);
                let batch = take_ready(&mut lanes.low, now, config.low_batch_size);
                if starving && !idle {
                    debug!("Draining starved low-priority lane ({} items)", batch.len());
                }
                return dispatch(lanes, Priority::Low, batch);
            }
            let mut next = if idle { poll_at.min(starve_at) } else { starve_at };
            if let Some(t) = head.not_before {
                next = next.max(t);
            }
            wake_at(next);
        }

        Step::Wait(deadline)
    }

    /// Run one batch. Items waiting on a retry go back to the front of their lane.
    async fn execute(&self, priority: Priority, mut batch: Vec<QueueItem>) {
        let op_count: usize = batch.iter().map(|item| item.ops.len()).sum();

        if batch.len() > 1 {
            let mut tx = Transaction::begin(Arc::clone(&self.backend));
            for item in &batch {
                for op in &item.ops {
                    tx.push(op.clone());
                }
            }
            match tx.commit().await {
                Ok(()) => {
                    debug!(
                        "Coalesced {} {} writes ({} ops) into one transaction",
                        batch.len(),
                        priority,
                        op_count
                    );
                    self.record_transaction(op_count);
                    let completed = batch.len();
                    for item in batch.iter_mut() {
                        metrics::inc_write(priority.as_str(), "committed");
                        item.resolve(Ok(()));
                    }
                    self.finish(completed, 0, 0, Vec::new());
                    return;
                }
                Err(e) => {
                    warn!(
                        "Batched commit of {} {} writes failed, retrying individually: {}",
                        batch.len(),
                        priority,
                        e
                    );
                }
            }
        }

        let mut completed = 0;
        let mut failed = 0;
        let mut retried = 0;
        let mut requeue: Vec<QueueItem> = Vec::new();

        for mut item in batch {
            // Keep lane order: once one item waits for a retry, the rest wait behind it.
            if !requeue.is_empty() {
                requeue.push(item);
                continue;
            }

            let count = item.ops.len();
            let mut tx = Transaction::begin(Arc::clone(&self.backend));
            for op in &item.ops {
                tx.push(op.clone());
            }

            match tx.commit().await {
                Ok(()) => {
                    self.record_transaction(count);
                    metrics::inc_write(priority.as_str(), "committed");
                    item.resolve(Ok(()));
                    completed += 1;
                }
                Err(e) if e.is_retryable() && item.retries < priority.max_retries(&self.config) => {
                    item.retries += 1;
                    let delay = backoff(self.config.retry_base_delay, item.retries);
                    warn!(
                        "Write {} failed ({}), retry {} in {:?}",
                        item.id, e, item.retries, delay
                    );
                    item.not_before = Some(Instant::now() + delay);
                    requeue.push(item);
                    retried += 1;
                }
                Err(e) => {
                    error!(
                        "Write {} failed permanently after {} retries: {}",
                        item.id, item.retries, e
                    );
                    metrics::inc_write(priority.as_str(), "failed");
                    let _ = self.events.send(QueueEvent::Failed {
                        item_id: item.id,
                        priority,
                        retries: item.retries,
                        keys: item.keys(),
                        reason: e.to_string(),
                    });
                    let outcome = match e {
                        StorageError::InsufficientSpace { .. } | StorageError::InvalidKey(_) => Err(e),
                        other => Err(StorageError::QueueFailed {
                            retries: item.retries,
                            reason: other.to_string(),
                        }),
                    };
                    item.resolve(outcome);
                    failed += 1;
                }
            }
        }

        self.finish(completed, failed, retried, requeue);
    }

    fn record_transaction(&self, ops: usize) {
        metrics::inc_transaction();
        let mut lanes = self.lock();
        lanes.stats.transactions += 1;
        lanes.stats.ops_committed += ops as u64;
    }

    fn finish(&self, completed: usize, failed: usize, retried: usize, requeue: Vec<QueueItem>) {
        let mut lanes = self.lock();
        lanes.in_flight -= completed + failed + requeue.len();
        lanes.stats.completed += completed as u64;
        lanes.stats.failed += failed as u64;
        lanes.stats.retried += retried as u64;
        for item in requeue.into_iter().rev() {
            let priority = item.priority;
            lanes.lane_mut(priority).push_front(item);
        }
        metrics::set_queue_depth(lanes.pending());
        let drained = lanes.is_drained();
        drop(lanes);

        if drained {
            self.drained.notify_waiters();
        }
    }
}

fn take_ready(lane: &mut VecDeque<QueueItem>, now: Instant, limit: usize) -> Vec<QueueItem> {
    let mut batch = Vec::new();
    while batch.len() < limit && lane.front().is_some_and(|item| item.is_ready(now)) {
        if let Some(item) = lane.pop_front() {
            batch.push(item);
        }
    }
    batch
}

fn dispatch(lanes: &mut Lanes, priority: Priority, batch: Vec<QueueItem>) -> Step {
    lanes.in_flight += batch.len();
    lanes.stats.batches += 1;
    Step::Dispatch(priority, batch)
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        match shared.next_step() {
            Step::Dispatch(priority, batch) => shared.execute(priority, batch).await,
            Step::Wait(deadline) => {
                let notified = shared.wake.notified();
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = notified => {}
                            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                        }
                    }
                    None => notified.await,
                }
            }
            Step::Exit => break,
        }
    }
    shared.drained.notify_waiters();
    debug!("Persistence queue worker exited");
}
