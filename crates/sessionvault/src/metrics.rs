// sessionvault/src/metrics.rs

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static WRITES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TRANSACTIONS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static CACHE_LOOKUPS: OnceLock<IntCounterVec> = OnceLock::new();
static GC_FREED_BYTES: OnceLock<IntCounter> = OnceLock::new();
static INDEX_ERRORS: OnceLock<IntCounter> = OnceLock::new();

/// Register collectors with the process registry. Safe to call more than once.
pub fn init_metrics() {
    let queue_depth = QUEUE_DEPTH.get_or_init(|| {
        IntGauge::new("sessionvault_queue_depth", "Writes waiting in the persistence queue")
            .expect("static metric definition")
    });

    let writes_total = WRITES_TOTAL.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("sessionvault_writes_total", "Queued writes by priority and outcome"),
            &["priority", "outcome"],
        )
        .expect("static metric definition")
    });

    let transactions_total = TRANSACTIONS_TOTAL.get_or_init(|| {
        IntCounter::new(
            "sessionvault_transactions_total",
            "Backend transactions executed by the persistence queue",
        )
        .expect("static metric definition")
    });

    let cache_lookups = CACHE_LOOKUPS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("sessionvault_cache_lookups_total", "Cache lookups by result"),
            &["result"],
        )
        .expect("static metric definition")
    });

    let gc_freed = GC_FREED_BYTES.get_or_init(|| {
        IntCounter::new(
            "sessionvault_gc_freed_bytes_total",
            "Attachment bytes reclaimed by garbage collection",
        )
        .expect("static metric definition")
    });

    let index_errors = INDEX_ERRORS.get_or_init(|| {
        IntCounter::new(
            "sessionvault_index_errors_total",
            "Index maintenance failures that did not fail the record write",
        )
        .expect("static metric definition")
    });

    REGISTRY.register(Box::new(queue_depth.clone())).ok();
    REGISTRY.register(Box::new(writes_total.clone())).ok();
    REGISTRY.register(Box::new(transactions_total.clone())).ok();
    REGISTRY.register(Box::new(cache_lookups.clone())).ok();
    REGISTRY.register(Box::new(gc_freed.clone())).ok();
    REGISTRY.register(Box::new(index_errors.clone())).ok();
}

pub fn set_queue_depth(depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth as i64);
    }
}

pub fn inc_write(priority: &str, outcome: &str) {
    if let Some(counter) = WRITES_TOTAL.get() {
        counter.with_label_values(&[priority, outcome]).inc();
    }
}

pub fn inc_transaction() {
    if let Some(counter) = TRANSACTIONS_TOTAL.get() {
        counter.inc();
    }
}

pub fn inc_cache(hit: bool) {
    if let Some(counter) = CACHE_LOOKUPS.get() {
        counter
            .with_label_values(&[if hit { "hit" } else { "miss" }])
            .inc();
    }
}

pub fn add_gc_freed(bytes: u64) {
    if let Some(counter) = GC_FREED_BYTES.get() {
        counter.inc_by(bytes);
    }
}

pub fn inc_index_error() {
    if let Some(counter) = INDEX_ERRORS.get() {
        counter.inc();
    }
}

/// Text exposition of everything registered so far.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_after_init() {
        init_metrics();
        init_metrics();
        inc_write("normal", "committed");
        inc_transaction();
        set_queue_depth(3);

        let text = gather_metrics();
        assert!(text.contains("sessionvault_writes_total"));
        assert!(text.contains("sessionvault_queue_depth"));
    }
}
