//! Per-pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use utoipa::ToSchema;

use crate::data::QueueSnapshot;

#[derive(Debug, Default)]
pub struct PipelineStats {
    received_batches: AtomicU64,
    received_records: AtomicU64,
    enqueued: AtomicU64,
    exported: AtomicU64,
    export_failures: AtomicU64,
    retries_total: AtomicU64,
    dead_lettered: AtomicU64,
    evicted: AtomicU64,
    shed_records: AtomicU64,
    processor_errors: AtomicU64,
    last_export_retry_count: AtomicU64,
}

impl PipelineStats {
    pub fn record_received(&self, records: usize) {
        self.received_batches.fetch_add(1, Ordering::Relaxed);
        self.received_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// A successful export of an entry that had failed `retry_count` times
    pub fn record_exported(&self, retry_count: u32) {
        self.exported.fetch_add(1, Ordering::Relaxed);
        self.last_export_retry_count
            .store(u64::from(retry_count), Ordering::Relaxed);
    }

    pub fn record_export_failure(&self) {
        self.export_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_shed(&self, records: usize) {
        self.shed_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_processor_error(&self) {
        self.processor_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, name: &str, queue: QueueSnapshot) -> PipelineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStatsSnapshot {
            name: name.to_string(),
            received_batches: load(&self.received_batches),
            received_records: load(&self.received_records),
            enqueued: load(&self.enqueued),
            exported: load(&self.exported),
            export_failures: load(&self.export_failures),
            retries_total: load(&self.retries_total),
            dead_lettered: load(&self.dead_lettered),
            evicted: load(&self.evicted),
            shed_records: load(&self.shed_records),
            processor_errors: load(&self.processor_errors),
            last_export_retry_count: load(&self.last_export_retry_count),
            queue_depth: queue.depth,
            queue_bytes: queue.bytes,
            queue_max_entries: queue.max_entries,
            queue_max_bytes: queue.max_bytes,
            oldest_enqueued_at_ms: queue.oldest_enqueued_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PipelineStatsSnapshot {
    pub name: String,
    pub received_batches: u64,
    pub received_records: u64,
    pub enqueued: u64,
    pub exported: u64,
    pub export_failures: u64,
    pub retries_total: u64,
    pub dead_lettered: u64,
    pub evicted: u64,
    pub shed_records: u64,
    pub processor_errors: u64,
    /// Retry count of the most recently exported entry
    pub last_export_retry_count: u64,
    pub queue_depth: usize,
    pub queue_bytes: u64,
    pub queue_max_entries: usize,
    pub queue_max_bytes: u64,
    pub oldest_enqueued_at_ms: Option<u64>,
}
