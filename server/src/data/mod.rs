//! Data storage layer
//!
//! - `queue` - Per-pipeline durable export queue (append-only logs on disk)
//! - `deadletter` - Sink for batches the exporter gave up on

pub mod deadletter;
pub mod queue;

pub use deadletter::DeadLetterSink;
pub use queue::{
    DurableQueue, EnqueueOutcome, EvictedEntry, NextEntry, QueueEntry, QueueError, QueueSnapshot,
};
