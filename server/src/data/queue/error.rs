//! Queue error types

use thiserror::Error;

/// Error type for durable queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Reading or writing the queue logs failed
    #[error("queue IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A single entry can never fit within the configured byte capacity
    #[error("entry of {size} bytes exceeds queue capacity of {max_bytes} bytes")]
    EntryTooLarge { size: u64, max_bytes: u64 },

    /// Blocking queue task panicked or was cancelled
    #[error("queue task failed: {0}")]
    Task(String),
}
