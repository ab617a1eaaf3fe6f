//! Batch coalescing
//!
//! Batches with the same signal kind and resource attributes are merged until
//! the group reaches `send_batch_size` records or its first member has waited
//! `timeout_ms`. Every submitter contributing to a group holds a [`Waiter`]
//! that is completed once the merged batch has been enqueued.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::core::config::BatchConfig;
use crate::domain::batch::{Batch, SignalKind};
use crate::domain::pipeline::EnqueueError;

/// Completed with the enqueue result of the batch a submission ended up in
pub type Waiter = oneshot::Sender<Result<(), EnqueueError>>;

/// A merged batch ready to be enqueued, and everyone waiting on it
#[derive(Debug)]
pub struct Flush {
    pub batch: Batch,
    pub waiters: Vec<Waiter>,
}

struct Group {
    batch: Batch,
    bytes: usize,
    waiters: Vec<Waiter>,
    opened_at: Instant,
}

impl Group {
    fn into_flush(self) -> Flush {
        Flush {
            batch: self.batch,
            waiters: self.waiters,
        }
    }
}

#[derive(Default)]
struct BatcherState {
    groups: HashMap<(SignalKind, String), Group>,
    closed: bool,
}

pub struct Batcher {
    config: BatchConfig,
    /// A merged batch never grows past this many encoded bytes
    max_bytes: usize,
    state: Mutex<BatcherState>,
}

impl Batcher {
    pub fn new(config: BatchConfig, max_bytes: u64) -> Self {
        Self {
            config,
            max_bytes: usize::try_from(max_bytes).unwrap_or(usize::MAX),
            state: Mutex::new(BatcherState::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Add a batch. Returns the groups that became ready, or the batch back if
    /// the batcher has been closed for shutdown.
    pub fn push(&self, batch: Batch, waiter: Waiter, now: Instant) -> Result<Vec<Flush>, Batch> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(batch);
        }

        let key = (batch.kind(), batch.attributes().fingerprint());
        let bytes = batch.encoded_len();
        let mut ready = Vec::new();

        let batch = match state.groups.remove(&key) {
            Some(mut group) if group.bytes + bytes <= self.max_bytes => {
                match group.batch.absorb(batch) {
                    Ok(()) => {
                        group.bytes += bytes;
                        group.waiters.push(waiter);
                        self.settle(&mut state, key, group, &mut ready);
                        return Ok(ready);
                    }
                    Err(batch) => {
                        // Same fingerprint, different attribute types
                        ready.push(group.into_flush());
                        batch
                    }
                }
            }
            Some(group) => {
                ready.push(group.into_flush());
                batch
            }
            None => batch,
        };

        let group = Group {
            batch,
            bytes,
            waiters: vec![waiter],
            opened_at: now,
        };
        self.settle(&mut state, key, group, &mut ready);
        Ok(ready)
    }

    /// Keep the group pending, or move it to `ready` once it is full
    fn settle(
        &self,
        state: &mut BatcherState,
        key: (SignalKind, String),
        group: Group,
        ready: &mut Vec<Flush>,
    ) {
        if group.batch.record_count() >= self.config.send_batch_size || group.bytes >= self.max_bytes {
            ready.push(group.into_flush());
        } else {
            state.groups.insert(key, group);
        }
    }

    /// Groups whose first member has waited at least the timeout
    pub fn flush_expired(&self, now: Instant) -> Vec<Flush> {
        let timeout = self.timeout();
        let mut state = self.state.lock();
        let expired: Vec<_> = state
            .groups
            .iter()
            .filter(|(_, g)| now.saturating_duration_since(g.opened_at) >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        let mut flushes: Vec<Flush> = expired
            .into_iter()
            .filter_map(|k| state.groups.remove(&k))
            .map(Group::into_flush)
            .collect();
        flushes.sort_by_key(|f| f.batch.seq());
        flushes
    }

    /// Close the batcher and hand back everything pending. Later pushes are
    /// refused so callers enqueue directly.
    pub fn flush_all(&self) -> Vec<Flush> {
        let mut state = self.state.lock();
        state.closed = true;
        let mut flushes: Vec<Flush> = state.groups.drain().map(|(_, g)| g.into_flush()).collect();
        flushes.sort_by_key(|f| f.batch.seq());
        flushes
    }

    pub fn pending(&self) -> usize {
        self.state.lock().groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::test_support::*;

    fn batcher(send_batch_size: usize) -> Batcher {
        Batcher::new(
            BatchConfig {
                send_batch_size,
                timeout_ms: 1000,
            },
            1024 * 1024,
        )
    }

    fn waiter() -> (Waiter, oneshot::Receiver<Result<(), EnqueueError>>) {
        oneshot::channel()
    }

    #[test]
    fn test_coalesces_until_size() {
        let batcher = batcher(5);
        let now = Instant::now();

        let (w1, _r1) = waiter();
        assert!(batcher.push(logs_batch(1, &[("service", "api")], &[9, 9]), w1, now).unwrap().is_empty());
        let (w2, _r2) = waiter();
        assert!(batcher.push(logs_batch(2, &[("service", "api")], &[9, 9]), w2, now).unwrap().is_empty());
        assert_eq!(batcher.pending(), 1);

        let (w3, _r3) = waiter();
        let ready = batcher
            .push(logs_batch(3, &[("service", "api")], &[9]), w3, now)
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].batch.seq(), 1);
        assert_eq!(ready[0].batch.record_count(), 5);
        assert_eq!(ready[0].waiters.len(), 3);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_groups_by_kind_and_attributes() {
        let batcher = batcher(100);
        let now = Instant::now();
        for (seq, batch) in [
            (1, logs_batch(1, &[("service", "api")], &[9])),
            (2, logs_batch(2, &[("service", "web")], &[9])),
            (3, metrics_batch(3, &[("service", "api")], 1)),
        ] {
            let (w, _r) = waiter();
            assert!(batcher.push(batch, w, now).unwrap().is_empty(), "seq {}", seq);
        }
        assert_eq!(batcher.pending(), 3);
    }

    #[test]
    fn test_flush_expired() {
        let batcher = batcher(100);
        let start = Instant::now();
        let (w1, _r1) = waiter();
        batcher.push(logs_batch(1, &[("service", "api")], &[9]), w1, start).unwrap();
        let (w2, _r2) = waiter();
        batcher
            .push(logs_batch(2, &[("service", "web")], &[9]), w2, start + Duration::from_millis(600))
            .unwrap();

        assert!(batcher.flush_expired(start + Duration::from_millis(999)).is_empty());
        let expired = batcher.flush_expired(start + Duration::from_millis(1000));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].batch.seq(), 1);
        assert_eq!(batcher.pending(), 1);
    }

    #[test]
    fn test_byte_bound_flushes_before_overflow() {
        let one = logs_batch(1, &[("service", "api")], &[9]);
        let size = one.encoded_len() as u64;
        let batcher = Batcher::new(
            BatchConfig {
                send_batch_size: 100,
                timeout_ms: 1000,
            },
            size * 2 - 1,
        );
        let now = Instant::now();
        let (w1, _r1) = waiter();
        assert!(batcher.push(one, w1, now).unwrap().is_empty());
        let (w2, _r2) = waiter();
        let ready = batcher
            .push(logs_batch(2, &[("service", "api")], &[9]), w2, now)
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].batch.seq(), 1);
        assert_eq!(ready[0].batch.record_count(), 1);
        assert_eq!(batcher.pending(), 1);
    }

    #[test]
    fn test_flush_all_closes() {
        let batcher = batcher(100);
        let now = Instant::now();
        let (w1, _r1) = waiter();
        batcher.push(traces_batch(2, &[], &[false]), w1, now).unwrap();
        let (w2, _r2) = waiter();
        batcher.push(logs_batch(1, &[], &[9]), w2, now).unwrap();

        let flushed = batcher.flush_all();
        assert_eq!(flushed.iter().map(|f| f.batch.seq()).collect::<Vec<_>>(), vec![1, 2]);

        let (w3, _r3) = waiter();
        let rejected = batcher.push(logs_batch(3, &[], &[9]), w3, now).unwrap_err();
        assert_eq!(rejected.seq(), 3);
    }
}
