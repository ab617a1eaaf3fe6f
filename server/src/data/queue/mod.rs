//! Durable export queue
//!
//! One queue per pipeline, persisted under `<data_dir>/queue/<pipeline>/` as
//! two append-only logs:
//!
//! - `entries.log`: one [`PutRecord`] per enqueued batch, carrying the encoded
//!   OTLP request that will be sent downstream
//! - `index.log`: [`IndexRecord`]s for retry bookkeeping and removals
//!
//! Opening a queue replays both logs and offers the surviving entries again in
//! their original order, ahead of anything enqueued later. Compaction rewrites
//! the live entries (with their retry metadata) into a fresh `entries.log` and
//! replaces `index.log` with the few records written while the rewrite ran.
//! The queue lock is only held to snapshot the live entries and to swap the
//! files in.
//!
//! Delivery order is strict head-of-line FIFO: a failed entry keeps its place
//! and blocks the entries behind it until its retry time has passed.

mod error;
mod log;
mod record;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

pub use error::QueueError;
use log::{LogFile, StagedLog};
use record::{IndexRecord, OP_REMOVE, OP_RETRY, PutRecord};

use crate::core::config::QueueConfig;
use crate::core::constants::{QUEUE_ENTRIES_FILE, QUEUE_INDEX_FILE};
use crate::domain::SignalKind;

/// A persisted batch awaiting export
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: u64,
    pub batch_seq: u64,
    pub kind: SignalKind,
    pub payload: Bytes,
    pub enqueued_at_ms: u64,
    pub retry_count: u32,
    pub next_retry_at_ms: u64,
}

impl QueueEntry {
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    fn to_record(&self) -> PutRecord {
        PutRecord {
            id: self.id,
            batch_seq: self.batch_seq,
            kind: self.kind.as_u32(),
            enqueued_at_ms: self.enqueued_at_ms,
            retry_count: self.retry_count,
            next_retry_at_ms: self.next_retry_at_ms,
            payload: self.payload.clone(),
        }
    }

    fn from_record(record: PutRecord) -> Option<Self> {
        let kind = SignalKind::from_u32(record.kind)?;
        Some(Self {
            id: record.id,
            batch_seq: record.batch_seq,
            kind,
            payload: record.payload,
            enqueued_at_ms: record.enqueued_at_ms,
            retry_count: record.retry_count,
            next_retry_at_ms: record.next_retry_at_ms,
        })
    }
}

/// What the exporter should do next
#[derive(Debug)]
pub enum NextEntry {
    /// The head entry is eligible now
    Ready(QueueEntry),
    /// The head entry becomes eligible after this delay
    Wait(Duration),
    Empty,
}

/// An entry dropped to make room for a newer one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedEntry {
    pub id: u64,
    pub batch_seq: u64,
    pub size: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub id: u64,
    pub evicted: Vec<EvictedEntry>,
}

/// Point-in-time view of queue occupancy
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
    pub oldest_enqueued_at_ms: Option<u64>,
}

impl QueueSnapshot {
    /// Fraction of capacity in use (the tighter of the entry and byte bounds)
    pub fn occupancy(&self) -> f64 {
        let by_entries = self.depth as f64 / self.max_entries.max(1) as f64;
        let by_bytes = self.bytes as f64 / self.max_bytes.max(1) as f64;
        by_entries.max(by_bytes)
    }
}

struct QueueInner {
    entries: VecDeque<QueueEntry>,
    bytes: u64,
    next_id: u64,
    entries_log: LogFile,
    index_log: LogFile,
    /// Records in the logs that no longer describe a live entry
    dead_records: usize,
}

impl QueueInner {
    fn position(&self, id: u64) -> Option<usize> {
        // Acks almost always hit the head
        self.entries.iter().position(|e| e.id == id)
    }

    fn remove_at(&mut self, pos: usize) -> Result<QueueEntry, QueueError> {
        let id = self.entries[pos].id;
        self.index_log.append(&IndexRecord::remove(id))?;
        let entry = self
            .entries
            .remove(pos)
            .ok_or_else(|| QueueError::Task(format!("entry {} vanished during removal", id)))?;
        self.bytes -= entry.size();
        self.dead_records += 2;
        Ok(entry)
    }

    /// Evict from the head until `incoming` more entries totalling
    /// `incoming_bytes` fit within the bounds
    fn make_room(
        &mut self,
        config: &QueueConfig,
        incoming: usize,
        incoming_bytes: u64,
    ) -> Result<Vec<EvictedEntry>, QueueError> {
        let mut evicted = Vec::new();
        while !self.entries.is_empty()
            && (self.entries.len() + incoming > config.max_entries
                || self.bytes + incoming_bytes > config.max_bytes)
        {
            let entry = self.remove_at(0)?;
            evicted.push(EvictedEntry {
                id: entry.id,
                batch_seq: entry.batch_seq,
                size: entry.size(),
                retry_count: entry.retry_count,
            });
        }
        Ok(evicted)
    }
}

/// Live entries already written to a replacement `entries.log`
struct StagedCompaction {
    snapshot: Vec<PutRecord>,
    entries_log: StagedLog,
}

/// Sentinel for "no oldest entry" in [`Occupancy`]
const NO_OLDEST: u64 = u64::MAX;

/// Depth and size mirrored out of the lock, so observers never wait on IO
#[derive(Debug)]
struct Occupancy {
    depth: AtomicUsize,
    bytes: AtomicU64,
    oldest_enqueued_at_ms: AtomicU64,
}

impl Occupancy {
    fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            oldest_enqueued_at_ms: AtomicU64::new(NO_OLDEST),
        }
    }

    fn publish(&self, inner: &QueueInner) {
        self.depth.store(inner.entries.len(), Ordering::Release);
        self.bytes.store(inner.bytes, Ordering::Release);
        let oldest = inner
            .entries
            .front()
            .map_or(NO_OLDEST, |e| e.enqueued_at_ms);
        self.oldest_enqueued_at_ms.store(oldest, Ordering::Release);
    }
}

/// Disk-backed bounded FIFO owned by a single pipeline
pub struct DurableQueue {
    name: String,
    dir: PathBuf,
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    occupancy: Occupancy,
    /// Highest batch sequence number found in the logs at open
    recovered_max_batch_seq: u64,
    /// Held for the whole of a compaction; at most one runs at a time
    compacting: Mutex<()>,
    notify: Notify,
}

impl DurableQueue {
    /// Open (or create) the queue in `dir`, recovering anything persisted there
    pub fn open(name: &str, dir: &Path, config: QueueConfig) -> Result<Self, QueueError> {
        fs::create_dir_all(dir)?;
        let entries_path = dir.join(QUEUE_ENTRIES_FILE);
        let index_path = dir.join(QUEUE_INDEX_FILE);

        let puts = log::recover::<PutRecord>(&entries_path)?;
        let index = log::recover::<IndexRecord>(&index_path)?;
        let total_records = puts.records.len() + index.records.len();
        let recovered_max_batch_seq = puts.records.iter().map(|r| r.batch_seq).max().unwrap_or(0);
        let (entries, next_id) = replay(name, puts.records, index.records);
        let dead_records = total_records - entries.len();
        let bytes = entries.iter().map(QueueEntry::size).sum();

        let inner = QueueInner {
            entries,
            bytes,
            next_id,
            entries_log: LogFile::open(&entries_path, config.fsync)?,
            index_log: LogFile::open(&index_path, config.fsync)?,
            dead_records,
        };

        let queue = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            config,
            inner: Mutex::new(inner),
            occupancy: Occupancy::new(),
            recovered_max_batch_seq,
            compacting: Mutex::new(()),
            notify: Notify::new(),
        };

        let dead_records = {
            let mut inner = queue.inner.lock();
            // Capacity may have shrunk since the entries were written
            let evicted = inner.make_room(&queue.config, 0, 0)?;
            if !evicted.is_empty() {
                tracing::warn!(
                    pipeline = %queue.name,
                    evicted = evicted.len(),
                    "Recovered queue exceeds capacity, evicted oldest entries"
                );
            }

            if !inner.entries.is_empty() {
                tracing::info!(
                    pipeline = %queue.name,
                    entries = inner.entries.len(),
                    bytes = inner.bytes,
                    "Recovered queued entries"
                );
            }
            queue.occupancy.publish(&inner);
            inner.dead_records
        };

        if dead_records > 0 {
            queue.compact()?;
        }

        Ok(queue)
    }

    /// Read the persisted entries of a queue directory without modifying it
    pub fn inspect(name: &str, dir: &Path) -> Result<Vec<QueueEntry>, QueueError> {
        let puts = log::read::<PutRecord>(&dir.join(QUEUE_ENTRIES_FILE))?;
        let index = log::read::<IndexRecord>(&dir.join(QUEUE_INDEX_FILE))?;
        let (entries, _) = replay(name, puts.records, index.records);
        Ok(entries.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Includes entries already exported or dead-lettered but not yet
    /// compacted away
    pub fn recovered_max_batch_seq(&self) -> u64 {
        self.recovered_max_batch_seq
    }

    /// Append a batch payload, evicting the oldest entries if the queue is full
    pub fn enqueue(
        &self,
        batch_seq: u64,
        kind: SignalKind,
        payload: Bytes,
        now_ms: u64,
    ) -> Result<EnqueueOutcome, QueueError> {
        let size = payload.len() as u64;
        if size > self.config.max_bytes {
            return Err(QueueError::EntryTooLarge {
                size,
                max_bytes: self.config.max_bytes,
            });
        }

        let mut inner = self.inner.lock();
        let evicted = inner.make_room(&self.config, 1, size)?;

        let entry = QueueEntry {
            id: inner.next_id,
            batch_seq,
            kind,
            payload,
            enqueued_at_ms: now_ms,
            retry_count: 0,
            next_retry_at_ms: now_ms,
        };
        inner.entries_log.append(&entry.to_record())?;

        let id = entry.id;
        inner.next_id += 1;
        inner.bytes += size;
        inner.entries.push_back(entry);
        self.occupancy.publish(&inner);
        let compact = self.compaction_due(&inner);
        drop(inner);

        self.notify.notify_one();
        if compact {
            self.compact()?;
        }
        Ok(EnqueueOutcome { id, evicted })
    }

    /// The head entry if it may be attempted at `now_ms`
    pub fn next_ready(&self, now_ms: u64) -> NextEntry {
        let inner = self.inner.lock();
        match inner.entries.front() {
            None => NextEntry::Empty,
            Some(entry) if entry.next_retry_at_ms <= now_ms => NextEntry::Ready(entry.clone()),
            Some(entry) => NextEntry::Wait(Duration::from_millis(entry.next_retry_at_ms - now_ms)),
        }
    }

    /// Wait until something is enqueued
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Delete an exported entry. Returns false if it was already evicted.
    pub fn ack(&self, id: u64) -> Result<bool, QueueError> {
        Ok(self.remove(id)?.is_some())
    }

    /// Delete an entry and hand it back (dead-lettering)
    pub fn remove(&self, id: u64) -> Result<Option<QueueEntry>, QueueError> {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.position(id) else {
            return Ok(None);
        };
        let entry = inner.remove_at(pos)?;
        self.occupancy.publish(&inner);
        let compact = self.compaction_due(&inner);
        drop(inner);

        if compact {
            self.compact()?;
        }
        Ok(Some(entry))
    }

    /// Record a failed attempt: bump the retry count and push back eligibility.
    /// Returns the new retry count, or None if the entry is gone.
    pub fn record_failure(
        &self,
        id: u64,
        next_retry_at_ms: u64,
    ) -> Result<Option<u32>, QueueError> {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.position(id) else {
            return Ok(None);
        };

        let retry_count = inner.entries[pos].retry_count + 1;
        let next_retry_at_ms = next_retry_at_ms.max(inner.entries[pos].next_retry_at_ms);
        inner
            .index_log
            .append(&IndexRecord::retry(id, retry_count, next_retry_at_ms))?;

        let entry = &mut inner.entries[pos];
        entry.retry_count = retry_count;
        entry.next_retry_at_ms = next_retry_at_ms;
        inner.dead_records += 1;
        let compact = self.compaction_due(&inner);
        drop(inner);

        if compact {
            self.compact()?;
        }
        Ok(Some(retry_count))
    }

    pub fn len(&self) -> usize {
        self.occupancy.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let oldest = self.occupancy.oldest_enqueued_at_ms.load(Ordering::Acquire);
        QueueSnapshot {
            depth: self.len(),
            bytes: self.occupancy.bytes.load(Ordering::Acquire),
            max_entries: self.config.max_entries,
            max_bytes: self.config.max_bytes,
            oldest_enqueued_at_ms: (oldest != NO_OLDEST).then_some(oldest),
        }
    }

    /// Copy of all pending entries in delivery order
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    fn compaction_due(&self, inner: &QueueInner) -> bool {
        inner.dead_records >= self.config.compact_after
    }

    /// Rewrite the logs so they only describe live entries.
    ///
    /// The bulk of the new `entries.log` is written from a snapshot without
    /// holding the queue lock. Entries enqueued meanwhile are appended and
    /// retries or removals made meanwhile go into the new `index.log` before
    /// both files are swapped in under the lock.
    pub fn compact(&self) -> Result<(), QueueError> {
        let Some(_compacting) = self.compacting.try_lock() else {
            return Ok(());
        };
        let staged = self.stage_compaction()?;
        self.finish_compaction(staged)
    }

    fn stage_compaction(&self) -> Result<StagedCompaction, QueueError> {
        let snapshot: Vec<PutRecord> = {
            let inner = self.inner.lock();
            inner.entries.iter().map(QueueEntry::to_record).collect()
        };
        let mut entries_log = StagedLog::create(&self.dir.join(QUEUE_ENTRIES_FILE))?;
        entries_log.write_all(&snapshot)?;
        Ok(StagedCompaction {
            snapshot,
            entries_log,
        })
    }

    fn finish_compaction(&self, staged: StagedCompaction) -> Result<(), QueueError> {
        let StagedCompaction {
            snapshot,
            mut entries_log,
        } = staged;
        let entries_path = self.dir.join(QUEUE_ENTRIES_FILE);
        let index_path = self.dir.join(QUEUE_INDEX_FILE);

        let mut inner = self.inner.lock();
        let written: HashMap<u64, &PutRecord> = snapshot.iter().map(|r| (r.id, r)).collect();
        let mut puts = Vec::new();
        let mut index = Vec::new();
        let mut dead_records = 0;
        for entry in &inner.entries {
            match written.get(&entry.id) {
                None => puts.push(entry.to_record()),
                Some(record)
                    if record.retry_count != entry.retry_count
                        || record.next_retry_at_ms != entry.next_retry_at_ms =>
                {
                    index.push(IndexRecord::retry(
                        entry.id,
                        entry.retry_count,
                        entry.next_retry_at_ms,
                    ));
                    dead_records += 1;
                }
                Some(_) => {}
            }
        }
        let live: HashSet<u64> = inner.entries.iter().map(|e| e.id).collect();
        for record in &snapshot {
            if !live.contains(&record.id) {
                index.push(IndexRecord::remove(record.id));
                dead_records += 2;
            }
        }

        entries_log.write_all(&puts)?;
        let mut index_log = StagedLog::create(&index_path)?;
        index_log.write_all(&index)?;

        // A crash between the two swaps leaves the new entries with the old
        // index, which still holds every removal made since the snapshot
        entries_log.install(&entries_path)?;
        inner.entries_log.reopen()?;
        index_log.install(&index_path)?;
        inner.index_log.reopen()?;

        tracing::debug!(
            pipeline = %self.name,
            live = inner.entries.len(),
            dropped_records = inner.dead_records,
            "Compacted queue logs"
        );
        inner.dead_records = dead_records;
        Ok(())
    }

    /// Run a queue operation on the blocking pool (file IO may fsync)
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, QueueError>
    where
        F: FnOnce(&DurableQueue) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let queue = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .map_err(|e| QueueError::Task(e.to_string()))?
    }
}

/// Rebuild pending entries from replayed records. Returns entries in id order
/// and the next free id.
fn replay(
    name: &str,
    puts: Vec<PutRecord>,
    index: Vec<IndexRecord>,
) -> (VecDeque<QueueEntry>, u64) {
    let mut next_id = 0u64;
    let mut slots: Vec<Option<QueueEntry>> = Vec::with_capacity(puts.len());
    let mut by_id: HashMap<u64, usize> = HashMap::with_capacity(puts.len());

    for record in puts {
        next_id = next_id.max(record.id + 1);
        let id = record.id;
        match QueueEntry::from_record(record) {
            Some(entry) => {
                by_id.insert(id, slots.len());
                slots.push(Some(entry));
            }
            None => {
                tracing::warn!(pipeline = %name, id, "Skipping queue entry with unknown signal kind");
            }
        }
    }

    for record in index {
        let Some(&slot) = by_id.get(&record.id) else {
            continue;
        };
        match record.op {
            OP_RETRY => {
                if let Some(entry) = slots[slot].as_mut() {
                    entry.retry_count = entry.retry_count.max(record.retry_count);
                    entry.next_retry_at_ms = entry.next_retry_at_ms.max(record.next_retry_at_ms);
                }
            }
            OP_REMOVE => slots[slot] = None,
            op => tracing::warn!(pipeline = %name, op, "Skipping unknown queue index record"),
        }
    }

    let mut entries: Vec<QueueEntry> = slots.into_iter().flatten().collect();
    entries.sort_by_key(|e| e.id);
    (entries.into(), next_id)
}
