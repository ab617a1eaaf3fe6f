//! Per-pipeline export loop
//!
//! One attempt at a time, always on the queue head. A failed head keeps its
//! place until it is exported, dead-lettered or evicted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{BackoffPolicy, ExportError, Exporter};
use crate::core::config::RetryConfig;
use crate::data::{DeadLetterSink, DurableQueue, NextEntry, QueueEntry, QueueError};
use crate::domain::stats::PipelineStats;
use crate::utils::time::now_ms;

pub struct ExportWorker {
    pipeline: String,
    queue: Arc<DurableQueue>,
    exporter: Arc<dyn Exporter>,
    retry: RetryConfig,
    backoff: BackoffPolicy,
    timeout: Duration,
    deadletter: Arc<DeadLetterSink>,
    stats: Arc<PipelineStats>,
}

/// Result of settling one attempt
enum Settled {
    Done,
    /// Queue storage failed; pause before touching it again
    StorageError,
}

impl ExportWorker {
    pub fn new(
        pipeline: &str,
        queue: Arc<DurableQueue>,
        exporter: Arc<dyn Exporter>,
        retry: RetryConfig,
        timeout: Duration,
        deadletter: Arc<DeadLetterSink>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            queue,
            exporter,
            backoff: BackoffPolicy::from(&retry),
            retry,
            timeout,
            deadletter,
            stats,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::debug!(
            pipeline = %self.pipeline,
            endpoint = %self.exporter.endpoint(),
            pending = self.queue.len(),
            "Export worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.queue.next_ready(now_ms()) {
                NextEntry::Ready(entry) => {
                    let settled = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::debug!(
                                pipeline = %self.pipeline,
                                id = entry.id,
                                "Abandoning in-flight export for shutdown"
                            );
                            break;
                        }
                        result = self.attempt(&entry) => self.settle(entry, result).await,
                    };
                    if let Settled::StorageError = settled {
                        let pause = Duration::from_millis(self.retry.initial_ms);
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
                NextEntry::Wait(delay) => {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                NextEntry::Empty => {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break,
                        _ = self.queue.notified() => {}
                    }
                }
            }
        }

        tracing::debug!(pipeline = %self.pipeline, pending = self.queue.len(), "Export worker stopped");
    }

    async fn attempt(&self, entry: &QueueEntry) -> Result<(), ExportError> {
        match tokio::time::timeout(
            self.timeout,
            self.exporter.export(entry.kind, entry.payload.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExportError::Transient(format!(
                "export timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    async fn settle(&self, entry: QueueEntry, result: Result<(), ExportError>) -> Settled {
        let outcome = match result {
            Ok(()) => self.exported(&entry).await,
            Err(ExportError::Permanent(reason)) => {
                self.stats.record_export_failure();
                self.dead_letter(entry, &reason).await
            }
            Err(ExportError::Transient(reason)) => {
                self.stats.record_export_failure();
                self.retry_later(entry, &reason).await
            }
        };
        match outcome {
            Ok(()) => Settled::Done,
            Err(e) => {
                tracing::error!(pipeline = %self.pipeline, error = %e, "Queue update failed after export attempt");
                Settled::StorageError
            }
        }
    }

    async fn exported(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let id = entry.id;
        let acked = self.queue.blocking(move |q| q.ack(id)).await?;
        self.stats.record_exported(entry.retry_count);
        if acked {
            tracing::trace!(pipeline = %self.pipeline, id, batch_seq = entry.batch_seq, "Exported");
        } else {
            tracing::debug!(pipeline = %self.pipeline, id, "Exported entry was evicted during the attempt");
        }
        Ok(())
    }

    async fn retry_later(&self, entry: QueueEntry, reason: &str) -> Result<(), QueueError> {
        let attempt = entry.retry_count.saturating_add(1);
        if attempt > self.retry.max_retries {
            let reason = format!("retries exhausted after {} attempts: {}", attempt, reason);
            let entry = QueueEntry {
                retry_count: attempt,
                ..entry
            };
            return self.dead_letter(entry, &reason).await;
        }

        let delay = self.backoff.delay(attempt);
        let id = entry.id;
        let next_retry_at_ms = now_ms() + delay.as_millis() as u64;
        let recorded = self
            .queue
            .blocking(move |q| q.record_failure(id, next_retry_at_ms))
            .await?;
        if recorded.is_some() {
            self.stats.record_retry();
        }
        tracing::warn!(
            pipeline = %self.pipeline,
            id,
            batch_seq = entry.batch_seq,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Export failed, retrying"
        );
        Ok(())
    }

    /// Write the entry to the dead-letter sink, then drop it from the queue
    async fn dead_letter(&self, entry: QueueEntry, reason: &str) -> Result<(), QueueError> {
        let id = entry.id;
        if let Err(e) = self.deadletter.write(&entry, reason).await {
            // Keep the entry; it comes back after the longest backoff
            tracing::error!(pipeline = %self.pipeline, id, error = %e, "Failed to write dead letter");
            let next_retry_at_ms = now_ms() + self.backoff.max().as_millis() as u64;
            self.queue
                .blocking(move |q| q.record_failure(id, next_retry_at_ms))
                .await?;
            return Ok(());
        }

        if self.queue.blocking(move |q| q.remove(id)).await?.is_some() {
            self.stats.record_dead_lettered();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{DeadLetterPolicy, FsyncPolicy, QueueConfig};
    use crate::domain::SignalKind;
    use crate::domain::pipeline::test_support::RecordingExporter;
    use bytes::Bytes;

    struct Harness {
        dir: tempfile::TempDir,
        queue: Arc<DurableQueue>,
        exporter: Arc<RecordingExporter>,
        stats: Arc<PipelineStats>,
        shutdown_tx: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            initial_ms: 1,
            max_ms: 5,
            multiplier: 2.0,
            jitter: 0.0,
            max_retries,
        }
    }

    fn start(script: Vec<Result<(), ExportError>>, max_retries: u32, entries: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig {
            fsync: FsyncPolicy::Never,
            ..Default::default()
        };
        let queue = Arc::new(DurableQueue::open("logs", &dir.path().join("queue"), config).unwrap());
        for seq in 1..=entries as u64 {
            queue
                .enqueue(seq, SignalKind::Logs, Bytes::from(format!("batch-{}", seq)), now_ms())
                .unwrap();
        }
        let exporter = Arc::new(RecordingExporter::failing_with(script));
        let stats = Arc::new(PipelineStats::default());
        let deadletter = Arc::new(DeadLetterSink::new(
            "logs",
            DeadLetterPolicy::File,
            &dir.path().join("deadletter"),
        ));
        let worker = ExportWorker::new(
            "logs",
            Arc::clone(&queue),
            Arc::clone(&exporter) as Arc<dyn Exporter>,
            retry(max_retries),
            Duration::from_secs(5),
            deadletter,
            Arc::clone(&stats),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        Harness {
            dir,
            queue,
            exporter,
            stats,
            shutdown_tx,
            handle,
        }
    }

    async fn drain(h: &Harness) {
        for _ in 0..500 {
            if h.queue.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue not drained: {} left", h.queue.len());
    }

    fn snapshot(h: &Harness) -> crate::domain::stats::PipelineStatsSnapshot {
        h.stats.snapshot("logs", h.queue.snapshot())
    }

    fn transient() -> Result<(), ExportError> {
        Err(ExportError::Transient("HTTP 503: unavailable".to_string()))
    }

    #[tokio::test]
    async fn test_exports_in_queue_order() {
        let h = start(vec![], 3, 3);
        drain(&h).await;
        let exported: Vec<_> = h.exporter.exported.lock().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(
            exported,
            vec![
                Bytes::from("batch-1"),
                Bytes::from("batch-2"),
                Bytes::from("batch-3")
            ]
        );
        assert_eq!(snapshot(&h).exported, 3);
        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_three_failures_then_recovery() {
        let h = start(vec![transient(), transient(), transient()], 5, 1);
        drain(&h).await;

        let stats = snapshot(&h);
        assert_eq!(stats.exported, 1);
        assert_eq!(stats.export_failures, 3);
        assert_eq!(stats.retries_total, 3);
        assert_eq!(stats.last_export_retry_count, 3);
        assert_eq!(stats.dead_lettered, 0);
        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_head_of_line_blocks_followers() {
        let h = start(vec![transient(), transient()], 5, 2);
        drain(&h).await;
        let order: Vec<_> = h.exporter.exported.lock().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(order, vec![Bytes::from("batch-1"), Bytes::from("batch-2")]);
        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_exhausted_dead_letters() {
        let h = start(vec![transient(), transient(), transient()], 2, 2);
        drain(&h).await;

        let stats = snapshot(&h);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.retries_total, 2);
        // The second entry still made it out
        assert_eq!(h.exporter.exported_count(), 1);

        let lines = std::fs::read_to_string(h.dir.path().join("deadletter").join("logs.jsonl")).unwrap();
        let record: serde_json::Value = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
        assert_eq!(record["batch_seq"], 1);
        assert_eq!(record["retry_count"], 3);
        assert!(record["reason"].as_str().unwrap().starts_with("retries exhausted"));
        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_immediately() {
        let h = start(
            vec![Err(ExportError::Permanent("HTTP 400: bad payload".to_string()))],
            5,
            1,
        );
        drain(&h).await;
        let stats = snapshot(&h);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.retries_total, 0);
        assert_eq!(h.exporter.exported_count(), 0);
        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap();
    }

    /// Exporter whose attempts never finish
    #[derive(Default)]
    struct StalledExporter {
        started: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl Exporter for StalledExporter {
        fn endpoint(&self) -> &str {
            "memory://stalled"
        }

        async fn export(&self, _kind: SignalKind, _payload: Bytes) -> Result<(), ExportError> {
            self.started.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_abandons_in_flight_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig {
            fsync: FsyncPolicy::Never,
            ..Default::default()
        };
        let queue = Arc::new(DurableQueue::open("logs", &dir.path().join("queue"), config.clone()).unwrap());
        queue
            .enqueue(1, SignalKind::Logs, Bytes::from_static(b"batch-1"), now_ms())
            .unwrap();

        let exporter = Arc::new(StalledExporter::default());
        let stats = Arc::new(PipelineStats::default());
        let worker = ExportWorker::new(
            "logs",
            Arc::clone(&queue),
            Arc::clone(&exporter) as Arc<dyn Exporter>,
            retry(3),
            Duration::from_secs(60),
            Arc::new(DeadLetterSink::new(
                "logs",
                DeadLetterPolicy::File,
                &dir.path().join("deadletter"),
            )),
            Arc::clone(&stats),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tokio::time::timeout(Duration::from_secs(1), exporter.started.notified())
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(queue.len(), 1);
        let entry = &queue.entries()[0];
        assert_eq!(entry.retry_count, 0);
        let snapshot = stats.snapshot("logs", queue.snapshot());
        assert_eq!(snapshot.export_failures, 0);
        assert_eq!(snapshot.dead_lettered, 0);
        drop(queue);

        // Still there for the next run
        let reopened = DurableQueue::open("logs", &dir.path().join("queue"), config).unwrap();
        assert_eq!(reopened.entries()[0].payload, Bytes::from_static(b"batch-1"));
        assert_eq!(reopened.entries()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_worker() {
        let h = start(vec![], 3, 0);
        h.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), h.handle)
            .await
            .unwrap()
            .unwrap();
    }
}
