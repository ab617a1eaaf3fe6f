//! Pipelines: processor chain, batcher, durable queue and export worker

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::batch::Batch;
use super::exporter::{ExportWorker, Exporter, build_exporter};
use super::health::HealthMonitor;
use super::processors::{Batcher, Flush, ProcessorChain};
use super::stats::{PipelineStats, PipelineStatsSnapshot};
use crate::core::config::PipelineConfig;
use crate::core::constants::BATCH_FLUSH_TICK_MS;
use crate::data::{DeadLetterSink, DurableQueue, QueueError};
use crate::utils::time::now_ms;

/// Why a batch could not be durably enqueued
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("batch of {size} bytes exceeds queue capacity of {max_bytes} bytes")]
    TooLarge { size: u64, max_bytes: u64 },
    #[error("queue storage failure: {0}")]
    Storage(String),
    #[error("pipeline is shutting down")]
    Closed,
}

impl From<QueueError> for EnqueueError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::EntryTooLarge { size, max_bytes } => Self::TooLarge { size, max_bytes },
            other => Self::Storage(other.to_string()),
        }
    }
}

/// What happened to a dispatched batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Durably enqueued (possibly merged with other batches)
    Queued,
    /// Fully consumed by the shedder
    Shed,
    /// Dropped after a processor error
    Dropped,
}

pub struct Pipeline {
    config: PipelineConfig,
    chain: ProcessorChain,
    batcher: Option<Batcher>,
    queue: Arc<DurableQueue>,
    exporter: Arc<dyn Exporter>,
    deadletter: Arc<DeadLetterSink>,
    stats: Arc<PipelineStats>,
    monitor: Arc<HealthMonitor>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<DurableQueue>,
        exporter: Arc<dyn Exporter>,
        deadletter: Arc<DeadLetterSink>,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let (chain, batch) = ProcessorChain::build(&config.processors, &monitor, &stats);
        let batcher = batch.map(|c| Batcher::new(c, config.queue.max_bytes));
        Self {
            config,
            chain,
            batcher,
            queue,
            exporter,
            deadletter,
            stats,
            monitor,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot(self.name(), self.queue.snapshot())
    }

    /// Run a batch through the chain and wait until it is durably enqueued
    pub async fn dispatch(&self, batch: Batch) -> Result<DispatchOutcome, EnqueueError> {
        self.stats.record_received(batch.record_count());
        let seq = batch.seq();

        let batch = match self.chain.run(batch) {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(DispatchOutcome::Shed),
            Err(e) => {
                self.stats.record_processor_error();
                self.monitor.record_processor_error();
                tracing::warn!(pipeline = %self.name(), seq, error = %e, "Processor error, batch dropped");
                return Ok(DispatchOutcome::Dropped);
            }
        };

        let Some(batcher) = &self.batcher else {
            self.enqueue(batch).await?;
            return Ok(DispatchOutcome::Queued);
        };

        let (tx, rx) = oneshot::channel();
        match batcher.push(batch, tx, Instant::now()) {
            Ok(ready) => {
                for flush in ready {
                    self.complete(flush).await;
                }
            }
            Err(batch) => {
                // Batcher already drained for shutdown
                self.enqueue(batch).await?;
                return Ok(DispatchOutcome::Queued);
            }
        }

        rx.await.map_err(|_| EnqueueError::Closed)??;
        Ok(DispatchOutcome::Queued)
    }

    /// Enqueue a flushed group and release its waiters
    async fn complete(&self, flush: Flush) {
        let Flush { batch, waiters } = flush;
        let result = self.enqueue(batch).await;
        for waiter in waiters {
            // Submitter may have gone away
            let _ = waiter.send(result.clone());
        }
    }

    async fn enqueue(&self, batch: Batch) -> Result<(), EnqueueError> {
        let seq = batch.seq();
        let kind = batch.kind();
        let records = batch.record_count();
        let payload = batch.encode();

        let outcome = self
            .queue
            .blocking(move |q| q.enqueue(seq, kind, payload, now_ms()))
            .await
            .inspect_err(|e| {
                tracing::error!(pipeline = %self.name(), seq, error = %e, "Failed to enqueue batch");
            })?;

        self.stats.record_enqueued();
        if !outcome.evicted.is_empty() {
            self.stats.record_evicted(outcome.evicted.len());
            for evicted in &outcome.evicted {
                tracing::error!(
                    pipeline = %self.name(),
                    id = evicted.id,
                    batch_seq = evicted.batch_seq,
                    bytes = evicted.size,
                    retry_count = evicted.retry_count,
                    "Queue overflow, oldest entry evicted (data loss)"
                );
            }
        }
        tracing::trace!(pipeline = %self.name(), seq, id = outcome.id, records, "Batch enqueued");
        Ok(())
    }

    /// Enqueue everything the batcher holds and stop batching
    pub async fn flush_all(&self) {
        let Some(batcher) = &self.batcher else {
            return;
        };
        let flushes = batcher.flush_all();
        if !flushes.is_empty() {
            tracing::debug!(pipeline = %self.name(), groups = flushes.len(), "Flushing pending batches");
        }
        for flush in flushes {
            self.complete(flush).await;
        }
    }

    /// Periodically flush expired groups; drains the batcher on shutdown
    pub fn start_flusher(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let batcher = self.batcher.as_ref()?;
        let tick = batcher
            .timeout()
            .min(Duration::from_millis(BATCH_FLUSH_TICK_MS))
            .max(Duration::from_millis(1));
        let pipeline = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        pipeline.flush_all().await;
                        tracing::debug!(pipeline = %pipeline.name(), "Batch flusher stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(batcher) = &pipeline.batcher else { break };
                        for flush in batcher.flush_expired(Instant::now()) {
                            pipeline.complete(flush).await;
                        }
                    }
                }
            }
        }))
    }

    /// Spawn the export worker for this pipeline's queue
    pub fn start_worker(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let worker = ExportWorker::new(
            self.name(),
            Arc::clone(&self.queue),
            Arc::clone(&self.exporter),
            self.config.retry.clone(),
            Duration::from_millis(self.config.exporter.timeout_ms),
            Arc::clone(&self.deadletter),
            Arc::clone(&self.stats),
        );
        tokio::spawn(worker.run(shutdown_rx))
    }
}

/// All configured pipelines, by name
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<Pipeline>>,
    order: Vec<String>,
}

impl PipelineRegistry {
    /// Open every pipeline's queue under `<queue_dir>/<name>` and build its
    /// exporter. Queues are registered with the monitor for occupancy checks.
    pub fn open(
        configs: &[PipelineConfig],
        queue_dir: &Path,
        deadletter_dir: &Path,
        monitor: &Arc<HealthMonitor>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut pipelines = HashMap::with_capacity(configs.len());
        let mut order = Vec::with_capacity(configs.len());
        for config in configs {
            let queue = DurableQueue::open(&config.name, &queue_dir.join(&config.name), config.queue.clone())
                .with_context(|| format!("Failed to open queue for pipeline '{}'", config.name))?;
            let queue = Arc::new(queue);
            monitor.register_queue(Arc::clone(&queue));

            let exporter = build_exporter(&config.exporter)
                .with_context(|| format!("Failed to build exporter for pipeline '{}'", config.name))?;
            let deadletter = Arc::new(DeadLetterSink::new(
                &config.name,
                config.dead_letter.policy,
                deadletter_dir,
            ));

            tracing::debug!(
                pipeline = %config.name,
                protocol = %config.exporter.protocol,
                endpoint = %config.exporter.endpoint,
                pending = queue.len(),
                "Pipeline ready"
            );
            let pipeline = Pipeline::new(config.clone(), queue, exporter, deadletter, Arc::clone(monitor));
            order.push(config.name.clone());
            pipelines.insert(config.name.clone(), Arc::new(pipeline));
        }
        Ok(Self { pipelines, order })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Pipeline>> {
        self.pipelines.get(name)
    }

    /// Pipelines in configured order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pipeline>> {
        self.order.iter().filter_map(|name| self.pipelines.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Highest batch sequence number recovered from any queue
    pub fn max_batch_seq(&self) -> u64 {
        self.iter()
            .map(|p| p.queue().recovered_max_batch_seq())
            .max()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<PipelineStatsSnapshot> {
        self.iter().map(|p| p.stats_snapshot()).collect()
    }

    /// Start the flush task and export worker of every pipeline
    pub fn start(&self, shutdown_rx: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.len() * 2);
        for pipeline in self.iter() {
            if let Some(handle) = pipeline.start_flusher(shutdown_rx.clone()) {
                handles.push(handle);
            }
            handles.push(pipeline.start_worker(shutdown_rx.clone()));
        }
        handles
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::core::config::{
        AttributeAction, AttributeActionKind, AttributesConfig, BatchConfig, ExporterConfig,
        ProcessorConfig, QueueConfig, ShedderConfig,
    };
    use crate::domain::SignalKind;
    use crate::domain::batch::test_support::*;
    use crate::domain::health::test_support::monitor;

    fn config(processors: Vec<ProcessorConfig>) -> PipelineConfig {
        PipelineConfig {
            name: "logs".to_string(),
            signals: vec![SignalKind::Logs, SignalKind::Metrics],
            processors,
            queue: QueueConfig::default(),
            exporter: ExporterConfig::http("http://127.0.0.1:14318"),
            retry: Default::default(),
            dead_letter: Default::default(),
        }
    }

    fn build(processors: Vec<ProcessorConfig>, used_percent: u64) -> (tempfile::TempDir, Arc<Pipeline>) {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _) = monitor(used_percent);
        let pipeline = pipeline_with(
            config(processors),
            dir.path(),
            Arc::new(RecordingExporter::default()),
            monitor,
        );
        (dir, pipeline)
    }

    #[tokio::test]
    async fn test_dispatch_without_batcher_enqueues() {
        let (_dir, pipeline) = build(vec![], 10);
        let outcome = pipeline.dispatch(logs_batch(1, &[], &[9])).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Queued);
        assert_eq!(pipeline.queue().len(), 1);

        let stats = pipeline.stats_snapshot();
        assert_eq!(stats.received_batches, 1);
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.queue_depth, 1);
    }

    #[tokio::test]
    async fn test_processor_error_drops_only_that_batch() {
        let require = ProcessorConfig::Attributes(AttributesConfig {
            actions: vec![AttributeAction {
                key: "service".to_string(),
                action: AttributeActionKind::Require,
                value: None,
            }],
        });
        let (_dir, pipeline) = build(vec![require], 10);

        let dropped = pipeline.dispatch(logs_batch(1, &[], &[9])).await.unwrap();
        assert_eq!(dropped, DispatchOutcome::Dropped);
        let queued = pipeline
            .dispatch(logs_batch(2, &[("service", "api")], &[9]))
            .await
            .unwrap();
        assert_eq!(queued, DispatchOutcome::Queued);

        assert_eq!(pipeline.queue().len(), 1);
        assert_eq!(pipeline.stats_snapshot().processor_errors, 1);
        assert_eq!(pipeline.monitor.processor_errors(), 1);
    }

    #[tokio::test]
    async fn test_shed_batch_not_enqueued() {
        let (_dir, pipeline) = build(
            vec![ProcessorConfig::MemoryShedder(ShedderConfig::default())],
            85,
        );
        let outcome = pipeline.dispatch(logs_batch(1, &[], &[1, 2])).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Shed);
        assert!(pipeline.queue().is_empty());
        assert_eq!(pipeline.stats_snapshot().shed_records, 2);
    }

    #[tokio::test]
    async fn test_batched_submitters_released_on_flush() {
        let batch = ProcessorConfig::Batch(BatchConfig {
            send_batch_size: 3,
            timeout_ms: 60_000,
        });
        let (_dir, pipeline) = build(vec![batch], 10);

        let first = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.dispatch(logs_batch(1, &[("service", "api")], &[9, 9])).await })
        };
        // Let the first submission reach the batcher
        while pipeline.batcher.as_ref().unwrap().pending() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(pipeline.queue().is_empty());

        let second = pipeline
            .dispatch(logs_batch(2, &[("service", "api")], &[9]))
            .await
            .unwrap();
        assert_eq!(second, DispatchOutcome::Queued);
        assert_eq!(first.await.unwrap().unwrap(), DispatchOutcome::Queued);

        let entries = pipeline.queue().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].batch_seq, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_batches() {
        let batch = ProcessorConfig::Batch(BatchConfig {
            send_batch_size: 100,
            timeout_ms: 60_000,
        });
        let (_dir, pipeline) = build(vec![batch], 10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = pipeline.start_flusher(shutdown_rx).unwrap();

        let pending = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.dispatch(logs_batch(1, &[], &[9])).await })
        };
        while pipeline.batcher.as_ref().unwrap().pending() == 0 {
            tokio::task::yield_now().await;
        }

        shutdown_tx.send(true).unwrap();
        flusher.await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), DispatchOutcome::Queued);
        assert_eq!(pipeline.queue().len(), 1);

        // After the drain, batches bypass the batcher
        let late = pipeline.dispatch(logs_batch(2, &[], &[9])).await.unwrap();
        assert_eq!(late, DispatchOutcome::Queued);
        assert_eq!(pipeline.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_too_large_reported() {
        let mut config = config(vec![]);
        config.queue.max_bytes = 8;
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _) = monitor(10);
        let pipeline = pipeline_with(config, dir.path(), Arc::new(RecordingExporter::default()), monitor);
        let err = pipeline
            .dispatch(logs_batch(1, &[("service", "api")], &[9, 9, 9]))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::TooLarge { max_bytes: 8, .. }));
    }

    #[tokio::test]
    async fn test_registry_opens_queues_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _) = monitor(10);
        let (configs, _) = crate::core::config::default_pipelines("http://127.0.0.1:14318");
        let registry = PipelineRegistry::open(
            &configs,
            &dir.path().join("queue"),
            &dir.path().join("deadletter"),
            &monitor,
        )
        .unwrap();
        let names: Vec<_> = registry.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["traces", "metrics", "logs"]);
        assert!(dir.path().join("queue").join("logs").exists());
        assert_eq!(registry.stats().len(), 3);
    }
}
