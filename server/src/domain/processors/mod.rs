//! Per-pipeline processor stages
//!
//! Stages run in configured order on one batch at a time. The batch stage is
//! special: it holds batches across submissions, so it is not part of the
//! synchronous [`ProcessorChain`] and is driven by the pipeline instead.

mod attributes;
mod batcher;
mod shedder;

use std::sync::Arc;

pub use attributes::AttributesProcessor;
pub use batcher::{Batcher, Flush, Waiter};
pub use shedder::MemoryShedder;

use super::batch::Batch;
use super::health::HealthMonitor;
use super::stats::PipelineStats;
use crate::core::config::{BatchConfig, ProcessorConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("required resource attribute '{key}' is missing")]
    MissingAttribute { key: String },
}

/// A synchronous batch transformation
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the batch to pass on, or None when it was fully consumed
    fn process(&self, batch: Batch) -> Result<Option<Batch>, ProcessorError>;
}

/// The non-batching stages of a pipeline, in order
pub struct ProcessorChain {
    stages: Vec<Box<dyn Processor>>,
}

impl ProcessorChain {
    /// Build the stages from config. The batch stage, which validation keeps
    /// last, is returned separately.
    pub fn build(
        configs: &[ProcessorConfig],
        monitor: &Arc<HealthMonitor>,
        stats: &Arc<PipelineStats>,
    ) -> (Self, Option<BatchConfig>) {
        let mut stages: Vec<Box<dyn Processor>> = Vec::with_capacity(configs.len());
        let mut batch = None;
        for config in configs {
            match config {
                ProcessorConfig::Attributes(c) => {
                    stages.push(Box::new(AttributesProcessor::new(c.clone())))
                }
                ProcessorConfig::MemoryShedder(c) => stages.push(Box::new(MemoryShedder::new(
                    c.clone(),
                    Arc::clone(monitor),
                    Arc::clone(stats),
                ))),
                ProcessorConfig::Batch(c) => batch = Some(c.clone()),
            }
        }
        (Self { stages }, batch)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn run(&self, batch: Batch) -> Result<Option<Batch>, ProcessorError> {
        let mut current = batch;
        for stage in &self.stages {
            match stage.process(current)? {
                Some(next) => current = next,
                None => {
                    tracing::trace!(stage = stage.name(), "Batch consumed by processor");
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        AttributeAction, AttributeActionKind, AttributesConfig, ShedderConfig,
    };
    use crate::domain::batch::test_support::*;
    use crate::domain::health::test_support::monitor;

    fn chain(configs: &[ProcessorConfig], used_percent: u64) -> (ProcessorChain, Arc<PipelineStats>) {
        let (monitor, _) = monitor(used_percent);
        let stats = Arc::new(PipelineStats::default());
        let (chain, _) = ProcessorChain::build(configs, &monitor, &stats);
        (chain, stats)
    }

    fn require(key: &str) -> ProcessorConfig {
        ProcessorConfig::Attributes(AttributesConfig {
            actions: vec![AttributeAction {
                key: key.to_string(),
                action: AttributeActionKind::Require,
                value: None,
            }],
        })
    }

    #[test]
    fn test_batch_stage_split_off() {
        let (monitor, _) = monitor(10);
        let stats = Arc::new(PipelineStats::default());
        let configs = vec![
            ProcessorConfig::MemoryShedder(ShedderConfig::default()),
            ProcessorConfig::Batch(BatchConfig::default()),
        ];
        let (chain, batch) = ProcessorChain::build(&configs, &monitor, &stats);
        assert_eq!(chain.len(), 1);
        assert_eq!(batch, Some(BatchConfig::default()));
    }

    #[test]
    fn test_empty_chain_passes_through() {
        let (chain, _) = chain(&[], 10);
        assert!(chain.is_empty());
        let batch = logs_batch(1, &[], &[9]);
        assert_eq!(chain.run(batch.clone()), Ok(Some(batch)));
    }

    #[test]
    fn test_error_stops_chain() {
        let (chain, _) = chain(&[require("service"), require("env")], 10);
        let err = chain
            .run(metrics_batch(1, &[("service", "api")], 1))
            .unwrap_err();
        assert_eq!(
            err,
            ProcessorError::MissingAttribute {
                key: "env".to_string()
            }
        );
    }

    #[test]
    fn test_shed_stops_chain() {
        let configs = vec![
            ProcessorConfig::MemoryShedder(ShedderConfig::default()),
            require("never-present"),
        ];
        // Soft limit: logs are shed before the require stage can fail
        let (chain, stats) = chain(&configs, 85);
        assert_eq!(chain.run(logs_batch(1, &[], &[5, 9])), Ok(None));
        assert_eq!(stats.snapshot("p", empty_queue()).shed_records, 2);
    }

    fn empty_queue() -> crate::data::QueueSnapshot {
        crate::data::QueueSnapshot {
            depth: 0,
            bytes: 0,
            max_entries: 1,
            max_bytes: 1,
            oldest_enqueued_at_ms: None,
        }
    }
}
