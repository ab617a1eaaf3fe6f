//! Load shedding under memory pressure

use std::sync::Arc;

use opentelemetry_proto::tonic::trace::v1::status::StatusCode;

use super::{Processor, ProcessorError};
use crate::core::config::ShedderConfig;
use crate::domain::batch::{Batch, Records, SignalKind};
use crate::domain::health::HealthMonitor;
use crate::domain::stats::PipelineStats;

/// Drops low-value telemetry while the monitor reports Soft-Limit or worse.
///
/// Only the first `shed_kinds` entries of `priority` are affected:
/// - logs below `min_log_severity` are dropped
/// - metric batches are dropped whole
/// - spans without an error status are dropped
pub struct MemoryShedder {
    config: ShedderConfig,
    monitor: Arc<HealthMonitor>,
    stats: Arc<PipelineStats>,
}

impl MemoryShedder {
    pub fn new(config: ShedderConfig, monitor: Arc<HealthMonitor>, stats: Arc<PipelineStats>) -> Self {
        Self {
            config,
            monitor,
            stats,
        }
    }

    fn sheds(&self, kind: SignalKind) -> bool {
        self.config
            .priority
            .iter()
            .take(self.config.shed_kinds)
            .any(|k| *k == kind)
    }
}

impl Processor for MemoryShedder {
    fn name(&self) -> &'static str {
        "memory_shedder"
    }

    fn process(&self, mut batch: Batch) -> Result<Option<Batch>, ProcessorError> {
        let state = self.monitor.state();
        if !state.under_pressure() || !self.sheds(batch.kind()) {
            return Ok(Some(batch));
        }

        let before = batch.record_count();
        match batch.records_mut() {
            Records::Metrics(scopes) => scopes.clear(),
            Records::Logs(scopes) => {
                for scope in scopes.iter_mut() {
                    scope
                        .log_records
                        .retain(|r| r.severity_number >= self.config.min_log_severity);
                }
                scopes.retain(|s| !s.log_records.is_empty());
            }
            Records::Spans(scopes) => {
                for scope in scopes.iter_mut() {
                    scope.spans.retain(|span| {
                        span.status
                            .as_ref()
                            .is_some_and(|s| s.code == StatusCode::Error as i32)
                    });
                }
                scopes.retain(|s| !s.spans.is_empty());
            }
        }

        let shed = before - batch.record_count();
        if shed > 0 {
            self.stats.record_shed(shed);
            tracing::debug!(
                seq = batch.seq(),
                kind = %batch.kind(),
                state = state.as_str(),
                shed,
                "Shed records under memory pressure"
            );
        }
        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::test_support::*;
    use crate::domain::health::HealthState;
    use crate::domain::health::test_support::monitor;

    fn shedder(used_percent: u64, config: ShedderConfig) -> (MemoryShedder, Arc<PipelineStats>) {
        let (monitor, _) = monitor(used_percent);
        let stats = Arc::new(PipelineStats::default());
        (MemoryShedder::new(config, monitor, Arc::clone(&stats)), stats)
    }

    fn shed_count(stats: &PipelineStats) -> u64 {
        stats
            .snapshot(
                "p",
                crate::data::QueueSnapshot {
                    depth: 0,
                    bytes: 0,
                    max_entries: 1,
                    max_bytes: 1,
                    oldest_enqueued_at_ms: None,
                },
            )
            .shed_records
    }

    fn all_kinds() -> ShedderConfig {
        ShedderConfig {
            shed_kinds: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_normal_state_passes_everything() {
        let (shedder, stats) = shedder(10, all_kinds());
        assert_eq!(shedder.monitor.state(), HealthState::Normal);
        let batch = logs_batch(1, &[], &[1, 5, 9]);
        assert_eq!(shedder.process(batch.clone()), Ok(Some(batch)));
        assert_eq!(shed_count(&stats), 0);
    }

    #[test]
    fn test_logs_below_severity_dropped() {
        let (shedder, stats) = shedder(85, ShedderConfig::default());
        let out = shedder
            .process(logs_batch(1, &[], &[5, 13, 17, 9]))
            .unwrap()
            .unwrap();
        assert_eq!(out.record_count(), 2);
        assert_eq!(shed_count(&stats), 2);
    }

    #[test]
    fn test_all_low_severity_logs_consumed() {
        let (shedder, stats) = shedder(85, ShedderConfig::default());
        assert_eq!(shedder.process(logs_batch(1, &[], &[1, 9])), Ok(None));
        assert_eq!(shed_count(&stats), 2);
    }

    #[test]
    fn test_metrics_dropped_whole() {
        let (shedder, stats) = shedder(85, all_kinds());
        assert_eq!(shedder.process(metrics_batch(1, &[], 4)), Ok(None));
        assert_eq!(shed_count(&stats), 4);
    }

    #[test]
    fn test_traces_keep_error_spans() {
        let (shedder, _) = shedder(95, all_kinds());
        let out = shedder
            .process(traces_batch(1, &[], &[false, true, false]))
            .unwrap()
            .unwrap();
        assert_eq!(out.record_count(), 1);
    }

    #[test]
    fn test_only_prioritized_kinds_shed() {
        // Default sheds logs only
        let (shedder, stats) = shedder(85, ShedderConfig::default());
        let metrics = metrics_batch(1, &[], 3);
        assert_eq!(shedder.process(metrics.clone()), Ok(Some(metrics)));
        let traces = traces_batch(2, &[], &[false]);
        assert_eq!(shedder.process(traces.clone()), Ok(Some(traces)));
        assert_eq!(shed_count(&stats), 0);
    }
}
