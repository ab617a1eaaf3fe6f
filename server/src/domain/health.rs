//! Health and admission monitor
//!
//! Tracks process memory against a limit and the aggregate occupancy of all
//! export queues, and moves between three states:
//!
//! ```text
//!   Normal ──mem > soft──▶ SoftLimit ──mem > hard / queue ≥ queue_hard──▶ HardLimit
//!     ▲                       │  ▲                                           │
//!     └──mem < soft - hyst────┘  └──mem < hard - hyst, queue < qh - hyst─────┘
//! ```
//!
//! Ingress is refused in HardLimit. The memory shedder reads SoftLimit and
//! HardLimit as a signal to drop low-priority telemetry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use crate::core::config::HealthConfig;
use crate::data::DurableQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HealthState {
    Normal = 0,
    SoftLimit = 1,
    HardLimit = 2,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthState::Normal,
            1 => HealthState::SoftLimit,
            _ => HealthState::HardLimit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Normal => "normal",
            HealthState::SoftLimit => "soft_limit",
            HealthState::HardLimit => "hard_limit",
        }
    }

    /// Whether low-priority telemetry should be shed
    pub fn under_pressure(self) -> bool {
        self != HealthState::Normal
    }
}

/// Transition thresholds, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub memory_soft: f64,
    pub memory_hard: f64,
    pub hysteresis: f64,
    pub queue_hard: f64,
}

impl From<&HealthConfig> for Thresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            memory_soft: config.memory_soft_percent,
            memory_hard: config.memory_hard_percent,
            hysteresis: config.hysteresis_percent,
            queue_hard: config.queue_hard_percent,
        }
    }
}

/// Inputs of one evaluation, in percent
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthSample {
    pub memory_percent: f64,
    pub queue_percent: f64,
}

/// Compute the next state from the current one and a fresh sample
pub fn next_state(current: HealthState, sample: HealthSample, t: &Thresholds) -> HealthState {
    let mem = sample.memory_percent;
    let queue = sample.queue_percent;

    if current == HealthState::HardLimit {
        let recovered = mem < t.memory_hard - t.hysteresis && queue < t.queue_hard - t.hysteresis;
        return match (recovered, mem < t.memory_soft - t.hysteresis) {
            (false, _) => HealthState::HardLimit,
            (true, true) => HealthState::Normal,
            (true, false) => HealthState::SoftLimit,
        };
    }

    if mem > t.memory_hard || queue >= t.queue_hard {
        return HealthState::HardLimit;
    }

    match current {
        HealthState::Normal if mem > t.memory_soft => HealthState::SoftLimit,
        HealthState::SoftLimit if mem < t.memory_soft - t.hysteresis => HealthState::Normal,
        other => other,
    }
}

// ============================================================================
// MEMORY PROBES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Resident memory of this process
    pub used_bytes: u64,
    /// Total memory of the machine
    pub total_bytes: u64,
}

/// Source of memory readings
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Option<MemoryUsage>;
}

/// Reads process and system memory through sysinfo
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot determine own pid, memory limit disabled");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> Option<MemoryUsage> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_memory();
        if !system.refresh_process(pid) {
            return None;
        }
        let used_bytes = system.process(pid)?.memory();
        Some(MemoryUsage {
            used_bytes,
            total_bytes: system.total_memory(),
        })
    }
}

// ============================================================================
// MONITOR
// ============================================================================

/// Point-in-time view for the stats endpoint
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub ready: bool,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub queue_percent: f64,
    pub processor_errors: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct LastReading {
    sample: HealthSample,
    used_bytes: u64,
    limit_bytes: u64,
}

pub struct HealthMonitor {
    state: AtomicU8,
    ready: AtomicBool,
    processor_errors: AtomicU64,
    thresholds: Thresholds,
    memory_limit_bytes: u64,
    probe: Box<dyn MemoryProbe>,
    queues: RwLock<Vec<Arc<DurableQueue>>>,
    last: Mutex<LastReading>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            state: AtomicU8::new(HealthState::Normal as u8),
            ready: AtomicBool::new(false),
            processor_errors: AtomicU64::new(0),
            thresholds: Thresholds::from(config),
            memory_limit_bytes: config.memory_limit_mb * 1024 * 1024,
            probe,
            queues: RwLock::new(Vec::new()),
            last: Mutex::new(LastReading::default()),
        }
    }

    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether new submissions may be accepted
    pub fn admit(&self) -> bool {
        self.state() != HealthState::HardLimit
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.admit()
    }

    pub fn record_processor_error(&self) {
        self.processor_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processor_errors(&self) -> u64 {
        self.processor_errors.load(Ordering::Relaxed)
    }

    /// Include a queue in the occupancy calculation
    pub fn register_queue(&self, queue: Arc<DurableQueue>) {
        self.queues.write().push(queue);
    }

    /// Aggregate queue occupancy in percent
    fn queue_percent(&self) -> f64 {
        let queues = self.queues.read();
        let (mut depth, mut max_entries, mut bytes, mut max_bytes) = (0usize, 0usize, 0u64, 0u64);
        for queue in queues.iter() {
            let snapshot = queue.snapshot();
            depth += snapshot.depth;
            max_entries += snapshot.max_entries;
            bytes += snapshot.bytes;
            max_bytes += snapshot.max_bytes;
        }
        if max_entries == 0 || max_bytes == 0 {
            return 0.0;
        }
        let by_entries = depth as f64 / max_entries as f64;
        let by_bytes = bytes as f64 / max_bytes as f64;
        by_entries.max(by_bytes) * 100.0
    }

    fn read(&self) -> LastReading {
        let (memory_percent, used_bytes, limit_bytes) = match self.probe.sample() {
            Some(usage) => {
                let limit = if self.memory_limit_bytes > 0 {
                    self.memory_limit_bytes
                } else {
                    usage.total_bytes
                };
                let percent = if limit > 0 {
                    usage.used_bytes as f64 / limit as f64 * 100.0
                } else {
                    0.0
                };
                (percent, usage.used_bytes, limit)
            }
            None => (0.0, 0, self.memory_limit_bytes),
        };
        LastReading {
            sample: HealthSample {
                memory_percent,
                queue_percent: self.queue_percent(),
            },
            used_bytes,
            limit_bytes,
        }
    }

    /// Take a sample and apply the resulting transition
    pub fn evaluate(&self) -> HealthState {
        let reading = self.read();
        *self.last.lock() = reading;

        let current = self.state();
        let next = next_state(current, reading.sample, &self.thresholds);
        if next != current {
            self.state.store(next as u8, Ordering::Release);
            let memory_percent = format!("{:.1}", reading.sample.memory_percent);
            let queue_percent = format!("{:.1}", reading.sample.queue_percent);
            match next {
                HealthState::HardLimit => tracing::warn!(
                    from = current.as_str(),
                    memory_percent = %memory_percent,
                    queue_percent = %queue_percent,
                    "Entering hard limit, refusing new submissions"
                ),
                HealthState::SoftLimit => tracing::warn!(
                    from = current.as_str(),
                    memory_percent = %memory_percent,
                    queue_percent = %queue_percent,
                    "Entering soft limit, shedding low-priority telemetry"
                ),
                HealthState::Normal => tracing::info!(
                    from = current.as_str(),
                    memory_percent = %memory_percent,
                    queue_percent = %queue_percent,
                    "Health back to normal"
                ),
            }
        }
        next
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last = *self.last.lock();
        HealthSnapshot {
            state: self.state(),
            ready: self.ready(),
            memory_percent: last.sample.memory_percent,
            memory_used_bytes: last.used_bytes,
            memory_limit_bytes: last.limit_bytes,
            queue_percent: last.sample.queue_percent,
            processor_errors: self.processor_errors(),
        }
    }

    /// Evaluate periodically until shutdown
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("Health monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.evaluate();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Probe with a settable reading
    pub struct FixedProbe {
        pub used_bytes: AtomicU64,
        pub total_bytes: u64,
    }

    impl FixedProbe {
        pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
            Self {
                used_bytes: AtomicU64::new(used_bytes),
                total_bytes,
            }
        }
    }

    impl MemoryProbe for Arc<FixedProbe> {
        fn sample(&self) -> Option<MemoryUsage> {
            Some(MemoryUsage {
                used_bytes: self.used_bytes.load(Ordering::Relaxed),
                total_bytes: self.total_bytes,
            })
        }
    }

    /// Monitor over a probe the test can move, thresholds at defaults
    pub fn monitor(used_percent: u64) -> (Arc<HealthMonitor>, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe::new(used_percent, 100));
        let monitor = HealthMonitor::new(&HealthConfig::default(), Box::new(Arc::clone(&probe)));
        monitor.evaluate();
        (Arc::new(monitor), probe)
    }
}
