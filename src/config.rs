//! Configuration types.

use std::time::Duration;

use crate::balance::BalanceKind;

/// Scheduler configuration.
///
/// The runtime tunables (`quantum`, `preemption_enabled`, `load_balancing`,
/// `worker_count`) are mutated only by the optimization advisor or an explicit
/// operator call into the scheduler actor, and are read every tick.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period between dispatch-loop ticks.
    pub quantum: Duration,
    /// Maximum number of queued (undispatched) tasks.
    pub max_queue_size: usize,
    /// Target worker-pool size.
    pub worker_count: usize,
    /// Whether logical preemption (priority demotion) is active.
    pub preemption_enabled: bool,
    /// Active load-balancing strategy.
    pub load_balancing: BalanceKind,
    /// How often an idle worker sends a heartbeat.
    pub heartbeat_interval: Duration,
    /// Liveness enforcement: an *idle* worker whose heartbeat is older than
    /// this is recycled through the crash path. `None` disables enforcement
    /// (heartbeats are still tracked).
    pub heartbeat_timeout: Option<Duration>,
    /// Delay before a crashed worker's slot is respawned.
    pub worker_respawn_delay: Duration,
    /// Bounded wait for in-flight work during graceful shutdown.
    pub shutdown_grace: Duration,
    /// CPU monitor settings.
    pub monitor: MonitorConfig,
}

/// CPU monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Whether the sampling loop runs at all.
    pub enabled: bool,
    /// Interval between samples.
    pub sample_interval: Duration,
    /// Delay between the two CPU snapshots of one sample.
    pub probe_delay: Duration,
    /// Ring-buffer capacity for retained samples.
    pub history_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum: Duration::from_millis(10),
            max_queue_size: 100,
            worker_count: default_worker_count(),
            preemption_enabled: false,
            load_balancing: BalanceKind::RoundRobin,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: None,
            worker_respawn_delay: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval: Duration::from_secs(1),
            probe_delay: Duration::from_millis(200),
            history_size: 60,
        }
    }
}

/// Default pool size: logical cores minus one, leaving a core for the
/// coordinating context. Never below one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}
