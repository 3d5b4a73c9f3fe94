//! CPU sampling loop.
//!
//! On a fixed interval the monitor takes two CPU-usage snapshots separated by
//! a short delay (sysinfo needs elapsed time between refreshes to compute an
//! instantaneous percentage), combines them with queue/worker utilization
//! queried from the scheduler actor, and feeds the sample back into the actor
//! where the ring buffer and the optimization advisor live.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::scheduler::WeakSchedulerHandle;

/// One timestamped CPU/utilization sample.
#[derive(Debug, Clone, Serialize)]
pub struct CpuSampleSet {
    pub timestamp: DateTime<Utc>,
    /// System-wide CPU usage across all logical cores, 0–100.
    pub system_cpu_percent: f32,
    /// This process's CPU usage normalized to all cores, 0–100.
    pub process_cpu_percent: f32,
    /// Workers with a task in flight.
    pub worker_busy: usize,
    /// Workers waiting for work.
    pub worker_idle: usize,
    /// Queued (undispatched) tasks.
    pub queue_size: usize,
    /// Queue fill percentage, 0–100.
    pub queue_utilization_percent: f32,
    /// Logical core count, read each sample.
    pub logical_cores: usize,
}

/// Fixed-size drop-oldest buffer for retained samples.
#[derive(Debug)]
pub struct SampleRing {
    buf: std::collections::VecDeque<CpuSampleSet>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a sample, evicting the oldest if at capacity.
    pub fn push(&mut self, sample: CpuSampleSet) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn latest(&self) -> Option<&CpuSampleSet> {
        self.buf.back()
    }

    /// Oldest-to-newest copy of the retained samples.
    pub fn snapshot(&self) -> Vec<CpuSampleSet> {
        self.buf.iter().cloned().collect()
    }
}

/// Spawn the sampling loop. Holds only a weak handle, so it neither keeps
/// the scheduler alive nor outlives it.
pub(crate) fn spawn_monitor(handle: WeakSchedulerHandle, config: MonitorConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = config.sample_interval.as_millis() as u64,
            "CPU monitor started"
        );

        let mut system = System::new();
        let pid = sysinfo::get_current_pid().ok();
        let probe_delay = config.probe_delay.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        let mut tick = tokio::time::interval(config.sample_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            // First snapshot primes the counters; the second, after a short
            // delay, yields the instantaneous percentages.
            system.refresh_cpu_usage();
            if let Some(pid) = pid {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            }
            tokio::time::sleep(probe_delay).await;
            system.refresh_cpu_usage();
            if let Some(pid) = pid {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            }

            let logical_cores = system.cpus().len().max(1);
            let system_cpu_percent = system.global_cpu_usage();
            let process_cpu_percent = pid
                .and_then(|pid| system.process(pid))
                .map(|process| process.cpu_usage() / logical_cores as f32)
                .unwrap_or(0.0);

            let stats = match handle.pool_stats().await {
                Ok(stats) => stats,
                Err(_) => {
                    debug!("scheduler gone, stopping CPU monitor");
                    break;
                }
            };

            let sample = CpuSampleSet {
                timestamp: Utc::now(),
                system_cpu_percent,
                process_cpu_percent,
                worker_busy: stats.busy_workers,
                worker_idle: stats.idle_workers,
                queue_size: stats.queue_size,
                queue_utilization_percent: stats.queue_utilization_percent,
                logical_cores,
            };

            if handle.ingest_sample(sample).await.is_err() {
                warn!("failed to deliver CPU sample, stopping monitor");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> CpuSampleSet {
        CpuSampleSet {
            timestamp: Utc::now(),
            system_cpu_percent: n as f32,
            process_cpu_percent: 0.0,
            worker_busy: 0,
            worker_idle: 0,
            queue_size: n,
            queue_utilization_percent: 0.0,
            logical_cores: 4,
        }
    }

    #[test]
    fn ring_drops_oldest_beyond_capacity() {
        let mut ring = SampleRing::new(3);
        for n in 0..5 {
            ring.push(sample(n));
        }
        assert_eq!(ring.len(), 3);
        let retained: Vec<usize> = ring.snapshot().iter().map(|s| s.queue_size).collect();
        assert_eq!(retained, vec![2, 3, 4]);
        assert_eq!(ring.latest().unwrap().queue_size, 4);
    }

    #[test]
    fn ring_empty_state() {
        let ring = SampleRing::new(4);
        assert!(ring.is_empty());
        assert!(ring.latest().is_none());
        assert!(ring.snapshot().is_empty());
    }
}
