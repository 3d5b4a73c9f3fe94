//! Self-optimization rules.
//!
//! The advisor is a pure heuristic rule set: given the latest CPU sample and
//! the scheduler's current shape it proposes tuning actions, which the actor
//! applies (the actor stays the single writer of all tunables). Rules are
//! independent and any subset may fire on one sample. These are directional
//! heuristics validated through the metrics stream, not a formal controller.

use std::time::Duration;

use tracing::debug;

use crate::balance::BalanceKind;
use crate::config::SchedulerConfig;
use crate::monitor::CpuSampleSet;

/// Quantum bounds the advisor will not cross.
const QUANTUM_CAP: Duration = Duration::from_millis(50);
const QUANTUM_FLOOR: Duration = Duration::from_millis(5);

/// Minimum pool size rule 1 will shrink down to.
const MIN_POOL_FOR_SHRINK: usize = 2;

/// A tuning action proposed by the advisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuningAction {
    SetQuantum(Duration),
    /// Terminate one idle worker.
    RetireIdleWorker,
    /// Grow the pool by one worker.
    AddWorker,
    SetStrategy(BalanceKind),
    EnablePreemption,
}

/// Heuristic rule set evaluated against each CPU sample.
#[derive(Debug, Default)]
pub struct OptimizationAdvisor;

impl OptimizationAdvisor {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate all rules against one sample. `pool_size` is the current
    /// number of live workers; `idle_workers` of those are free.
    pub fn evaluate(
        &self,
        sample: &CpuSampleSet,
        config: &SchedulerConfig,
        pool_size: usize,
        idle_workers: usize,
    ) -> Vec<TuningAction> {
        let mut actions = Vec::new();

        // Rule 1: system CPU saturated — slow the dispatch loop, and shed an
        // idle worker when severely over.
        if sample.system_cpu_percent > 80.0 {
            let raised = scale_quantum(config.quantum, 1.2).min(QUANTUM_CAP);
            if raised != config.quantum {
                actions.push(TuningAction::SetQuantum(raised));
            }
            if sample.system_cpu_percent > 90.0
                && pool_size > MIN_POOL_FOR_SHRINK
                && idle_workers > 0
            {
                actions.push(TuningAction::RetireIdleWorker);
            }
        }

        // Rule 2: queue backing up with headroom on the machine — scale up,
        // keeping one logical core free for the coordinator.
        if sample.queue_utilization_percent > 80.0
            && pool_size < sample.logical_cores.saturating_sub(1)
        {
            actions.push(TuningAction::AddWorker);
        }

        // Rule 3: CPU idle while the queue backs up — the schedule itself is
        // the bottleneck. Tighten the loop, balance by load, allow demotion.
        if sample.system_cpu_percent < 50.0 && sample.queue_utilization_percent > 60.0 {
            if config.load_balancing == BalanceKind::RoundRobin {
                actions.push(TuningAction::SetStrategy(BalanceKind::LeastLoaded));
            }
            let lowered = scale_quantum(config.quantum, 0.8).max(QUANTUM_FLOOR);
            if lowered != config.quantum {
                actions.push(TuningAction::SetQuantum(lowered));
            }
            if !config.preemption_enabled {
                actions.push(TuningAction::EnablePreemption);
            }
        }

        if !actions.is_empty() {
            debug!(
                system_cpu = sample.system_cpu_percent,
                queue_utilization = sample.queue_utilization_percent,
                ?actions,
                "advisor proposed tuning actions"
            );
        }
        actions
    }
}

/// Scale a quantum by a factor in whole milliseconds, never below 1ms.
fn scale_quantum(quantum: Duration, factor: f64) -> Duration {
    let ms = (quantum.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(ms.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(system_cpu: f32, queue_utilization: f32) -> CpuSampleSet {
        CpuSampleSet {
            timestamp: Utc::now(),
            system_cpu_percent: system_cpu,
            process_cpu_percent: 0.0,
            worker_busy: 0,
            worker_idle: 0,
            queue_size: 0,
            queue_utilization_percent: queue_utilization,
            logical_cores: 8,
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            quantum: Duration::from_millis(10),
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn quiet_system_fires_nothing() {
        let advisor = OptimizationAdvisor::new();
        let actions = advisor.evaluate(&sample(30.0, 10.0), &config(), 4, 4);
        assert!(actions.is_empty());
    }

    #[test]
    fn high_cpu_raises_quantum() {
        let advisor = OptimizationAdvisor::new();
        let actions = advisor.evaluate(&sample(85.0, 10.0), &config(), 4, 2);
        assert_eq!(
            actions,
            vec![TuningAction::SetQuantum(Duration::from_millis(12))]
        );
    }

    #[test]
    fn quantum_raise_capped_at_50ms() {
        let advisor = OptimizationAdvisor::new();
        let mut cfg = config();
        cfg.quantum = Duration::from_millis(49);
        let actions = advisor.evaluate(&sample(85.0, 10.0), &cfg, 4, 2);
        assert_eq!(actions, vec![TuningAction::SetQuantum(QUANTUM_CAP)]);

        // Already at the cap: nothing to do.
        cfg.quantum = QUANTUM_CAP;
        assert!(advisor.evaluate(&sample(85.0, 10.0), &cfg, 4, 2).is_empty());
    }

    #[test]
    fn severe_cpu_retires_idle_worker() {
        let advisor = OptimizationAdvisor::new();
        let actions = advisor.evaluate(&sample(95.0, 10.0), &config(), 4, 1);
        assert!(actions.contains(&TuningAction::RetireIdleWorker));
    }

    #[test]
    fn severe_cpu_keeps_minimum_pool() {
        let advisor = OptimizationAdvisor::new();
        let actions = advisor.evaluate(&sample(95.0, 10.0), &config(), 2, 2);
        assert!(!actions.contains(&TuningAction::RetireIdleWorker));
    }

    #[test]
    fn severe_cpu_with_no_idle_worker_skips_retire() {
        let advisor = OptimizationAdvisor::new();
        let actions = advisor.evaluate(&sample(95.0, 10.0), &config(), 4, 0);
        assert!(!actions.contains(&TuningAction::RetireIdleWorker));
    }

    #[test]
    fn backed_up_queue_scales_up_below_core_cap() {
        let advisor = OptimizationAdvisor::new();
        // 8 logical cores: cap is 7 workers.
        let actions = advisor.evaluate(&sample(60.0, 90.0), &config(), 4, 0);
        assert_eq!(actions, vec![TuningAction::AddWorker]);

        let capped = advisor.evaluate(&sample(60.0, 90.0), &config(), 7, 0);
        assert!(capped.is_empty());
    }

    #[test]
    fn scheduling_inefficiency_fires_full_rule() {
        let advisor = OptimizationAdvisor::new();
        let actions = advisor.evaluate(&sample(30.0, 70.0), &config(), 4, 2);
        assert_eq!(
            actions,
            vec![
                TuningAction::SetStrategy(BalanceKind::LeastLoaded),
                TuningAction::SetQuantum(Duration::from_millis(8)),
                TuningAction::EnablePreemption,
            ]
        );
    }

    #[test]
    fn inefficiency_rule_is_idempotent_once_applied() {
        let advisor = OptimizationAdvisor::new();
        let mut cfg = config();
        cfg.load_balancing = BalanceKind::LeastLoaded;
        cfg.preemption_enabled = true;
        cfg.quantum = QUANTUM_FLOOR;
        let actions = advisor.evaluate(&sample(30.0, 70.0), &cfg, 4, 2);
        assert!(actions.is_empty());
    }

    #[test]
    fn rules_can_fire_together() {
        // CPU over 80 *and* queue over 80 with pool headroom: rules 1 and 2
        // both fire on the same sample.
        let advisor = OptimizationAdvisor::new();
        let actions = advisor.evaluate(&sample(85.0, 90.0), &config(), 4, 0);
        assert!(matches!(actions[0], TuningAction::SetQuantum(_)));
        assert!(actions.contains(&TuningAction::AddWorker));
    }
}
