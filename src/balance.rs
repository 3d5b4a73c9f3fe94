//! Pluggable load-balancing strategies.
//!
//! A strategy is a pure selection policy over the current idle-worker set,
//! fed by the per-worker load records the scheduler maintains. Switching the
//! active strategy takes effect on the next tick only — already-dispatched
//! tasks are unaffected.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::worker::WorkerId;

/// Per-worker load bookkeeping, updated only on dispatch and completion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerLoadRecord {
    /// Tasks currently in flight on this worker.
    pub load: usize,
    /// Total tasks completed by this worker.
    pub tasks_processed: u64,
    /// Last time this worker was dispatched to or completed a task.
    pub last_used: Option<DateTime<Utc>>,
}

/// Identifies a load-balancing strategy on the tuning surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceKind {
    RoundRobin,
    LeastLoaded,
    Weighted,
}

impl std::fmt::Display for BalanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
            Self::Weighted => "weighted",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BalanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_loaded" => Ok(Self::LeastLoaded),
            "weighted" => Ok(Self::Weighted),
            other => Err(format!("unknown load-balancing strategy: {other}")),
        }
    }
}

/// Selection policy over the idle-worker set.
///
/// `idle` is in ascending slot order; `loads` holds records for every live
/// worker. Returns `None` only when `idle` is empty.
pub trait BalanceStrategy: Send {
    fn select(
        &mut self,
        idle: &[WorkerId],
        loads: &BTreeMap<WorkerId, WorkerLoadRecord>,
    ) -> Option<WorkerId>;

    fn kind(&self) -> BalanceKind;
}

/// Build the strategy for a kind, with a freshly seeded RNG for Weighted.
pub fn make_strategy(kind: BalanceKind) -> Box<dyn BalanceStrategy> {
    match kind {
        BalanceKind::RoundRobin => Box::new(RoundRobin::new()),
        BalanceKind::LeastLoaded => Box::new(LeastLoaded),
        BalanceKind::Weighted => Box::new(Weighted::new(Box::new(StdRng::from_entropy()))),
    }
}

/// Rotating cursor over the idle set. Deterministic and history-agnostic.
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl BalanceStrategy for RoundRobin {
    fn select(
        &mut self,
        idle: &[WorkerId],
        _loads: &BTreeMap<WorkerId, WorkerLoadRecord>,
    ) -> Option<WorkerId> {
        if idle.is_empty() {
            return None;
        }
        let picked = idle[self.cursor % idle.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(picked)
    }

    fn kind(&self) -> BalanceKind {
        BalanceKind::RoundRobin
    }
}

/// Minimum in-flight load; ties broken by lowest `tasks_processed`, then
/// slot order.
pub struct LeastLoaded;

impl BalanceStrategy for LeastLoaded {
    fn select(
        &mut self,
        idle: &[WorkerId],
        loads: &BTreeMap<WorkerId, WorkerLoadRecord>,
    ) -> Option<WorkerId> {
        idle.iter().copied().min_by_key(|id| {
            let record = loads.get(id).cloned().unwrap_or_default();
            (record.load, record.tasks_processed, *id)
        })
    }

    fn kind(&self) -> BalanceKind {
        BalanceKind::LeastLoaded
    }
}

/// Weighted-random draw over cumulative weights.
///
/// Weight favors workers with a processing track record and low current load:
/// `max(1, 0.7·tasks_processed + 0.3·(100 − load))`. The RNG is injectable so
/// tests can assert distribution shape deterministically.
pub struct Weighted {
    rng: Box<dyn RngCore + Send>,
}

impl Weighted {
    pub fn new(rng: Box<dyn RngCore + Send>) -> Self {
        Self { rng }
    }

    fn weight(record: &WorkerLoadRecord) -> f64 {
        let raw = 0.7 * record.tasks_processed as f64 + 0.3 * (100.0 - record.load as f64);
        raw.max(1.0)
    }
}

impl BalanceStrategy for Weighted {
    fn select(
        &mut self,
        idle: &[WorkerId],
        loads: &BTreeMap<WorkerId, WorkerLoadRecord>,
    ) -> Option<WorkerId> {
        if idle.is_empty() {
            return None;
        }

        let weights: Vec<f64> = idle
            .iter()
            .map(|id| Self::weight(&loads.get(id).cloned().unwrap_or_default()))
            .collect();
        let total: f64 = weights.iter().sum();

        let draw = self.rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (id, weight) in idle.iter().zip(&weights) {
            cumulative += weight;
            if draw < cumulative {
                return Some(*id);
            }
        }
        // Floating-point edge: fall back to the last idle worker.
        idle.last().copied()
    }

    fn kind(&self) -> BalanceKind {
        BalanceKind::Weighted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loads(entries: &[(WorkerId, usize, u64)]) -> BTreeMap<WorkerId, WorkerLoadRecord> {
        entries
            .iter()
            .map(|&(id, load, tasks_processed)| {
                (
                    id,
                    WorkerLoadRecord {
                        load,
                        tasks_processed,
                        last_used: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn balance_kind_parse_roundtrip() {
        for kind in [
            BalanceKind::RoundRobin,
            BalanceKind::LeastLoaded,
            BalanceKind::Weighted,
        ] {
            assert_eq!(kind.to_string().parse::<BalanceKind>().unwrap(), kind);
        }
        assert!("fastest_first".parse::<BalanceKind>().is_err());
    }

    #[test]
    fn round_robin_cycles_through_idle_set() {
        let mut strategy = RoundRobin::new();
        let idle = vec![0, 1, 2];
        let loads = loads(&[(0, 0, 0), (1, 0, 0), (2, 0, 0)]);

        let picks: Vec<WorkerId> = (0..6)
            .map(|_| strategy.select(&idle, &loads).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn round_robin_empty_idle_set() {
        let mut strategy = RoundRobin::new();
        assert_eq!(strategy.select(&[], &BTreeMap::new()), None);
    }

    #[test]
    fn round_robin_adapts_to_shrinking_idle_set() {
        let mut strategy = RoundRobin::new();
        let loads = loads(&[(0, 0, 0), (1, 0, 0), (2, 0, 0)]);
        assert_eq!(strategy.select(&[0, 1, 2], &loads), Some(0));
        // Worker 1 became busy; cursor advances modulo the new idle count.
        assert_eq!(strategy.select(&[0, 2], &loads), Some(2));
        assert_eq!(strategy.select(&[0, 2], &loads), Some(0));
    }

    #[test]
    fn least_loaded_picks_minimum_load() {
        let mut strategy = LeastLoaded;
        let loads = loads(&[(0, 3, 10), (1, 1, 10), (2, 2, 10)]);
        assert_eq!(strategy.select(&[0, 1, 2], &loads), Some(1));
    }

    #[test]
    fn least_loaded_ties_break_by_tasks_processed_then_slot() {
        let mut strategy = LeastLoaded;
        let by_processed = loads(&[(0, 1, 20), (1, 1, 5), (2, 1, 10)]);
        assert_eq!(strategy.select(&[0, 1, 2], &by_processed), Some(1));

        let full_tie = loads(&[(0, 1, 10), (1, 1, 10), (2, 1, 10)]);
        assert_eq!(strategy.select(&[0, 1, 2], &full_tie), Some(0));
    }

    #[test]
    fn weighted_floors_weight_at_one() {
        // load=100 makes the raw load term zero; tasks_processed=0 leaves
        // nothing else. The floor keeps every worker selectable.
        let record = WorkerLoadRecord {
            load: 100,
            tasks_processed: 0,
            last_used: None,
        };
        assert_eq!(Weighted::weight(&record), 1.0);
    }

    #[test]
    fn weighted_distribution_favors_heavier_worker() {
        // Worker 0 weight: 0.7*100 + 0.3*100 = 100. Worker 1 weight: 30.
        // Over many seeded draws worker 0 should dominate at roughly 77%.
        let rng = StdRng::seed_from_u64(42);
        let mut strategy = Weighted::new(Box::new(rng));
        let idle = vec![0, 1];
        let loads = loads(&[(0, 0, 100), (1, 0, 0)]);

        let mut counts = [0usize; 2];
        for _ in 0..2000 {
            let picked = strategy.select(&idle, &loads).unwrap();
            counts[picked] += 1;
        }

        let share = counts[0] as f64 / 2000.0;
        assert!(
            (0.70..0.85).contains(&share),
            "worker 0 share out of expected band: {share}"
        );
    }

    #[test]
    fn weighted_single_worker_always_selected() {
        let rng = StdRng::seed_from_u64(7);
        let mut strategy = Weighted::new(Box::new(rng));
        let loads = loads(&[(3, 0, 0)]);
        for _ in 0..10 {
            assert_eq!(strategy.select(&[3], &loads), Some(3));
        }
    }

    #[test]
    fn make_strategy_matches_kind() {
        for kind in [
            BalanceKind::RoundRobin,
            BalanceKind::LeastLoaded,
            BalanceKind::Weighted,
        ] {
            assert_eq!(make_strategy(kind).kind(), kind);
        }
    }
}
