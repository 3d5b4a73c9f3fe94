//! Task model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::WorkerId;

/// Priority band for queued work. Higher values dispatch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Background = 1,
    Low = 2,
    Normal = 3,
    High = 4,
    Critical = 5,
}

impl TaskPriority {
    /// Demote one band, floored at Background. Used by logical preemption.
    pub fn demoted(self) -> TaskPriority {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Normal,
            Self::Normal => Self::Low,
            Self::Low | Self::Background => Self::Background,
        }
    }

    /// Numeric level of this band (Background=1 .. Critical=5).
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Background => "background",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// The kind of CPU-bound work a task carries. The worker matches on this
/// exhaustively — new workloads are added as variants, not string comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Computation,
    Sorting,
    Search,
    Processing,
    Generic,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Computation => "computation",
            Self::Sorting => "sorting",
            Self::Search => "search",
            Self::Processing => "processing",
            Self::Generic => "generic",
        };
        write!(f, "{s}")
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the priority queue.
    Queued,
    /// Dispatched to a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Worker reported an execution error, or the task was discarded.
    Failed,
    /// Logically preempted — back in the queue at reduced priority.
    Preempted,
    /// Removed from the queue before dispatch.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) | (Queued, Cancelled) | (Queued, Failed) |
            // From Running (Queued = requeue after a worker crash)
            (Running, Completed) | (Running, Failed) | (Running, Preempted) | (Running, Queued) |
            // From Preempted (re-dispatch, cancel while requeued, shutdown)
            (Preempted, Running) | (Preempted, Cancelled) | (Preempted, Failed)
        )
    }

    /// Check if this is a terminal status. Preempted is *not* terminal —
    /// the task re-enters the queue at reduced priority.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Preempted => "preempted",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A unit of CPU-bound work.
///
/// A task lives in exactly one of the queue or the running set at a time.
/// Terminal statuses are final and remove the task from all live structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: Uuid,
    /// Workload kind.
    pub kind: TaskKind,
    /// Kind-specific payload, interpreted by the worker.
    pub payload: serde_json::Value,
    /// Current priority band (may drop through demotion).
    pub priority: TaskPriority,
    /// When the task was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Current status.
    pub status: TaskStatus,
    /// Worker currently executing the task, if any.
    pub assigned_worker: Option<WorkerId>,
    /// Number of crash-recovery requeues. A task is requeued at most once;
    /// a second worker crash fails it.
    pub crash_requeues: u32,
}

impl Task {
    /// Create a new queued task.
    pub fn new(kind: TaskKind, payload: serde_json::Value, priority: TaskPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            priority,
            submitted_at: Utc::now(),
            status: TaskStatus::Queued,
            assigned_worker: None,
            crash_requeues: 0,
        }
    }

    /// Transition to a new status, enforcing the state machine.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, target
            ));
        }
        self.status = target;
        Ok(())
    }
}
