//! Scheduler event stream.
//!
//! Events are broadcast from the scheduler actor and consumed by external
//! monitoring collaborators. Lagging subscribers drop the oldest events
//! (tokio broadcast semantics); the scheduler never blocks on the stream.

use serde::Serialize;
use uuid::Uuid;

use crate::monitor::CpuSampleSet;
use crate::task::TaskPriority;
use crate::worker::WorkerId;

/// Events emitted over the scheduler's broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A task entered the queue.
    TaskSubmitted {
        task_id: Uuid,
        priority: TaskPriority,
    },
    /// A task was dispatched to a worker.
    TaskStarted { task_id: Uuid, worker_id: WorkerId },
    /// A worker finished a task successfully.
    TaskCompleted {
        task_id: Uuid,
        worker_id: WorkerId,
        duration_ms: u64,
    },
    /// A task failed — worker-reported error, crash-recovery exhaustion, or
    /// shutdown discard.
    TaskError { task_id: Uuid, error: String },
    /// A running task was logically preempted and requeued at lower priority.
    TaskPreempted {
        task_id: Uuid,
        from: TaskPriority,
        to: TaskPriority,
    },
    /// A queued task was cancelled before dispatch.
    TaskCancelled { task_id: Uuid },
    /// A worker thread was spawned (initial pool, scale-up, or respawn).
    WorkerCreated { worker_id: WorkerId },
    /// A worker crashed with an in-flight task or failed unexpectedly.
    WorkerError { worker_id: WorkerId, error: String },
    /// A worker thread exited.
    WorkerExited { worker_id: WorkerId, panicked: bool },
    /// A CPU/queue utilization sample was taken.
    CpuMetrics { sample: CpuSampleSet },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = SchedulerEvent::TaskSubmitted {
            task_id: Uuid::nil(),
            priority: TaskPriority::High,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_submitted");
        assert_eq!(json["priority"], "high");
    }

    #[test]
    fn worker_exited_serializes_panic_flag() {
        let event = SchedulerEvent::WorkerExited {
            worker_id: 2,
            panicked: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "worker_exited");
        assert_eq!(json["worker_id"], 2);
        assert_eq!(json["panicked"], true);
    }
}
