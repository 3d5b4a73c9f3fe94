//! Worker wire protocol.
//!
//! Workers share no memory with the coordinator; these messages are the
//! entire surface between them. Main→worker travels over a per-worker
//! synchronous channel, worker→main over a shared async channel. Replies
//! carry the sender's `worker_id` so the coordinator can attribute them even
//! when the same task ran on more than one worker (preemption re-runs).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::TaskKind;
use crate::worker::WorkerId;

/// What the coordinator hands to a worker: just enough to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub kind: TaskKind,
    pub payload: Value,
}

/// Coordinator → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MainToWorker {
    /// Execute a task.
    Task { task: TaskEnvelope },
    /// Report current status (used as a post-spawn handshake probe).
    Status,
}

/// Worker → coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerToMain {
    /// Task finished successfully.
    Result {
        worker_id: WorkerId,
        task_id: Uuid,
        result: Value,
        execution_time_ms: u64,
    },
    /// Task-level failure; the worker itself is fine.
    Error {
        worker_id: WorkerId,
        task_id: Uuid,
        error: String,
    },
    /// Status probe reply.
    Status {
        worker_id: WorkerId,
        busy: bool,
        task_count: u64,
        load: usize,
    },
    /// Idle liveness ping.
    Heartbeat { worker_id: WorkerId },
    /// The worker thread terminated. Emitted by the join watcher, not the
    /// worker itself; `panicked` distinguishes crash from clean exit.
    Exited {
        worker_id: WorkerId,
        panicked: bool,
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_message_wire_shape() {
        let msg = MainToWorker::Task {
            task: TaskEnvelope {
                id: Uuid::nil(),
                kind: TaskKind::Sorting,
                payload: serde_json::json!({"count": 10}),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["task"]["kind"], "sorting");
        assert_eq!(json["task"]["payload"]["count"], 10);
    }

    #[test]
    fn result_message_roundtrip() {
        let msg = WorkerToMain::Result {
            worker_id: 1,
            task_id: Uuid::new_v4(),
            result: serde_json::json!({"sum": 42.0}),
            execution_time_ms: 7,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: WorkerToMain = serde_json::from_str(&json).unwrap();
        match parsed {
            WorkerToMain::Result {
                worker_id,
                execution_time_ms,
                ..
            } => {
                assert_eq!(worker_id, 1);
                assert_eq!(execution_time_ms, 7);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_wire_shape() {
        let json = serde_json::to_value(WorkerToMain::Heartbeat { worker_id: 3 }).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["worker_id"], 3);
    }
}
