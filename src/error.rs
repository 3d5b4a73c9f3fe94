//! Error types for threadmill.

use uuid::Uuid;

use crate::worker::WorkerId;

/// Top-level error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Task-queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// Task-level errors. These surface to the caller unchanged — the scheduler
/// performs no automatic retry of failed tasks.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} execution failed: {reason}")]
    ExecutionFailed { id: Uuid, reason: String },
}

/// Worker-pool errors. Thread crashes are recovered internally (the in-flight
/// task is requeued once); these variants describe what happened, not what
/// the caller must do.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {worker_id} crashed: {reason}")]
    Crashed { worker_id: WorkerId, reason: String },

    #[error("Worker {worker_id} channel closed")]
    ChannelClosed { worker_id: WorkerId },

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}

/// Scheduler lifecycle and tuning-surface errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Invalid value for tunable {name}: {reason}")]
    InvalidTunable { name: String, reason: String },
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
