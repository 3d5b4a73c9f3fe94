//! Worker pool — isolated execution contexts behind message passing.
//!
//! Core components:
//! - `protocol` — the wire messages between coordinator and workers
//! - `executor` — the CPU-bound work itself, one function per task kind
//! - `pool` — the slot arena, thread lifecycle, and join watcher

pub mod executor;
pub mod pool;
pub mod protocol;

pub use pool::{WorkerId, WorkerPool, WorkerSlot};
pub use protocol::{MainToWorker, TaskEnvelope, WorkerToMain};
