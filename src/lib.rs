//! Threadmill — in-process task scheduler with a worker-thread pool.
//!
//! Submit CPU-bound tasks through a [`scheduler::SchedulerHandle`]; a
//! coordinator actor queues them by priority, dispatches to dedicated OS
//! threads via a pluggable load-balancing strategy, and self-tunes its
//! dispatch quantum and pool size from CPU sampling.

pub mod advisor;
pub mod balance;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use balance::BalanceKind;
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use events::SchedulerEvent;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use task::{Task, TaskKind, TaskPriority, TaskStatus};
