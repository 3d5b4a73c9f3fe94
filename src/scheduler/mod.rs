//! Scheduler — the coordinating actor and its public handle.
//!
//! All scheduler state (queue, worker arena, load records, config) is owned
//! by a single actor task; every external call becomes a message into its
//! inbox. That preserves the single-writer invariant without locks: mutation
//! only ever happens on the actor, in response to a command, a worker reply,
//! or a timer tick.

mod actor;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::balance::{BalanceKind, WorkerLoadRecord};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result, SchedulerError};
use crate::events::SchedulerEvent;
use crate::monitor::CpuSampleSet;
use crate::task::{TaskKind, TaskPriority, TaskStatus};
use crate::worker::WorkerId;

pub use actor::EVENT_CHANNEL_CAPACITY;

/// Lightweight queue/worker stats for the CPU monitor.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub queue_utilization_percent: f32,
    pub busy_workers: usize,
    pub idle_workers: usize,
}

/// Per-worker stats in a metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMetrics {
    pub id: WorkerId,
    pub busy: bool,
    pub current_task: Option<Uuid>,
    pub tasks_processed: u64,
    pub load: WorkerLoadRecord,
    pub last_heartbeat_ms_ago: u64,
}

/// Tunables as currently applied.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub quantum_ms: u64,
    pub max_queue_size: usize,
    pub worker_target: usize,
    pub preemption_enabled: bool,
    pub load_balancing: BalanceKind,
}

/// Full metrics snapshot for the tuning surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub queue_utilization_percent: f32,
    pub running_tasks: usize,
    pub workers: Vec<WorkerMetrics>,
    pub config: ConfigSnapshot,
    pub cpu_samples: Vec<CpuSampleSet>,
}

/// Messages into the actor's inbox.
pub(crate) enum Command {
    Submit {
        kind: TaskKind,
        payload: serde_json::Value,
        priority: TaskPriority,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Status {
        id: Uuid,
        reply: oneshot::Sender<Option<TaskStatus>>,
    },
    Metrics {
        reply: oneshot::Sender<SchedulerMetrics>,
    },
    PoolStats {
        reply: oneshot::Sender<PoolStats>,
    },
    SetLoadBalancing(BalanceKind),
    SetQuantum {
        ms: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    ScaleWorkers {
        target: usize,
        reply: oneshot::Sender<Result<usize>>,
    },
    SetPreemption(bool),
    CpuSample(CpuSampleSet),
    RespawnWorker {
        slot: WorkerId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Entry point: starts the actor (and the CPU monitor, when enabled) and
/// returns the cloneable handle.
pub struct Scheduler;

impl Scheduler {
    /// Start a scheduler with the given configuration. Must be called from
    /// within a tokio runtime.
    pub fn start(config: SchedulerConfig) -> SchedulerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let handle = SchedulerHandle {
            commands: commands_tx,
            events: events_tx.clone(),
        };

        let monitor_config = config.monitor.clone();
        let monitor_enabled = monitor_config.enabled;

        // Internal collaborators hold only weak senders: once every public
        // handle is dropped the command channel closes and the actor exits.
        tokio::spawn(actor::run(config, commands_rx, handle.downgrade(), events_tx));

        if monitor_enabled {
            crate::monitor::spawn_monitor(handle.downgrade(), monitor_config);
        }

        handle
    }
}

/// Cloneable handle to the scheduler actor.
///
/// Every method is a message round-trip; a `ShuttingDown` error means the
/// actor is gone or going.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Submit a task. Fails with `QueueError::Full` at capacity.
    pub async fn submit(
        &self,
        kind: TaskKind,
        payload: serde_json::Value,
        priority: TaskPriority,
    ) -> Result<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            kind,
            payload,
            priority,
            reply,
        })
        .await?;
        self.recv(rx).await?
    }

    /// Cancel a queued task. Returns `false` for tasks already dispatched,
    /// finished, or unknown.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { id, reply }).await?;
        self.recv(rx).await
    }

    /// Current status of a task, or `None` if it was never seen (or its
    /// terminal record has aged out).
    pub async fn status(&self, id: Uuid) -> Result<Option<TaskStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { id, reply }).await?;
        self.recv(rx).await
    }

    /// Full metrics snapshot.
    pub async fn metrics(&self) -> Result<SchedulerMetrics> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Metrics { reply }).await?;
        self.recv(rx).await
    }

    /// Switch the load-balancing strategy. Takes effect on the next tick.
    pub async fn set_load_balancing(&self, kind: BalanceKind) -> Result<()> {
        self.send(Command::SetLoadBalancing(kind)).await
    }

    /// Set the dispatch quantum in milliseconds (1..=1000).
    pub async fn set_quantum(&self, ms: u64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetQuantum { ms, reply }).await?;
        self.recv(rx).await?
    }

    /// Set the target worker-pool size. Surplus workers are retired as they
    /// go idle; missing workers are spawned on the next tick.
    pub async fn scale_workers(&self, target: usize) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ScaleWorkers { target, reply }).await?;
        self.recv(rx).await?
    }

    /// Enable or disable logical preemption.
    pub async fn set_preemption(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetPreemption(enabled)).await
    }

    /// Subscribe to the scheduler event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Graceful shutdown: drains in-flight work up to the configured grace,
    /// fails still-queued tasks, stops the actor. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the actor is gone.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub(crate) fn downgrade(&self) -> WeakSchedulerHandle {
        WeakSchedulerHandle {
            commands: self.commands.downgrade(),
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Scheduler(SchedulerError::ShuttingDown))
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        rx.await
            .map_err(|_| Error::Scheduler(SchedulerError::ShuttingDown))
    }
}

/// Non-owning handle for internal collaborators (the CPU monitor, delayed
/// respawns scheduled by the actor itself). Unlike `SchedulerHandle` it does
/// not keep the command channel open, so the actor can still observe every
/// public handle being dropped.
#[derive(Clone)]
pub(crate) struct WeakSchedulerHandle {
    commands: mpsc::WeakSender<Command>,
}

impl WeakSchedulerHandle {
    pub(crate) async fn pool_stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PoolStats { reply }).await?;
        rx.await
            .map_err(|_| Error::Scheduler(SchedulerError::ShuttingDown))
    }

    pub(crate) async fn ingest_sample(&self, sample: CpuSampleSet) -> Result<()> {
        self.send(Command::CpuSample(sample)).await
    }

    pub(crate) async fn respawn_worker(&self, slot: WorkerId) -> Result<()> {
        self.send(Command::RespawnWorker { slot }).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        let commands = self
            .commands
            .upgrade()
            .ok_or(Error::Scheduler(SchedulerError::ShuttingDown))?;
        commands
            .send(command)
            .await
            .map_err(|_| Error::Scheduler(SchedulerError::ShuttingDown))
    }
}
