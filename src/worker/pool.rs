//! Worker-pool arena.
//!
//! Workers live in an indexed slot array; a worker's ID is its slot index and
//! stays stable across crash recreation. Each worker is a real OS thread with
//! no shared mutable state — the per-slot sender and the shared reply channel
//! are the only links to the coordinator. All slot mutation happens on the
//! coordinating actor.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::worker::executor;
use crate::worker::protocol::{MainToWorker, WorkerToMain};

/// Stable worker identifier: the slot index in the pool arena.
pub type WorkerId = usize;

/// Coordinator-side handle for one live worker.
#[derive(Debug)]
pub struct WorkerSlot {
    pub id: WorkerId,
    /// Whether a task is currently dispatched to this worker.
    pub busy: bool,
    /// Last heartbeat, status reply, or task reply.
    pub last_heartbeat: Instant,
    /// Tasks completed by this incarnation of the worker.
    pub tasks_processed: u64,
    /// Task in flight, if any.
    pub current_task: Option<Uuid>,
    sender: mpsc::Sender<MainToWorker>,
}

/// The worker arena. Dropping a slot's sender is the shutdown signal for its
/// thread; a dedicated watcher reports thread exit (clean or panicked) back
/// over the reply channel.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Option<WorkerSlot>>,
    reply_tx: UnboundedSender<WorkerToMain>,
    heartbeat_interval: Duration,
}

impl WorkerPool {
    pub fn new(reply_tx: UnboundedSender<WorkerToMain>, heartbeat_interval: Duration) -> Self {
        Self {
            slots: Vec::new(),
            reply_tx,
            heartbeat_interval,
        }
    }

    /// Spawn a worker into the first vacant slot (or a new one) and return
    /// its ID.
    pub fn spawn_worker(&mut self) -> Result<WorkerId, WorkerError> {
        let id = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.slots.push(None);
                self.slots.len() - 1
            });
        self.spawn_into(id)?;
        Ok(id)
    }

    /// Spawn a worker into a specific vacant slot (crash-recovery respawn).
    pub fn spawn_into(&mut self, id: WorkerId) -> Result<(), WorkerError> {
        if id >= self.slots.len() {
            self.slots.resize_with(id + 1, || None);
        }
        if self.slots[id].is_some() {
            return Err(WorkerError::SpawnFailed(format!("slot {id} is occupied")));
        }

        let (task_tx, task_rx) = mpsc::channel();
        let reply_tx = self.reply_tx.clone();
        let heartbeat_interval = self.heartbeat_interval;

        let handle = std::thread::Builder::new()
            .name(format!("threadmill-worker-{id}"))
            .spawn(move || worker_loop(id, task_rx, reply_tx, heartbeat_interval))
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        // The watcher turns thread termination into an inbox message. A
        // blocking join is fine here: it parks a blocking-pool thread, never
        // the coordinator.
        let watcher_tx = self.reply_tx.clone();
        tokio::task::spawn_blocking(move || {
            let (panicked, reason) = match handle.join() {
                Ok(()) => (false, None),
                Err(payload) => (true, Some(panic_reason(payload.as_ref()))),
            };
            let _ = watcher_tx.send(WorkerToMain::Exited {
                worker_id: id,
                panicked,
                reason,
            });
        });

        self.slots[id] = Some(WorkerSlot {
            id,
            busy: false,
            last_heartbeat: Instant::now(),
            tasks_processed: 0,
            current_task: None,
            sender: task_tx,
        });
        debug!(worker_id = id, "spawned worker thread");
        Ok(())
    }

    /// Send a message to a worker. A send failure means its thread is gone.
    pub fn send(&self, id: WorkerId, message: MainToWorker) -> Result<(), WorkerError> {
        let slot = self
            .get(id)
            .ok_or(WorkerError::ChannelClosed { worker_id: id })?;
        slot.sender
            .send(message)
            .map_err(|_| WorkerError::ChannelClosed { worker_id: id })
    }

    /// Remove a slot. Dropping the sender makes the worker thread exit after
    /// it finishes whatever it is doing.
    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerSlot> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.get(id).is_some()
    }

    /// Live worker IDs in slot order.
    pub fn ids(&self) -> Vec<WorkerId> {
        self.iter().map(|slot| slot.id).collect()
    }

    /// Idle (not busy) worker IDs in slot order.
    pub fn idle_ids(&self) -> Vec<WorkerId> {
        self.iter()
            .filter(|slot| !slot.busy)
            .map(|slot| slot.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn live_count(&self) -> usize {
        self.iter().count()
    }

    pub fn busy_count(&self) -> usize {
        self.iter().filter(|slot| slot.busy).count()
    }

    pub fn idle_count(&self) -> usize {
        self.iter().filter(|slot| !slot.busy).count()
    }

    /// Drop every slot, signalling all worker threads to exit.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Worker thread event loop: execute tasks, answer status probes, heartbeat
/// while idle, exit when the coordinator drops the channel.
fn worker_loop(
    id: WorkerId,
    tasks: Receiver<MainToWorker>,
    reply: UnboundedSender<WorkerToMain>,
    heartbeat_interval: Duration,
) {
    let mut processed = 0u64;
    loop {
        match tasks.recv_timeout(heartbeat_interval) {
            Ok(MainToWorker::Task { task }) => {
                let start = Instant::now();
                match executor::execute(task.kind, &task.payload) {
                    Ok(result) => {
                        processed += 1;
                        let elapsed_ms = start.elapsed().as_millis() as u64;
                        if reply
                            .send(WorkerToMain::Result {
                                worker_id: id,
                                task_id: task.id,
                                result,
                                execution_time_ms: elapsed_ms,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(error) => {
                        if reply
                            .send(WorkerToMain::Error {
                                worker_id: id,
                                task_id: task.id,
                                error,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            Ok(MainToWorker::Status) => {
                // The worker processes messages serially, so when it answers
                // a probe it is by definition idle with nothing in flight.
                let _ = reply.send(WorkerToMain::Status {
                    worker_id: id,
                    busy: false,
                    task_count: processed,
                    load: 0,
                });
            }
            Err(RecvTimeoutError::Timeout) => {
                if reply.send(WorkerToMain::Heartbeat { worker_id: id }).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Best-effort extraction of a panic message for the exit notice.
fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        error!("worker panicked with non-string payload");
        "unknown panic".to_string()
    }
}
