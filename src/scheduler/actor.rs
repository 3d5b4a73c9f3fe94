//! The scheduler actor: owns all mutable scheduling state and runs the
//! dispatch loop.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advisor::{OptimizationAdvisor, TuningAction};
use crate::balance::{BalanceStrategy, WorkerLoadRecord, make_strategy};
use crate::config::SchedulerConfig;
use crate::error::{Error, SchedulerError, TaskError, WorkerError};
use crate::events::SchedulerEvent;
use crate::monitor::{CpuSampleSet, SampleRing};
use crate::queue::TaskQueue;
use crate::scheduler::{
    Command, ConfigSnapshot, PoolStats, SchedulerMetrics, WeakSchedulerHandle, WorkerMetrics,
};
use crate::task::{Task, TaskPriority, TaskStatus};
use crate::worker::protocol::{MainToWorker, TaskEnvelope, WorkerToMain};
use crate::worker::{WorkerId, WorkerPool};

/// Broadcast capacity for the event stream.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Terminal statuses retained for `status()` queries, oldest evicted first.
const TERMINAL_HISTORY: usize = 1024;

struct SchedulerActor {
    config: SchedulerConfig,
    queue: TaskQueue,
    pool: WorkerPool,
    loads: BTreeMap<WorkerId, WorkerLoadRecord>,
    strategy: Box<dyn BalanceStrategy>,
    running: HashMap<Uuid, Task>,
    terminal: HashMap<Uuid, TaskStatus>,
    terminal_order: VecDeque<Uuid>,
    ring: SampleRing,
    advisor: OptimizationAdvisor,
    events: broadcast::Sender<SchedulerEvent>,
    handle: WeakSchedulerHandle,
    quantum_dirty: bool,
    shutting_down: bool,
}

/// Run the actor to completion. Exits after a shutdown command or once every
/// handle is dropped.
pub(crate) async fn run(
    config: SchedulerConfig,
    mut commands: mpsc::Receiver<Command>,
    handle: WeakSchedulerHandle,
    events: broadcast::Sender<SchedulerEvent>,
) {
    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    let mut actor = SchedulerActor {
        queue: TaskQueue::new(config.max_queue_size),
        pool: WorkerPool::new(reply_tx, config.heartbeat_interval),
        loads: BTreeMap::new(),
        strategy: make_strategy(config.load_balancing),
        running: HashMap::new(),
        terminal: HashMap::new(),
        terminal_order: VecDeque::new(),
        ring: SampleRing::new(config.monitor.history_size),
        advisor: OptimizationAdvisor::new(),
        events,
        handle,
        quantum_dirty: false,
        shutting_down: false,
        config,
    };

    info!(
        workers = actor.config.worker_count,
        quantum_ms = actor.config.quantum.as_millis() as u64,
        strategy = %actor.config.load_balancing,
        "scheduler starting"
    );
    actor.reconcile_pool();

    let mut tick = tokio::time::interval(actor.config.quantum);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if actor.quantum_dirty {
            tick = tokio::time::interval(actor.config.quantum);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            actor.quantum_dirty = false;
        }

        tokio::select! {
            _ = tick.tick() => actor.on_tick(),
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    actor.shutdown(&mut replies).await;
                    let _ = reply.send(());
                    break;
                }
                Some(command) => actor.handle_command(command),
                None => {
                    // Every handle dropped: nothing can reach us any more.
                    actor.shutdown(&mut replies).await;
                    break;
                }
            },
            Some(message) = replies.recv() => actor.handle_worker_message(message),
        }
    }

    info!("scheduler stopped");
}

impl SchedulerActor {
    // ── Command handling ─────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                kind,
                payload,
                priority,
                reply,
            } => {
                if self.shutting_down {
                    let _ = reply.send(Err(Error::Scheduler(SchedulerError::ShuttingDown)));
                    return;
                }
                let task = Task::new(kind, payload, priority);
                let task_id = task.id;
                match self.queue.push(task) {
                    Ok(()) => {
                        debug!(task_id = %task_id, %priority, %kind, "task queued");
                        self.emit(SchedulerEvent::TaskSubmitted { task_id, priority });
                        let _ = reply.send(Ok(task_id));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.status_of(id));
            }
            Command::Metrics { reply } => {
                let _ = reply.send(self.metrics());
            }
            Command::PoolStats { reply } => {
                let _ = reply.send(self.pool_stats());
            }
            Command::SetLoadBalancing(kind) => {
                if self.config.load_balancing != kind {
                    info!(strategy = %kind, "load-balancing strategy switched");
                    self.config.load_balancing = kind;
                    // The strategy object itself is swapped at the next tick.
                }
            }
            Command::SetQuantum { ms, reply } => {
                if !(1..=1000).contains(&ms) {
                    let _ = reply.send(Err(Error::Scheduler(SchedulerError::InvalidTunable {
                        name: "quantum_ms".to_string(),
                        reason: format!("{ms} outside 1..=1000"),
                    })));
                    return;
                }
                self.set_quantum(std::time::Duration::from_millis(ms));
                let _ = reply.send(Ok(()));
            }
            Command::ScaleWorkers { target, reply } => {
                const MAX_WORKERS: usize = 512;
                if target > MAX_WORKERS {
                    let _ = reply.send(Err(Error::Scheduler(SchedulerError::InvalidTunable {
                        name: "worker_count".to_string(),
                        reason: format!("{target} exceeds maximum {MAX_WORKERS}"),
                    })));
                    return;
                }
                info!(target, current = self.pool.live_count(), "scaling worker pool");
                self.config.worker_count = target;
                self.reconcile_pool();
                let _ = reply.send(Ok(target));
            }
            Command::SetPreemption(enabled) => {
                if self.config.preemption_enabled != enabled {
                    info!(enabled, "preemption toggled");
                    self.config.preemption_enabled = enabled;
                }
            }
            Command::CpuSample(sample) => self.handle_sample(sample),
            Command::RespawnWorker { slot } => self.respawn_worker(slot),
            // Normally intercepted by the run loop before reaching here.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn cancel(&mut self, id: Uuid) -> bool {
        // Only queued (undispatched) tasks can be cancelled; there is no
        // cooperative cancellation channel to an executing worker.
        match self.queue.remove(id) {
            Some(mut task) => {
                if let Err(e) = task.transition_to(TaskStatus::Cancelled) {
                    warn!(task_id = %id, error = %e, "cancel transition rejected");
                    return false;
                }
                self.record_terminal(id, TaskStatus::Cancelled);
                self.emit(SchedulerEvent::TaskCancelled { task_id: id });
                true
            }
            None => false,
        }
    }

    fn status_of(&self, id: Uuid) -> Option<TaskStatus> {
        if let Some(task) = self.running.get(&id) {
            return Some(task.status);
        }
        if let Some(task) = self.queue.get(id) {
            return Some(task.status);
        }
        self.terminal.get(&id).copied()
    }

    fn metrics(&self) -> SchedulerMetrics {
        let workers = self
            .pool
            .iter()
            .map(|slot| WorkerMetrics {
                id: slot.id,
                busy: slot.busy,
                current_task: slot.current_task,
                tasks_processed: slot.tasks_processed,
                load: self.loads.get(&slot.id).cloned().unwrap_or_default(),
                last_heartbeat_ms_ago: slot.last_heartbeat.elapsed().as_millis() as u64,
            })
            .collect();

        SchedulerMetrics {
            queue_size: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            queue_utilization_percent: self.queue.utilization_percent(),
            running_tasks: self.running.len(),
            workers,
            config: ConfigSnapshot {
                quantum_ms: self.config.quantum.as_millis() as u64,
                max_queue_size: self.config.max_queue_size,
                worker_target: self.config.worker_count,
                preemption_enabled: self.config.preemption_enabled,
                load_balancing: self.config.load_balancing,
            },
            cpu_samples: self.ring.snapshot(),
        }
    }

    fn pool_stats(&self) -> PoolStats {
        PoolStats {
            queue_size: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            queue_utilization_percent: self.queue.utilization_percent(),
            busy_workers: self.pool.busy_count(),
            idle_workers: self.pool.idle_count(),
        }
    }

    // ── Tick ─────────────────────────────────────────────────────────

    fn on_tick(&mut self) {
        if self.shutting_down {
            return;
        }
        // Strategy switches requested since the last tick take effect here.
        if self.strategy.kind() != self.config.load_balancing {
            self.strategy = make_strategy(self.config.load_balancing);
        }
        self.enforce_liveness();
        self.reconcile_pool();
        self.preempt_if_needed();
        self.dispatch();
    }

    /// Match queued tasks to idle workers until either runs out.
    fn dispatch(&mut self) {
        // During the shutdown drain a crash-recovered task can land back in
        // the queue; it must fall through to the final failure sweep, not
        // onto a freed worker.
        if self.shutting_down {
            return;
        }
        loop {
            if self.queue.is_empty() {
                return;
            }
            let idle = self.pool.idle_ids();
            let Some(worker_id) = self.strategy.select(&idle, &self.loads) else {
                return;
            };
            let Some(mut task) = self.queue.pop() else {
                return;
            };

            if let Err(e) = task.transition_to(TaskStatus::Running) {
                warn!(task_id = %task.id, error = %e, "dispatch transition rejected, dropping task");
                continue;
            }
            task.assigned_worker = Some(worker_id);
            let envelope = TaskEnvelope {
                id: task.id,
                kind: task.kind,
                payload: task.payload.clone(),
            };

            if self
                .pool
                .send(worker_id, MainToWorker::Task { task: envelope })
                .is_err()
            {
                // Channel gone means the thread is dead; the watcher notice
                // is still in flight. Recover now so the task isn't lost.
                warn!(worker_id, "dispatch hit a dead worker channel");
                self.pool.remove(worker_id);
                self.loads.remove(&worker_id);
                self.recover_task(task, worker_id);
                self.schedule_respawn(worker_id);
                continue;
            }

            let task_id = task.id;
            if let Some(slot) = self.pool.get_mut(worker_id) {
                slot.busy = true;
                slot.current_task = Some(task_id);
            }
            let record = self.loads.entry(worker_id).or_default();
            record.load += 1;
            record.last_used = Some(chrono::Utc::now());

            debug!(task_id = %task_id, worker_id, "task dispatched");
            self.emit(SchedulerEvent::TaskStarted { task_id, worker_id });
            self.running.insert(task_id, task);
        }
    }

    /// Logical preemption: when a High/Critical task waits while something
    /// at Normal or below runs, demote the lowest-priority running task one
    /// band and requeue it. The executing thread is not interrupted — only
    /// future re-queuing behavior changes.
    fn preempt_if_needed(&mut self) {
        if !self.config.preemption_enabled {
            return;
        }
        let Some(top) = self.queue.peek_priority() else {
            return;
        };
        if top < TaskPriority::High {
            return;
        }
        if self.queue.len() >= self.queue.capacity() {
            // Nowhere to requeue the victim.
            return;
        }

        let victim_id = self
            .running
            .values()
            .filter(|task| task.priority <= TaskPriority::Normal)
            .min_by_key(|task| (task.priority, task.submitted_at))
            .map(|task| task.id);
        let Some(task_id) = victim_id else {
            return;
        };

        let Some(mut task) = self.running.remove(&task_id) else {
            return;
        };
        let from = task.priority;
        if let Err(e) = task.transition_to(TaskStatus::Preempted) {
            warn!(task_id = %task_id, error = %e, "preemption transition rejected");
            self.running.insert(task_id, task);
            return;
        }
        task.priority = task.priority.demoted();
        task.assigned_worker = None;
        let to = task.priority;

        match self.queue.push(task) {
            Ok(()) => {
                info!(task_id = %task_id, %from, %to, "task logically preempted");
                self.emit(SchedulerEvent::TaskPreempted { task_id, from, to });
            }
            Err(e) => {
                // Capacity was checked above; racing here means a bug.
                warn!(task_id = %task_id, error = %e, "preemption requeue failed");
            }
        }
    }

    /// Recycle idle workers whose heartbeat is stale, when enforcement is
    /// configured. Busy workers are exempt: a long computation is legitimate
    /// silence.
    fn enforce_liveness(&mut self) {
        let Some(timeout) = self.config.heartbeat_timeout else {
            return;
        };
        let stale: Vec<WorkerId> = self
            .pool
            .iter()
            .filter(|slot| !slot.busy && slot.last_heartbeat.elapsed() > timeout)
            .map(|slot| slot.id)
            .collect();
        for worker_id in stale {
            warn!(worker_id, timeout_ms = timeout.as_millis() as u64, "worker heartbeat stale, recycling");
            self.pool.remove(worker_id);
            self.loads.remove(&worker_id);
            self.emit(SchedulerEvent::WorkerError {
                worker_id,
                error: WorkerError::Crashed {
                    worker_id,
                    reason: "heartbeat stale".to_string(),
                }
                .to_string(),
            });
            self.schedule_respawn(worker_id);
        }
    }

    /// Bring the pool to the configured target: spawn into vacancies, retire
    /// surplus workers as they sit idle.
    fn reconcile_pool(&mut self) {
        while self.pool.live_count() < self.config.worker_count {
            match self.pool.spawn_worker() {
                Ok(worker_id) => {
                    self.loads.insert(worker_id, WorkerLoadRecord::default());
                    self.emit(SchedulerEvent::WorkerCreated { worker_id });
                    // Handshake probe; the reply stamps the first heartbeat.
                    let _ = self.pool.send(worker_id, MainToWorker::Status);
                }
                Err(e) => {
                    warn!(error = %e, "failed to spawn worker");
                    return;
                }
            }
        }
        while self.pool.live_count() > self.config.worker_count {
            // Retire the highest-numbered idle worker; busy ones get another
            // look after their current task completes.
            let Some(worker_id) = self.pool.idle_ids().last().copied() else {
                return;
            };
            info!(worker_id, "retiring idle worker");
            self.pool.remove(worker_id);
            self.loads.remove(&worker_id);
        }
    }

    // ── Worker messages ──────────────────────────────────────────────

    fn handle_worker_message(&mut self, message: WorkerToMain) {
        match message {
            WorkerToMain::Result {
                worker_id,
                task_id,
                result,
                execution_time_ms,
            } => self.handle_result(worker_id, task_id, result, execution_time_ms),
            WorkerToMain::Error {
                worker_id,
                task_id,
                error,
            } => self.handle_task_error(worker_id, task_id, error),
            WorkerToMain::Status {
                worker_id,
                task_count,
                ..
            } => {
                debug!(worker_id, task_count, "worker status reply");
                self.touch_heartbeat(worker_id);
            }
            WorkerToMain::Heartbeat { worker_id } => self.touch_heartbeat(worker_id),
            WorkerToMain::Exited {
                worker_id,
                panicked,
                reason,
            } => self.handle_worker_exit(worker_id, panicked, reason),
        }
    }

    fn touch_heartbeat(&mut self, worker_id: WorkerId) {
        if let Some(slot) = self.pool.get_mut(worker_id) {
            slot.last_heartbeat = std::time::Instant::now();
        }
    }

    /// Free the worker after any task-level reply from it.
    fn release_worker(&mut self, worker_id: WorkerId, completed: bool) {
        if let Some(slot) = self.pool.get_mut(worker_id) {
            slot.busy = false;
            slot.current_task = None;
            slot.last_heartbeat = std::time::Instant::now();
            if completed {
                slot.tasks_processed += 1;
            }
        }
        if let Some(record) = self.loads.get_mut(&worker_id) {
            record.load = record.load.saturating_sub(1);
            record.last_used = Some(chrono::Utc::now());
            if completed {
                record.tasks_processed += 1;
            }
        }
    }

    fn handle_result(
        &mut self,
        worker_id: WorkerId,
        task_id: Uuid,
        _result: serde_json::Value,
        execution_time_ms: u64,
    ) {
        self.release_worker(worker_id, true);

        let genuine = matches!(
            self.running.get(&task_id),
            Some(task) if task.assigned_worker == Some(worker_id)
        );
        if genuine {
            if let Some(mut task) = self.running.remove(&task_id) {
                if let Err(e) = task.transition_to(TaskStatus::Completed) {
                    warn!(task_id = %task_id, error = %e, "completion transition rejected");
                }
                self.record_terminal(task_id, TaskStatus::Completed);
                debug!(task_id = %task_id, worker_id, duration_ms = execution_time_ms, "task completed");
                self.emit(SchedulerEvent::TaskCompleted {
                    task_id,
                    worker_id,
                    duration_ms: execution_time_ms,
                });
            }
        } else {
            // A preempted task's first execution finishing after the task
            // was requeued. The work is repeated later; drop this result.
            debug!(task_id = %task_id, worker_id, "discarding stale result");
        }

        // Fast path: hand the freed worker more work without waiting for
        // the next quantum.
        self.dispatch();
    }

    fn handle_task_error(&mut self, worker_id: WorkerId, task_id: Uuid, error: String) {
        self.release_worker(worker_id, false);

        let genuine = matches!(
            self.running.get(&task_id),
            Some(task) if task.assigned_worker == Some(worker_id)
        );
        if genuine {
            if let Some(mut task) = self.running.remove(&task_id) {
                if let Err(e) = task.transition_to(TaskStatus::Failed) {
                    warn!(task_id = %task_id, error = %e, "failure transition rejected");
                }
                self.record_terminal(task_id, TaskStatus::Failed);
                let error = Error::Task(TaskError::ExecutionFailed {
                    id: task_id,
                    reason: error,
                })
                .to_string();
                warn!(task_id = %task_id, worker_id, %error, "task failed");
                self.emit(SchedulerEvent::TaskError { task_id, error });
            }
        } else {
            debug!(task_id = %task_id, worker_id, "discarding stale error");
        }

        self.dispatch();
    }

    fn handle_worker_exit(&mut self, worker_id: WorkerId, panicked: bool, reason: Option<String>) {
        let Some(slot) = self.pool.remove(worker_id) else {
            // Deliberately retired (scale-down, liveness recycle, shutdown):
            // the slot was already dropped.
            debug!(worker_id, panicked, "worker exited");
            self.emit(SchedulerEvent::WorkerExited { worker_id, panicked });
            return;
        };

        // The slot was still live: this is a crash.
        let reason = reason.unwrap_or_else(|| "unexpected exit".to_string());
        let error = WorkerError::Crashed { worker_id, reason };
        warn!(worker_id, error = %error, "worker crashed");
        self.loads.remove(&worker_id);
        self.emit(SchedulerEvent::WorkerError {
            worker_id,
            error: error.to_string(),
        });
        self.emit(SchedulerEvent::WorkerExited { worker_id, panicked });

        if let Some(task_id) = slot.current_task {
            // Only recover the task if this worker still owns it; a preempted
            // task may already be running again elsewhere.
            let owned = matches!(
                self.running.get(&task_id),
                Some(task) if task.assigned_worker == Some(worker_id)
            );
            if owned {
                if let Some(task) = self.running.remove(&task_id) {
                    self.recover_task(task, worker_id);
                }
            }
        }

        if !self.shutting_down {
            self.schedule_respawn(worker_id);
        }
    }

    /// Requeue a crash-interrupted task at the front of the queue — once.
    /// A second crash fails the task; the fault is surfaced, never retried
    /// silently forever.
    fn recover_task(&mut self, mut task: Task, worker_id: WorkerId) {
        let task_id = task.id;
        task.crash_requeues += 1;
        task.assigned_worker = None;

        if task.crash_requeues > 1 {
            let _ = task.transition_to(TaskStatus::Failed);
            self.record_terminal(task_id, TaskStatus::Failed);
            let error = Error::Worker(WorkerError::Crashed {
                worker_id,
                reason: "task crashed its worker twice".to_string(),
            })
            .to_string();
            warn!(task_id = %task_id, %error, "crash recovery exhausted");
            self.emit(SchedulerEvent::TaskError { task_id, error });
            return;
        }

        if let Err(e) = task.transition_to(TaskStatus::Queued) {
            warn!(task_id = %task_id, error = %e, "recovery transition rejected");
            return;
        }
        match self.queue.requeue_front(task) {
            Ok(()) => {
                info!(task_id = %task_id, "requeued task from crashed worker");
            }
            Err(e) => {
                // The requeue itself hit a full queue: this one task fails.
                self.record_terminal(task_id, TaskStatus::Failed);
                self.emit(SchedulerEvent::TaskError {
                    task_id,
                    error: Error::Queue(e).to_string(),
                });
            }
        }
    }

    /// Respawn a crashed worker's slot after a short delay, off the actor.
    fn schedule_respawn(&self, slot: WorkerId) {
        let handle = self.handle.clone();
        let delay = self.config.worker_respawn_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.respawn_worker(slot).await;
        });
    }

    fn respawn_worker(&mut self, slot: WorkerId) {
        if self.shutting_down || self.pool.contains(slot) {
            return;
        }
        if self.pool.live_count() >= self.config.worker_count {
            // Target shrank while the respawn was pending.
            return;
        }
        match self.pool.spawn_into(slot) {
            Ok(()) => {
                self.loads.insert(slot, WorkerLoadRecord::default());
                info!(worker_id = slot, "respawned worker");
                self.emit(SchedulerEvent::WorkerCreated { worker_id: slot });
                let _ = self.pool.send(slot, MainToWorker::Status);
                self.dispatch();
            }
            Err(e) => warn!(worker_id = slot, error = %e, "respawn failed"),
        }
    }

    // ── Self-tuning ──────────────────────────────────────────────────

    fn handle_sample(&mut self, sample: CpuSampleSet) {
        self.emit(SchedulerEvent::CpuMetrics {
            sample: sample.clone(),
        });

        let actions = self.advisor.evaluate(
            &sample,
            &self.config,
            self.pool.live_count(),
            self.pool.idle_count(),
        );
        self.ring.push(sample);

        for action in actions {
            self.apply_tuning(action);
        }
    }

    fn apply_tuning(&mut self, action: TuningAction) {
        match action {
            TuningAction::SetQuantum(quantum) => self.set_quantum(quantum),
            TuningAction::RetireIdleWorker => {
                if let Some(worker_id) = self.pool.idle_ids().last().copied() {
                    info!(worker_id, "advisor retiring idle worker");
                    self.config.worker_count = self.config.worker_count.saturating_sub(1);
                    self.pool.remove(worker_id);
                    self.loads.remove(&worker_id);
                }
            }
            TuningAction::AddWorker => {
                self.config.worker_count += 1;
                self.reconcile_pool();
            }
            TuningAction::SetStrategy(kind) => {
                info!(strategy = %kind, "advisor switching strategy");
                self.config.load_balancing = kind;
            }
            TuningAction::EnablePreemption => {
                info!("advisor enabling preemption");
                self.config.preemption_enabled = true;
            }
        }
    }

    fn set_quantum(&mut self, quantum: std::time::Duration) {
        if quantum != self.config.quantum {
            info!(quantum_ms = quantum.as_millis() as u64, "quantum updated");
            self.config.quantum = quantum;
            self.quantum_dirty = true;
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    async fn shutdown(&mut self, replies: &mut mpsc::UnboundedReceiver<WorkerToMain>) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(
            queued = self.queue.len(),
            in_flight = self.running.len(),
            "scheduler shutting down"
        );

        // Every still-queued task fails; none are silently dropped.
        for mut task in self.queue.drain() {
            let task_id = task.id;
            let _ = task.transition_to(TaskStatus::Failed);
            self.record_terminal(task_id, TaskStatus::Failed);
            self.emit(SchedulerEvent::TaskError {
                task_id,
                error: Error::Scheduler(SchedulerError::ShuttingDown).to_string(),
            });
        }

        // Bounded drain of in-flight work.
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while self.pool.busy_count() > 0 {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        abandoned = self.running.len(),
                        "shutdown grace expired, abandoning in-flight tasks"
                    );
                    let abandoned: Vec<Uuid> = self.running.keys().copied().collect();
                    for task_id in abandoned {
                        self.running.remove(&task_id);
                        self.record_terminal(task_id, TaskStatus::Failed);
                        self.emit(SchedulerEvent::TaskError {
                            task_id,
                            error: Error::Scheduler(SchedulerError::ShuttingDown).to_string(),
                        });
                    }
                    break;
                }
                Some(message) = replies.recv() => {
                    self.handle_worker_message(message);
                }
            }
        }

        // A worker crash during the drain can requeue its task; fail those
        // too rather than leaving them stranded as Queued.
        for mut task in self.queue.drain() {
            let task_id = task.id;
            let _ = task.transition_to(TaskStatus::Failed);
            self.record_terminal(task_id, TaskStatus::Failed);
            self.emit(SchedulerEvent::TaskError {
                task_id,
                error: Error::Scheduler(SchedulerError::ShuttingDown).to_string(),
            });
        }

        // Dropping the slots closes every task channel; idle threads exit
        // promptly, abandoned busy threads exit after their computation.
        self.pool.clear();
        self.loads.clear();
    }

    // ── Bookkeeping ──────────────────────────────────────────────────

    fn record_terminal(&mut self, task_id: Uuid, status: TaskStatus) {
        if self.terminal.insert(task_id, status).is_none() {
            self.terminal_order.push_back(task_id);
            if self.terminal_order.len() > TERMINAL_HISTORY {
                if let Some(evicted) = self.terminal_order.pop_front() {
                    self.terminal.remove(&evicted);
                }
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine; lagging subscribers drop oldest events.
        let _ = self.events.send(event);
    }
}
