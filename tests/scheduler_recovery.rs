//! Integration tests for fault handling: worker crashes, crash-requeue
//! limits, logical preemption with stale-result discard, heartbeat
//! liveness, and graceful shutdown of in-flight work.

use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use threadmill::scheduler::Scheduler;
use threadmill::{SchedulerConfig, SchedulerEvent, TaskKind, TaskPriority, TaskStatus};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

fn test_config(workers: usize) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.worker_count = workers;
    config.quantum = Duration::from_millis(10);
    config.heartbeat_interval = Duration::from_millis(50);
    config.worker_respawn_delay = Duration::from_millis(20);
    config.monitor.enabled = false;
    config
}

async fn wait_for<F>(
    events: &mut broadcast::Receiver<SchedulerEvent>,
    mut pred: F,
) -> SchedulerEvent
where
    F: FnMut(&SchedulerEvent) -> bool,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed while waiting: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_crash_requeues_once_then_fails_the_task() {
    let handle = Scheduler::start(test_config(1));
    let mut events = handle.subscribe();

    // The `panic` payload key makes the executor panic its worker thread.
    let id = handle
        .submit(TaskKind::Generic, json!({ "panic": true }), TaskPriority::Normal)
        .await
        .unwrap();

    let mut starts = 0;
    let mut crashes = 0;
    let mut failed = false;

    while !failed {
        match wait_for(&mut events, |_| true).await {
            SchedulerEvent::TaskStarted { task_id, .. } if task_id == id => starts += 1,
            SchedulerEvent::WorkerExited { panicked: true, .. } => crashes += 1,
            SchedulerEvent::TaskError { task_id, .. } if task_id == id => failed = true,
            _ => {}
        }
    }

    // First run crashes and requeues, second run crashes and fails the task.
    assert_eq!(starts, 2, "task should have been dispatched exactly twice");
    assert_eq!(crashes, 2);
    assert_eq!(handle.status(id).await.unwrap(), Some(TaskStatus::Failed));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_is_restored_after_a_crash() {
    let handle = Scheduler::start(test_config(1));
    let mut events = handle.subscribe();

    handle
        .submit(TaskKind::Generic, json!({ "panic": true }), TaskPriority::Normal)
        .await
        .unwrap();

    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::WorkerExited { panicked: true, .. })
    })
    .await;
    wait_for(&mut events, |e| matches!(e, SchedulerEvent::WorkerCreated { .. })).await;

    // A healthy task completes on the respawned worker.
    let id = handle
        .submit(
            TaskKind::Computation,
            json!({ "iterations": 10_000 }),
            TaskPriority::High,
        )
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::TaskCompleted { task_id, .. } if *task_id == id)
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn preemption_demotes_and_reruns_exactly_once() {
    let mut config = test_config(1);
    config.preemption_enabled = true;
    let handle = Scheduler::start(config);
    let mut events = handle.subscribe();

    let low = handle
        .submit(TaskKind::Generic, json!({ "spin_ms": 300 }), TaskPriority::Low)
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if *task_id == low)
    })
    .await;

    // A critical arrival while a Low task occupies the only worker triggers
    // logical preemption: demote and requeue, without interrupting the thread.
    let critical = handle
        .submit(TaskKind::Generic, json!({ "spin_ms": 5 }), TaskPriority::Critical)
        .await
        .unwrap();

    let preempted = wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::TaskPreempted { task_id, .. } if *task_id == low)
    })
    .await;
    if let SchedulerEvent::TaskPreempted { from, to, .. } = preempted {
        assert_eq!(from, TaskPriority::Low);
        assert_eq!(to, TaskPriority::Background);
    }

    // The critical task runs as soon as the worker frees up, then the
    // demoted task reruns. Its first (stale) result must not complete it.
    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::TaskCompleted { task_id, .. } if *task_id == critical)
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::TaskCompleted { task_id, .. } if *task_id == low)
    })
    .await;
    assert_eq!(handle.status(low).await.unwrap(), Some(TaskStatus::Completed));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeats_keep_idle_workers_alive() {
    let mut config = test_config(2);
    config.heartbeat_timeout = Some(Duration::from_millis(200));
    let handle = Scheduler::start(config);
    let mut events = handle.subscribe();

    // Idle well past the timeout; heartbeats must prevent recycling.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.workers.len(), 2);
    for worker in &metrics.workers {
        assert!(
            worker.last_heartbeat_ms_ago < 200,
            "worker {} heartbeat is stale ({}ms)",
            worker.id,
            worker.last_heartbeat_ms_ago
        );
    }

    // And no worker errors were reported along the way.
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SchedulerEvent::WorkerError { .. }),
            "unexpected worker error: {event:?}"
        );
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_fails_crash_recovered_tasks_instead_of_redispatching() {
    let handle = Scheduler::start(test_config(2));
    let mut events = handle.subscribe();

    // One task crashes its worker mid-shutdown; the other outlives the crash
    // so a freed worker exists while the recovered task sits in the queue.
    let crasher = handle
        .submit(
            TaskKind::Generic,
            json!({ "spin_ms": 250, "panic": true }),
            TaskPriority::Normal,
        )
        .await
        .unwrap();
    let survivor = handle
        .submit(TaskKind::Generic, json!({ "spin_ms": 500 }), TaskPriority::Normal)
        .await
        .unwrap();

    let mut started = std::collections::HashSet::new();
    while started.len() < 2 {
        if let SchedulerEvent::TaskStarted { task_id, .. } =
            wait_for(&mut events, |e| matches!(e, SchedulerEvent::TaskStarted { .. })).await
        {
            started.insert(task_id);
        }
    }

    handle.shutdown().await;

    // The recovered task must end in the shutdown failure sweep, never on a
    // worker freed during the drain.
    let mut crasher_error = None;
    let mut crasher_restarts = 0;
    let mut survivor_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::TaskError { task_id, error } if task_id == crasher => {
                crasher_error = Some(error);
            }
            SchedulerEvent::TaskStarted { task_id, .. } if task_id == crasher => {
                crasher_restarts += 1;
            }
            SchedulerEvent::TaskCompleted { task_id, .. } if task_id == survivor => {
                survivor_completed = true;
            }
            _ => {}
        }
    }
    assert_eq!(crasher_restarts, 0, "recovered task was redispatched during shutdown");
    assert!(survivor_completed);
    let error = crasher_error.expect("recovered task should fail during shutdown");
    assert!(error.contains("shutting down"), "unexpected error: {error}");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_in_flight_work() {
    let handle = Scheduler::start(test_config(1));
    let mut events = handle.subscribe();

    let id = handle
        .submit(TaskKind::Generic, json!({ "spin_ms": 150 }), TaskPriority::Normal)
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if *task_id == id)
    })
    .await;

    // Shutdown waits for the in-flight task within the grace period.
    handle.shutdown().await;

    let completed = loop {
        match events.try_recv() {
            Ok(SchedulerEvent::TaskCompleted { task_id, .. }) if task_id == id => break true,
            Ok(_) => continue,
            Err(_) => break false,
        }
    };
    assert!(completed, "in-flight task should complete during shutdown");
}
