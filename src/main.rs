use std::time::Duration;

use serde_json::json;
use threadmill::scheduler::Scheduler;
use threadmill::{BalanceKind, SchedulerConfig, SchedulerEvent, TaskKind, TaskPriority};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = SchedulerConfig::default();
    if let Ok(workers) = std::env::var("THREADMILL_WORKERS") {
        config.worker_count = workers.parse().unwrap_or(config.worker_count);
    }
    if let Ok(quantum) = std::env::var("THREADMILL_QUANTUM_MS") {
        if let Ok(ms) = quantum.parse::<u64>() {
            config.quantum = Duration::from_millis(ms);
        }
    }
    if let Ok(strategy) = std::env::var("THREADMILL_STRATEGY") {
        config.load_balancing = strategy.parse().unwrap_or(config.load_balancing);
    }
    config.preemption_enabled = true;

    eprintln!("🎡 threadmill v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.worker_count);
    eprintln!("   Quantum: {:?}", config.quantum);
    eprintln!("   Strategy: {}", config.load_balancing);
    eprintln!();

    let handle = Scheduler::start(config);
    let mut events = handle.subscribe();

    // A mixed demo workload: heavy background computation, mid-priority
    // sorting and search, then a critical task arriving last to exercise
    // priority ordering and preemption.
    for _ in 0..4 {
        handle
            .submit(
                TaskKind::Computation,
                json!({ "iterations": 4_000_000 }),
                TaskPriority::Low,
            )
            .await?;
    }
    handle
        .submit(TaskKind::Sorting, json!({ "count": 200_000 }), TaskPriority::Normal)
        .await?;
    handle
        .submit(
            TaskKind::Search,
            json!({ "target": 7, "count": 500_000 }),
            TaskPriority::Normal,
        )
        .await?;
    handle
        .submit(
            TaskKind::Processing,
            json!({ "text": "the quick brown fox jumps over the lazy dog the fox" }),
            TaskPriority::High,
        )
        .await?;
    handle
        .submit(
            TaskKind::Generic,
            json!({ "spin_ms": 50 }),
            TaskPriority::Critical,
        )
        .await?;

    let mut completed = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while completed < 8 {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        match event {
            Ok(event) => {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
                if matches!(
                    event,
                    SchedulerEvent::TaskCompleted { .. } | SchedulerEvent::TaskError { .. }
                ) {
                    completed += 1;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("(lagged, skipped {skipped} events)");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    // Show what the self-tuning surface looks like before shutting down.
    handle.set_load_balancing(BalanceKind::LeastLoaded).await?;
    let metrics = handle.metrics().await?;
    eprintln!(
        "\nprocessed {} tasks across {} workers (queue {}/{})",
        metrics
            .workers
            .iter()
            .map(|w| w.tasks_processed)
            .sum::<u64>(),
        metrics.workers.len(),
        metrics.queue_size,
        metrics.queue_capacity,
    );

    handle.shutdown().await;
    Ok(())
}
