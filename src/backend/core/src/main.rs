//! submitq server - runs the submit worker pool and scheduler against Redis.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use submitq_core::{
    config::Config,
    jobs::{
        HttpLedgerGateway, JobScheduler, JobState, JobStore, RedisJobStore, RetentionLimits,
        SubmissionExecutor, WorkerConfig, WorkerPool,
    },
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Invalid configuration is fatal here, never at first use
    let config = match std::env::var("SUBMITQ_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        Err(_) => Config::load().context("Failed to load configuration")?,
    };

    telemetry::init_telemetry(&config.observability, "submitq-server")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        concurrency = config.queue.concurrency,
        max_attempts = config.queue.max_attempts,
        backoff_type = %config.queue.backoff_type,
        backoff_delay_ms = config.queue.backoff_delay_ms,
        scheduler_enabled = config.queue.scheduler_enabled,
        "Starting submitq server"
    );

    let redis_store = RedisJobStore::connect(&config.redis).await?;
    redis_store
        .check_eviction_policy(config.redis.require_noeviction)
        .await?;
    let store: Arc<dyn JobStore> = Arc::new(redis_store);

    // Re-apply retention caps in case they were lowered since the last run
    let retention = RetentionLimits::from(&config.queue);
    for state in [JobState::Completed, JobState::Failed] {
        if let Some(cap) = retention.cap_for(state) {
            let evicted = store.trim_retained(state, cap).await?;
            if evicted > 0 {
                tracing::info!(list = %state, evicted, cap, "Trimmed retention list to configured cap");
            }
        }
    }

    let gateway = Arc::new(HttpLedgerGateway::new(&config.gateway)?);
    tracing::info!(
        gateway = %gateway.base_url(),
        channel = %config.gateway.channel,
        contract = %config.gateway.contract,
        "Ledger gateway configured"
    );

    let executor = Arc::new(SubmissionExecutor::new(
        store.clone(),
        gateway,
        retention,
    ));

    let workers = WorkerPool::new(
        store.clone(),
        executor,
        WorkerConfig::from(&config.queue),
    )
    .start();

    let scheduler = if config.queue.scheduler_enabled {
        Some(
            JobScheduler::new(
                store.clone(),
                Duration::from_millis(config.queue.scheduler_interval_ms),
            )
            .with_stall_recovery(
                Duration::from_millis(config.queue.stall_timeout_ms),
                retention,
            )
            .start(),
        )
    } else {
        tracing::warn!("Scheduler disabled, another process must promote delayed jobs");
        None
    };

    shutdown_signal().await;

    // Scheduler first so nothing is promoted into a draining pool
    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    let stats = workers.stats().clone();
    workers.shutdown().await;

    tracing::info!(
        processed = stats.processed(),
        succeeded = stats.succeeded(),
        retried = stats.retried(),
        failed = stats.failed(),
        "Server shutdown complete"
    );

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
