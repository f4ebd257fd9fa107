//! Worker pool for concurrent job execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use super::executor::{AttemptOutcome, SubmissionExecutor};
use super::store::JobStore;
use crate::config::QueueConfig;
use crate::telemetry::QueueMetrics;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions in this pool
    pub concurrency: usize,
    /// Idle wait before polling the store again (milliseconds)
    pub poll_interval_ms: u64,
    /// Pool name, used in logs and metric labels
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            poll_interval_ms: config.poll_interval_ms,
            name: "submit-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Statistics for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total attempts run
    pub processed: Arc<AtomicU64>,
    /// Attempts that completed their job
    pub succeeded: Arc<AtomicU64>,
    /// Attempts that scheduled a retry
    pub retried: Arc<AtomicU64>,
    /// Attempts that failed their job
    pub failed: Arc<AtomicU64>,
    /// Attempts whose outcome was dropped after a conflict
    pub conflicts: Arc<AtomicU64>,
    /// Currently running attempts
    pub active: Arc<AtomicU64>,
    /// Highest number of simultaneous attempts seen
    pub peak_active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn peak_active(&self) -> u64 {
        self.peak_active.load(Ordering::Relaxed)
    }

    fn begin(&self) -> u64 {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        active
    }

    fn finish(&self, outcome: Option<AttemptOutcome>) -> u64 {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Some(AttemptOutcome::Completed) => Some(&self.succeeded),
            Some(AttemptOutcome::Retrying { .. }) => Some(&self.retried),
            Some(AttemptOutcome::Failed { .. }) => Some(&self.failed),
            Some(AttemptOutcome::Conflict) => Some(&self.conflicts),
            None => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.active.fetch_sub(1, Ordering::SeqCst) - 1
    }
}

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop claiming jobs and wait for every in-flight attempt to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Worker dispatcher panicked");
        }
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Pool of symmetric workers claiming jobs from the store.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    executor: Arc<SubmissionExecutor>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<SubmissionExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Start the dispatcher, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run(shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut tasks = JoinSet::new();

        tracing::info!(
            worker = %self.config.name,
            concurrency = self.config.concurrency,
            "Worker pool started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(joined);
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.store.claim_next_waiting().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    if idle(&mut shutdown_rx, poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    e.log();
                    drop(permit);
                    if idle(&mut shutdown_rx, poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            let executor = self.executor.clone();
            let stats = self.stats.clone();
            let name = self.config.name.clone();
            tasks.spawn(async move {
                QueueMetrics::set_active(&name, stats.begin());
                let outcome = executor.execute(job).await.ok();
                QueueMetrics::set_active(&name, stats.finish(outcome));
                drop(permit);
            });
        }

        tracing::info!(
            worker = %self.config.name,
            in_flight = tasks.len(),
            "Worker pool draining"
        );
        while let Some(joined) = tasks.join_next().await {
            self.reap(joined);
        }
        tracing::info!(worker = %self.config.name, "Worker pool stopped");
    }

    fn reap(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            tracing::error!(worker = %self.config.name, error = %e, "Job task panicked");
        }
    }
}

/// Sleep for one poll interval. Returns true when shutdown was requested.
async fn idle(shutdown_rx: &mut watch::Receiver<bool>, poll_interval: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => true,
        _ = tokio::time::sleep(poll_interval) => *shutdown_rx.borrow(),
    }
}
