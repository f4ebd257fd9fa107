//! Scheduler promoting due delayed jobs back to `waiting`.
//!
//! Any number of schedulers may run against one store. Each promotion is a
//! compare-and-swap, so a job is promoted by exactly one of them and the
//! others see a conflict and move on.
//!
//! With stall recovery enabled the scheduler also releases `active` jobs whose
//! claim is older than the stall timeout (a crashed worker, or one that could
//! not record its outcome). The lost attempt counts against the budget: the
//! job is delayed like a transient failure, or failed once the budget is
//! spent. The recovery write is guarded by the stalled claim, so a worker that
//! reports late gets a conflict instead of overwriting it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::executor::retry_at;
use super::job::{Job, JobError, JobPatch, JobState};
use super::store::{JobStore, RetentionLimits, Transition};
use crate::error::Result;
use crate::telemetry::QueueMetrics;

/// Periodic promoter of delayed jobs.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    interval: Duration,
    recovery: Option<StallRecovery>,
}

#[derive(Debug, Clone, Copy)]
struct StallRecovery {
    timeout: Duration,
    retention: RetentionLimits,
}

/// Handle for a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop scanning. An in-progress scan finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Scheduler task panicked");
        }
    }
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            recovery: None,
        }
    }

    /// Also recover `active` jobs claimed longer than `timeout` ago.
    ///
    /// `timeout` must exceed the longest a healthy attempt can take.
    pub fn with_stall_recovery(mut self, timeout: Duration, retention: RetentionLimits) -> Self {
        self.recovery = Some(StallRecovery { timeout, retention });
        self
    }

    /// Promote every delayed job whose `next_run_at` has passed.
    ///
    /// Returns how many jobs this scheduler moved to `waiting`.
    pub async fn promote_due(&self) -> Result<usize> {
        let due = self.store.list_delayed_due(Utc::now()).await?;
        let mut promoted = 0;

        for id in due {
            match self
                .store
                .transition(id, JobState::Delayed, JobState::Waiting, JobPatch::new())
                .await
            {
                Ok(Transition::Applied) => promoted += 1,
                Ok(Transition::Conflict) => {
                    QueueMetrics::record_conflict("scheduler");
                    tracing::debug!(job_id = %id, "Job already promoted");
                }
                Err(e) => e.log(),
            }
        }

        if promoted > 0 {
            QueueMetrics::record_promoted(promoted);
            tracing::debug!(promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Release stalled `active` jobs. Returns how many this scheduler moved.
    pub async fn recover_stalled(&self) -> Result<usize> {
        let Some(recovery) = self.recovery else {
            return Ok(0);
        };
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(recovery.timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stalled = self.store.list_stalled(cutoff).await?;
        let mut recovered = 0;

        for job in stalled {
            let (next, patch) = stalled_outcome(&job, recovery, now);
            match self
                .store
                .transition(job.id, JobState::Active, next, patch)
                .await
            {
                Ok(Transition::Applied) => {
                    recovered += 1;
                    tracing::warn!(
                        job_id = %job.id,
                        claimed_at = ?job.claimed_at,
                        state = %next,
                        "Recovered stalled job"
                    );
                }
                Ok(Transition::Conflict) => {
                    QueueMetrics::record_conflict("recovery");
                    tracing::debug!(job_id = %job.id, "Stalled job already moved");
                }
                Err(e) => e.log(),
            }
        }

        if recovered > 0 {
            QueueMetrics::record_recovered(recovered);
        }
        Ok(recovered)
    }

    /// Start scanning every interval until shut down.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                interval_ms = self.interval.as_millis() as u64,
                stall_timeout_ms = self.recovery.map(|r| r.timeout.as_millis() as u64),
                "Job scheduler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.promote_due().await {
                            e.log();
                        }
                        if let Err(e) = self.recover_stalled().await {
                            e.log();
                        }
                    }
                }
            }

            tracing::info!("Job scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Transition releasing a stalled job, charging it the lost attempt.
fn stalled_outcome(job: &Job, recovery: StallRecovery, now: DateTime<Utc>) -> (JobState, JobPatch) {
    let attempt = job.attempts_made.saturating_add(1).min(job.max_attempts);
    let error = JobError::transient(format!(
        "No attempt outcome recorded within {}ms of claim",
        recovery.timeout.as_millis()
    ));

    let (next, patch) = if attempt < job.max_attempts {
        let delay = job.backoff().delay_for_attempt(attempt);
        let patch = JobPatch::new()
            .attempts_made(attempt)
            .next_run_at(retry_at(now, delay))
            .last_error(error);
        (JobState::Delayed, patch)
    } else {
        let patch = JobPatch::new()
            .attempts_made(attempt)
            .last_error(error)
            .finished_at(now)
            .retain_at_most(recovery.retention.cap_for(JobState::Failed));
        (JobState::Failed, patch)
    };
    (next, patch.expect_claim(job.claimed_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, Job, JobError, JobOptions, SubmitRequest};

    async fn delayed(store: &InMemoryJobStore, offset_ms: i64) -> crate::jobs::JobId {
        let id = store
            .create(Job::new(
                SubmitRequest::new("UpdateAsset", ["asset1"], "Org1MSP"),
                JobOptions::default(),
            ))
            .await
            .unwrap();
        store.claim_next_waiting().await.unwrap();
        let patch = JobPatch::new()
            .attempts_made(1)
            .next_run_at(Utc::now() + chrono::Duration::milliseconds(offset_ms))
            .last_error(JobError::transient("timeout"));
        store
            .transition(id, JobState::Active, JobState::Delayed, patch)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_promote_only_due_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let due = delayed(&store, -50).await;
        let later = delayed(&store, 60_000).await;

        let scheduler = JobScheduler::new(store.clone(), Duration::from_millis(10));
        assert_eq!(scheduler.promote_due().await.unwrap(), 1);

        let job = store.get(due).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert!(job.next_run_at.is_none());
        assert_eq!(job.attempts_made, 1);
        assert_eq!(store.get(later).await.unwrap().unwrap().state, JobState::Delayed);

        assert_eq!(scheduler.promote_due().await.unwrap(), 0);
    }

    async fn stalled(store: &InMemoryJobStore, max_attempts: u32) -> Job {
        store
            .create(Job::new(
                SubmitRequest::new("UpdateAsset", ["asset1"], "Org1MSP"),
                JobOptions {
                    max_attempts,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        store.claim_next_waiting().await.unwrap().unwrap()
    }

    fn recovering(store: Arc<InMemoryJobStore>, timeout_ms: u64) -> JobScheduler {
        JobScheduler::new(store, Duration::from_millis(10))
            .with_stall_recovery(Duration::from_millis(timeout_ms), RetentionLimits::default())
    }

    #[tokio::test]
    async fn test_stalled_job_is_delayed_and_charged_an_attempt() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = stalled(&store, 3).await;
        let scheduler = recovering(store.clone(), 20);

        assert_eq!(scheduler.recover_stalled().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(scheduler.recover_stalled().await.unwrap(), 1);

        let recovered = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(recovered.state, JobState::Delayed);
        assert_eq!(recovered.attempts_made, 1);
        assert!(recovered.next_run_at.is_some());
        assert_eq!(recovered.last_error.unwrap().class, crate::jobs::ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_stalled_job_on_last_attempt_fails() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = stalled(&store, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(recovering(store.clone(), 10).recover_stalled().await.unwrap(), 1);
        let recovered = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(recovered.state, JobState::Failed);
        assert_eq!(recovered.attempts_made, 1);
        assert!(recovered.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_late_worker_cannot_overwrite_recovery() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = stalled(&store, 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        recovering(store.clone(), 10).recover_stalled().await.unwrap();

        // promoted and claimed again by another worker
        store
            .transition(job.id, JobState::Delayed, JobState::Waiting, JobPatch::new())
            .await
            .unwrap();
        let reclaimed = store.claim_next_waiting().await.unwrap().unwrap();
        assert_ne!(reclaimed.claimed_at, job.claimed_at);

        let late = JobPatch::new()
            .attempts_made(2)
            .result("ok")
            .expect_claim(job.claimed_at);
        let outcome = store
            .transition(job.id, JobState::Active, JobState::Completed, late)
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Conflict);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn test_recovery_disabled_by_default() {
        let store = Arc::new(InMemoryJobStore::new());
        stalled(&store, 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let scheduler = JobScheduler::new(store.clone(), Duration::from_millis(10));
        assert_eq!(scheduler.recover_stalled().await.unwrap(), 0);
        assert_eq!(store.counts().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_started_scheduler_promotes_and_stops() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = delayed(&store, 20).await;

        let handle = JobScheduler::new(store.clone(), Duration::from_millis(10)).start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.shutdown().await;

        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Waiting);
    }
}
