//! Submission executor: one attempt of one claimed job.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use super::backoff::BackoffPolicy;
use super::gateway::LedgerGateway;
use super::job::{ErrorClass, Job, JobError, JobPatch, JobState};
use super::store::{JobStore, RetentionLimits, Transition};
use crate::error::{Result, SubmitqError};
use crate::telemetry::QueueMetrics;

/// Retry delays beyond this are clamped so `next_run_at` stays a valid
/// timestamp.
const MAX_RETRY_DELAY_DAYS: i64 = 36_500;

/// Store writes tried per outcome before the job is left to stall recovery.
const COMMIT_ATTEMPTS: u32 = 5;

/// First pause between commit tries, doubling after each.
const COMMIT_BACKOFF_MS: u64 = 50;

/// What one attempt did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The ledger accepted the operation
    Completed,
    /// Transient failure, job moved to `delayed`
    Retrying { delay: Duration },
    /// Job moved to `failed`
    Failed { class: ErrorClass },
    /// Another actor moved the job first; nothing was recorded
    Conflict,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Conflict => "conflict",
        }
    }
}

/// Runs one gateway invocation for a claimed job and records the outcome.
pub struct SubmissionExecutor {
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn LedgerGateway>,
    retention: RetentionLimits,
}

impl SubmissionExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        gateway: Arc<dyn LedgerGateway>,
        retention: RetentionLimits,
    ) -> Self {
        Self {
            store,
            gateway,
            retention,
        }
    }

    /// Attempt a job the caller has claimed (`state == active`).
    ///
    /// Exactly one state transition is written. Retryable store errors are
    /// retried a few times; `Err` means every try failed and the job was left
    /// `active` for the scheduler's stall recovery.
    pub async fn execute(&self, job: Job) -> Result<AttemptOutcome> {
        if job.state != JobState::Active {
            return Err(SubmitqError::validation(format!(
                "Job {} must be active to execute, got {}",
                job.id, job.state
            )));
        }

        let attempt = job.attempts_made.saturating_add(1);
        let span = info_span!(
            "submit_job",
            job_id = %job.id,
            operation = %job.operation_name,
            attempt,
            max_attempts = job.max_attempts,
        );
        self.attempt(job, attempt).instrument(span).await
    }

    async fn attempt(&self, job: Job, attempt: u32) -> Result<AttemptOutcome> {
        if !job.has_attempts_left() {
            warn!("Claimed job has no attempts left, failing without invoking");
            let error = JobError::permanent(format!(
                "Attempt budget of {} exhausted",
                job.max_attempts
            ));
            let patch = JobPatch::new().last_error(error).finished_at(Utc::now());
            let outcome = AttemptOutcome::Failed {
                class: ErrorClass::Permanent,
            };
            return self.commit(&job, JobState::Failed, patch, outcome).await;
        }

        let started = Instant::now();
        let invocation = self
            .gateway
            .invoke(&job.operation_name, &job.arguments, &job.organization_identity)
            .await;
        let elapsed = started.elapsed().as_secs_f64();
        let now = Utc::now();

        let (next, patch, outcome) = match invocation {
            Ok(invocation) => {
                let mut transaction_ids = job.transaction_ids.clone();
                transaction_ids.extend(invocation.transaction_id);
                let patch = JobPatch::new()
                    .attempts_made(attempt)
                    .result(invocation.payload)
                    .transaction_ids(transaction_ids)
                    .finished_at(now);
                (JobState::Completed, patch, AttemptOutcome::Completed)
            }
            Err(error) => {
                let mut transaction_ids = job.transaction_ids.clone();
                transaction_ids.extend(error.transaction_id.clone());
                let error: JobError = error.into();
                let class = error.class;
                if error.is_retryable() && attempt < job.max_attempts {
                    let delay = job.backoff().delay_for_attempt(attempt);
                    debug!(error = %error, delay_ms = delay.as_millis() as u64, "Attempt failed, retrying");
                    let patch = JobPatch::new()
                        .attempts_made(attempt)
                        .next_run_at(retry_at(now, delay))
                        .last_error(error)
                        .transaction_ids(transaction_ids);
                    (JobState::Delayed, patch, AttemptOutcome::Retrying { delay })
                } else {
                    warn!(error = %error, "Attempt failed, giving up");
                    let patch = JobPatch::new()
                        .attempts_made(attempt)
                        .last_error(error)
                        .transaction_ids(transaction_ids)
                        .finished_at(now);
                    (JobState::Failed, patch, AttemptOutcome::Failed { class })
                }
            }
        };

        QueueMetrics::record_attempt(&job.operation_name, outcome.as_str(), elapsed);
        self.commit(&job, next, patch, outcome).await
    }

    async fn commit(
        &self,
        job: &Job,
        next: JobState,
        patch: JobPatch,
        outcome: AttemptOutcome,
    ) -> Result<AttemptOutcome> {
        let patch = patch
            .expect_claim(job.claimed_at)
            .retain_at_most(self.retention.cap_for(next));
        let pause = BackoffPolicy::exponential(COMMIT_BACKOFF_MS);

        let mut tries = 0;
        let transition = loop {
            tries += 1;
            match self
                .store
                .transition(job.id, JobState::Active, next, patch.clone())
                .await
            {
                Ok(transition) => break transition,
                Err(e) if e.is_retryable() && tries < COMMIT_ATTEMPTS => {
                    let delay = pause.delay_for_attempt(tries);
                    warn!(
                        error = %e,
                        tries,
                        delay_ms = delay.as_millis() as u64,
                        "Recording attempt outcome failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    e.log();
                    return Err(e);
                }
            }
        };

        match transition {
            // after a lost reply the retried write finds the job already moved
            Transition::Conflict => {
                QueueMetrics::record_conflict("executor");
                warn!("Job moved by another actor, dropping attempt outcome");
                Ok(AttemptOutcome::Conflict)
            }
            Transition::Applied => {
                if next.is_terminal() {
                    info!(state = %next, "Job finished");
                }
                Ok(outcome)
            }
        }
    }
}

pub(crate) fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let ceiling = chrono::Duration::days(MAX_RETRY_DELAY_DAYS);
    let delay = chrono::Duration::from_std(delay)
        .unwrap_or(ceiling)
        .min(ceiling);
    now + delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::gateway::{GatewayError, Invocation};
    use crate::jobs::{BackoffPolicy, InMemoryJobStore, JobOptions, SubmitRequest};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedGateway {
        replies: Mutex<VecDeque<std::result::Result<Invocation, GatewayError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedGateway {
        fn new(replies: Vec<std::result::Result<Invocation, GatewayError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl LedgerGateway for ScriptedGateway {
        async fn invoke(
            &self,
            _operation: &str,
            _arguments: &[String],
            _identity: &str,
        ) -> std::result::Result<Invocation, GatewayError> {
            *self.calls.lock() += 1;
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::permanent("no scripted reply")))
        }
    }

    fn ok(tx: &str) -> std::result::Result<Invocation, GatewayError> {
        Ok(Invocation {
            transaction_id: Some(tx.to_string()),
            payload: "done".to_string(),
        })
    }

    async fn claimed(store: &InMemoryJobStore, options: JobOptions) -> Job {
        store
            .create(Job::new(
                SubmitRequest::new("CreateAsset", ["asset1"], "Org1MSP"),
                options,
            ))
            .await
            .unwrap();
        store.claim_next_waiting().await.unwrap().unwrap()
    }

    fn executor(
        store: Arc<InMemoryJobStore>,
        gateway: Arc<ScriptedGateway>,
        retention: RetentionLimits,
    ) -> SubmissionExecutor {
        SubmissionExecutor::new(store, gateway, retention)
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![ok("tx-1")]);
        let executor = executor(store.clone(), gateway, RetentionLimits::default());

        let job = claimed(&store, JobOptions::default()).await;
        let outcome = executor.execute(job.clone()).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Completed);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts_made, 1);
        assert_eq!(stored.result.as_deref(), Some("done"));
        assert_eq!(stored.transaction_ids, vec!["tx-1"]);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_error_delays_with_backoff() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![Err(
            GatewayError::transient("commit timeout").with_transaction_id("tx-0"),
        )]);
        let executor = executor(store.clone(), gateway, RetentionLimits::default());

        let options = JobOptions {
            max_attempts: 3,
            backoff: BackoffPolicy::exponential(200),
        };
        let job = claimed(&store, options).await;
        let before = Utc::now();
        let outcome = executor.execute(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Retrying {
                delay: Duration::from_millis(200)
            }
        );

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert_eq!(stored.attempts_made, 1);
        assert!(stored.next_run_at.unwrap() >= before + chrono::Duration::milliseconds(200));
        assert_eq!(stored.transaction_ids, vec!["tx-0"]);
        assert_eq!(stored.last_error.unwrap().class, ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![Err(GatewayError::permanent("asset exists"))]);
        let executor = executor(store.clone(), gateway, RetentionLimits::default());

        let job = claimed(&store, JobOptions::default()).await;
        let outcome = executor.execute(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Failed {
                class: ErrorClass::Permanent
            }
        );

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts_made, 1);
        assert!(stored.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_last_transient_attempt_fails() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![Err(GatewayError::transient("unavailable"))]);
        let executor = executor(store.clone(), gateway, RetentionLimits::default());

        let options = JobOptions {
            max_attempts: 1,
            backoff: BackoffPolicy::fixed(10),
        };
        let job = claimed(&store, options).await;
        let outcome = executor.execute(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Failed {
                class: ErrorClass::Transient
            }
        );
        assert_eq!(store.get(job.id).await.unwrap().unwrap().attempts_made, 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_without_invoking() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![ok("tx-1")]);
        let executor = executor(store.clone(), gateway.clone(), RetentionLimits::default());

        let mut job = claimed(&store, JobOptions::default()).await;
        job.attempts_made = job.max_attempts;
        let outcome = executor.execute(job).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Failed { .. }));
        assert_eq!(*gateway.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_conflict_when_job_moved() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![ok("tx-1")]);
        let executor = executor(store.clone(), gateway, RetentionLimits::default());

        let job = claimed(&store, JobOptions::default()).await;
        store
            .transition(
                job.id,
                JobState::Active,
                JobState::Failed,
                JobPatch::new().last_error(JobError::permanent("cancelled")),
            )
            .await
            .unwrap();

        let outcome = executor.execute(job.clone()).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Conflict);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_terminal_transition_trims_retention() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![ok("a"), ok("b"), ok("c")]);
        let retention = RetentionLimits {
            max_completed: 2,
            max_failed: 2,
        };
        let executor = executor(store.clone(), gateway, retention);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = claimed(&store, JobOptions::default()).await;
            ids.push(job.id);
            executor.execute(job).await.unwrap();
        }

        assert_eq!(store.counts().await.unwrap().completed, 2);
        assert!(store.get(ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_jobs_respect_their_own_cap() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![
            Err(GatewayError::permanent("asset exists")),
            Err(GatewayError::permanent("asset exists")),
            Err(GatewayError::permanent("asset exists")),
            ok("tx-1"),
        ]);
        let retention = RetentionLimits {
            max_completed: 5,
            max_failed: 2,
        };
        let executor = executor(store.clone(), gateway, retention);

        let mut failed = Vec::new();
        for _ in 0..3 {
            let job = claimed(&store, JobOptions::default()).await;
            failed.push(job.id);
            executor.execute(job).await.unwrap();
            assert!(store.counts().await.unwrap().failed <= 2);
        }
        let job = claimed(&store, JobOptions::default()).await;
        executor.execute(job).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.completed, 1);
        assert!(store.get(failed[0]).await.unwrap().is_none());
    }

    /// Store whose first `failures` transitions fail with a retryable error.
    struct FlakyStore {
        inner: InMemoryJobStore,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn create(&self, job: Job) -> Result<crate::jobs::JobId> {
            self.inner.create(job).await
        }

        async fn claim_next_waiting(&self) -> Result<Option<Job>> {
            self.inner.claim_next_waiting().await
        }

        async fn transition(
            &self,
            id: crate::jobs::JobId,
            expected: JobState,
            next: JobState,
            patch: JobPatch,
        ) -> Result<Transition> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SubmitqError::new(
                        crate::error::ErrorCode::StoreConnectionFailed,
                        "connection reset",
                    ));
                }
            }
            self.inner.transition(id, expected, next, patch).await
        }

        async fn list_delayed_due(&self, now: DateTime<Utc>) -> Result<Vec<crate::jobs::JobId>> {
            self.inner.list_delayed_due(now).await
        }

        async fn list_stalled(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>> {
            self.inner.list_stalled(claimed_before).await
        }

        async fn get(&self, id: crate::jobs::JobId) -> Result<Option<Job>> {
            self.inner.get(id).await
        }

        async fn list_retained(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>> {
            self.inner.list_retained(state, limit, offset).await
        }

        async fn trim_retained(&self, state: JobState, cap: usize) -> Result<usize> {
            self.inner.trim_retained(state, cap).await
        }

        async fn counts(&self) -> Result<crate::jobs::JobCounts> {
            self.inner.counts().await
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: InMemoryJobStore::new(),
            failures: Mutex::new(failures),
        })
    }

    #[tokio::test]
    async fn test_store_failure_while_recording_is_retried() {
        let store = flaky(2);
        let gateway = ScriptedGateway::new(vec![ok("tx-1")]);
        let executor =
            SubmissionExecutor::new(store.clone(), gateway.clone(), RetentionLimits::default());

        let job = claimed(&store.inner, JobOptions::default()).await;
        let outcome = executor.execute(job.clone()).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Completed);
        assert_eq!(*gateway.calls.lock(), 1);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_persistent_store_failure_leaves_job_active() {
        let store = flaky(COMMIT_ATTEMPTS);
        let gateway = ScriptedGateway::new(vec![ok("tx-1")]);
        let executor = SubmissionExecutor::new(store.clone(), gateway, RetentionLimits::default());

        let job = claimed(&store.inner, JobOptions::default()).await;
        let err = executor.execute(job.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn test_outcome_of_a_superseded_claim_is_dropped() {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = ScriptedGateway::new(vec![ok("tx-1")]);
        let executor = executor(store.clone(), gateway, RetentionLimits::default());

        let mut job = claimed(&store, JobOptions::default()).await;
        job.claimed_at = job.claimed_at.map(|at| at - chrono::Duration::seconds(30));

        let outcome = executor.execute(job.clone()).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Conflict);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().state, JobState::Active);
    }

    #[test]
    fn test_retry_at_clamps_huge_delay() {
        let now = Utc::now();
        let at = retry_at(now, Duration::from_millis(u64::MAX));
        assert_eq!(at, now + chrono::Duration::days(MAX_RETRY_DELAY_DAYS));
    }
}
