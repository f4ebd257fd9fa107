//! Job store contract and the in-memory implementation.
//!
//! The store is the single source of truth for job state. Every mutation is a
//! compare-and-swap on `state`: a caller that receives
//! [`Transition::Conflict`] lost a race and must drop its local work for that
//! job without side effects.
//!
//! Retention caps are enforced by the terminal transition itself: a patch
//! carrying a [`retention_cap`](JobPatch::retention_cap) evicts the oldest
//! members of the destination list in the same atomic step, so no reader
//! ever sees a list above its cap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

use super::job::{Job, JobId, JobPatch, JobState};
use crate::config::QueueConfig;
use crate::error::{Result, SubmitqError};
use crate::telemetry::QueueMetrics;

/// Result of a compare-and-swap transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The job was in the expected state and has moved
    Applied,
    /// Another actor moved the job first
    Conflict,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Retention caps for the terminal lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionLimits {
    pub max_completed: usize,
    pub max_failed: usize,
}

impl RetentionLimits {
    pub fn cap_for(&self, state: JobState) -> Option<usize> {
        match state {
            JobState::Completed => Some(self.max_completed),
            JobState::Failed => Some(self.max_failed),
            _ => None,
        }
    }
}

impl From<&QueueConfig> for RetentionLimits {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_completed: config.max_completed_retained,
            max_failed: config.max_failed_retained,
        }
    }
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Trait for job store backends.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `waiting` job.
    async fn create(&self, job: Job) -> Result<JobId>;

    /// Atomically take the oldest waiting job, mark it `active` and stamp
    /// `claimed_at`.
    async fn claim_next_waiting(&self) -> Result<Option<Job>>;

    /// Move a job from `expected` to `next`, applying `patch`, if and only if
    /// it is still in `expected` (and still held by `patch.expected_claim`,
    /// when set). A terminal transition with `patch.retention_cap` evicts the
    /// oldest members of the destination list beyond the cap in the same step.
    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        patch: JobPatch,
    ) -> Result<Transition>;

    /// Ids of delayed jobs whose `next_run_at` is at or before `now`.
    async fn list_delayed_due(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    /// Active jobs claimed at or before `claimed_before`, oldest claim first.
    async fn list_stalled(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Fetch a job.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Page through a retention list (`completed` or `failed`), newest first.
    async fn list_retained(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>>;

    /// Delete the oldest members of a retention list until at most `cap`
    /// remain. Returns the number evicted. Terminal transitions already keep
    /// the lists capped; this re-applies a cap that was lowered.
    async fn trim_retained(&self, state: JobState, cap: usize) -> Result<usize>;

    /// Current number of jobs per state.
    async fn counts(&self) -> Result<JobCounts>;
}

pub(crate) fn ensure_retained(state: JobState) -> Result<()> {
    if state.is_terminal() {
        Ok(())
    } else {
        Err(SubmitqError::validation(format!(
            "{} is not a retention list",
            state
        )))
    }
}

/// Whether the stored job is still held by the claim the patch expects.
fn holds_claim(stored: &Job, patch: &JobPatch) -> bool {
    patch
        .expected_claim
        .map_or(true, |claim| stored.claimed_at == Some(claim))
}

/// Terminal transitions always carry a finish time, which orders the
/// retention lists.
pub(crate) fn stamp_finished(next: JobState, mut patch: JobPatch) -> JobPatch {
    if next.is_terminal() && patch.finished_at.is_none() {
        patch.finished_at = Some(Utc::now());
    }
    patch
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    completed: BTreeSet<(DateTime<Utc>, JobId)>,
    failed: BTreeSet<(DateTime<Utc>, JobId)>,
}

impl Inner {
    fn retention_mut(&mut self, state: JobState) -> Option<&mut BTreeSet<(DateTime<Utc>, JobId)>> {
        match state {
            JobState::Completed => Some(&mut self.completed),
            JobState::Failed => Some(&mut self.failed),
            _ => None,
        }
    }

    fn retention(&self, state: JobState) -> Option<&BTreeSet<(DateTime<Utc>, JobId)>> {
        match state {
            JobState::Completed => Some(&self.completed),
            JobState::Failed => Some(&self.failed),
            _ => None,
        }
    }

    fn index(&mut self, job: &Job) {
        match job.state {
            JobState::Waiting => self.waiting.push_back(job.id),
            JobState::Completed | JobState::Failed => {
                let finished_at = job.finished_at.unwrap_or(job.created_at);
                if let Some(list) = self.retention_mut(job.state) {
                    list.insert((finished_at, job.id));
                }
            }
            JobState::Active | JobState::Delayed => {}
        }
    }

    fn unindex(&mut self, job: &Job) {
        if job.state == JobState::Waiting {
            self.waiting.retain(|id| *id != job.id);
        }
    }

    /// Drop the oldest members of a retention list beyond `cap`.
    fn evict(&mut self, state: JobState, cap: usize) -> usize {
        let mut evicted = Vec::new();
        if let Some(list) = self.retention_mut(state) {
            while list.len() > cap {
                match list.pop_first() {
                    Some((_, id)) => evicted.push(id),
                    None => break,
                }
            }
        }
        for id in &evicted {
            self.jobs.remove(id);
        }
        evicted.len()
    }
}

/// In-memory job store for tests and single-process deployments.
///
/// One mutex guards the whole store, so each operation is trivially atomic.
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<JobId> {
        if job.state != JobState::Waiting {
            return Err(SubmitqError::validation(format!(
                "New jobs must be waiting, got {}",
                job.state
            )));
        }
        let id = job.id;
        let mut inner = self.inner.lock();
        inner.index(&job);
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn claim_next_waiting(&self) -> Result<Option<Job>> {
        let mut inner = self.inner.lock();
        while let Some(id) = inner.waiting.pop_front() {
            if let Some(job) = inner.jobs.get_mut(&id) {
                if job.state == JobState::Waiting {
                    job.state = JobState::Active;
                    job.claimed_at = Some(Utc::now());
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        patch: JobPatch,
    ) -> Result<Transition> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.jobs.get(&id) else {
            return Err(SubmitqError::job_not_found(id));
        };
        if current.state != expected || !holds_claim(current, &patch) {
            return Ok(Transition::Conflict);
        }
        current.check_transition(next, &patch)?;
        let patch = stamp_finished(next, patch);
        let cap = patch.retention_cap.filter(|_| next.is_terminal());

        let mut job = current.clone();
        inner.unindex(&job);
        job.apply(next, patch);
        if next == JobState::Active {
            job.claimed_at = Some(Utc::now());
        }
        inner.index(&job);
        inner.jobs.insert(id, job);

        if let Some(cap) = cap {
            let evicted = inner.evict(next, cap);
            if evicted > 0 {
                QueueMetrics::record_evicted(next.as_str(), evicted);
            }
        }
        Ok(Transition::Applied)
    }

    async fn list_delayed_due(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let inner = self.inner.lock();
        let mut due: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Delayed)
            .filter_map(|job| job.next_run_at.filter(|at| *at <= now).map(|at| (at, job.id)))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn list_stalled(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock();
        let mut stalled: Vec<&Job> = inner
            .jobs
            .values()
            .filter(|job| job.state == JobState::Active)
            .filter(|job| job.claimed_at.is_some_and(|at| at <= claimed_before))
            .collect();
        stalled.sort_by_key(|job| job.claimed_at);
        Ok(stalled.into_iter().cloned().collect())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn list_retained(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>> {
        ensure_retained(state)?;
        let inner = self.inner.lock();
        let Some(list) = inner.retention(state) else {
            return Ok(Vec::new());
        };
        Ok(list
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|(_, id)| inner.jobs.get(id).cloned())
            .collect())
    }

    async fn trim_retained(&self, state: JobState, cap: usize) -> Result<usize> {
        ensure_retained(state)?;
        let evicted = self.inner.lock().evict(state, cap);
        if evicted > 0 {
            QueueMetrics::record_evicted(state.as_str(), evicted);
        }
        Ok(evicted)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let inner = self.inner.lock();
        let mut counts = JobCounts::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobError, JobOptions, SubmitRequest};
    use chrono::Duration;
    use std::sync::Arc;

    fn job(operation: &str) -> Job {
        Job::new(
            SubmitRequest::new(operation, ["a"], "Org1MSP"),
            JobOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_marks_active() {
        let store = InMemoryJobStore::new();
        let first = store.create(job("first")).await.unwrap();
        let second = store.create(job("second")).await.unwrap();

        let claimed = store.claim_next_waiting().await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(store.get(first).await.unwrap().unwrap().state, JobState::Active);

        let claimed = store.claim_next_waiting().await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert!(store.claim_next_waiting().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_conflict_on_wrong_state() {
        let store = InMemoryJobStore::new();
        let id = store.create(job("op")).await.unwrap();

        let outcome = store
            .transition(id, JobState::Delayed, JobState::Waiting, JobPatch::new())
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Conflict);
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_lifecycle_move() {
        let store = InMemoryJobStore::new();
        let id = store.create(job("op")).await.unwrap();

        let result = store
            .transition(id, JobState::Waiting, JobState::Completed, JobPatch::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_delayed_due_orders_by_next_run() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let late = store.create(job("late")).await.unwrap();
        let early = store.create(job("early")).await.unwrap();
        let future = store.create(job("future")).await.unwrap();

        for (id, at) in [
            (late, now - Duration::milliseconds(10)),
            (early, now - Duration::milliseconds(500)),
            (future, now + Duration::seconds(60)),
        ] {
            store.claim_next_waiting().await.unwrap();
            let patch = JobPatch::new()
                .attempts_made(1)
                .next_run_at(at)
                .last_error(JobError::transient("timeout"));
            store
                .transition(id, JobState::Active, JobState::Delayed, patch)
                .await
                .unwrap();
        }

        assert_eq!(store.list_delayed_due(now).await.unwrap(), vec![early, late]);
    }

    #[tokio::test]
    async fn test_trim_evicts_oldest_finished() {
        let store = InMemoryJobStore::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for offset in [30, 10, 20] {
            let id = store.create(job("op")).await.unwrap();
            store.claim_next_waiting().await.unwrap();
            let patch = JobPatch::new()
                .attempts_made(1)
                .result("ok")
                .finished_at(base + Duration::milliseconds(offset));
            store
                .transition(id, JobState::Active, JobState::Completed, patch)
                .await
                .unwrap();
            ids.push(id);
        }

        assert_eq!(store.trim_retained(JobState::Completed, 2).await.unwrap(), 1);
        // finished at +10ms is the oldest
        assert!(store.get(ids[1]).await.unwrap().is_none());

        let retained = store.list_retained(JobState::Completed, 10, 0).await.unwrap();
        let retained: Vec<JobId> = retained.iter().map(|j| j.id).collect();
        assert_eq!(retained, vec![ids[0], ids[2]]);

        assert!(store.list_retained(JobState::Waiting, 10, 0).await.is_err());
    }

    async fn complete(store: &InMemoryJobStore, cap: usize) -> JobId {
        let id = store.create(job("op")).await.unwrap();
        let claimed = store.claim_next_waiting().await.unwrap().unwrap();
        let patch = JobPatch::new()
            .attempts_made(1)
            .result("ok")
            .expect_claim(claimed.claimed_at)
            .retain_at_most(Some(cap));
        store
            .transition(id, JobState::Active, JobState::Completed, patch)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_terminal_transition_evicts_in_the_same_step() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(complete(&store, 2).await);
            assert!(store.counts().await.unwrap().completed <= 2);
        }

        let retained: Vec<JobId> = store
            .list_retained(JobState::Completed, 10, 0)
            .await
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(retained, vec![ids[4], ids[3]]);
        assert!(store.get(ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_list_capped_independently() {
        let store = InMemoryJobStore::new();
        complete(&store, 5).await;
        let mut failed = Vec::new();
        for _ in 0..3 {
            let id = store.create(job("op")).await.unwrap();
            store.claim_next_waiting().await.unwrap();
            let patch = JobPatch::new()
                .attempts_made(1)
                .last_error(JobError::permanent("rejected"))
                .retain_at_most(Some(1));
            store
                .transition(id, JobState::Active, JobState::Failed, patch)
                .await
                .unwrap();
            failed.push(id);
        }

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.completed, 1);
        let retained = store.list_retained(JobState::Failed, 10, 0).await.unwrap();
        assert_eq!(retained[0].id, failed[2]);
    }

    #[tokio::test]
    async fn test_stale_claim_conflicts() {
        let store = InMemoryJobStore::new();
        let id = store.create(job("op")).await.unwrap();
        let claimed = store.claim_next_waiting().await.unwrap().unwrap();
        assert!(claimed.claimed_at.is_some());

        let stale = claimed.claimed_at.unwrap() - Duration::seconds(1);
        let outcome = store
            .transition(
                id,
                JobState::Active,
                JobState::Completed,
                JobPatch::new().attempts_made(1).result("ok").expect_claim(Some(stale)),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Conflict);
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn test_list_stalled_only_returns_old_claims() {
        let store = InMemoryJobStore::new();
        let old = store.create(job("old")).await.unwrap();
        store.claim_next_waiting().await.unwrap();
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.create(job("fresh")).await.unwrap();
        store.claim_next_waiting().await.unwrap();
        store.create(job("waiting")).await.unwrap();

        let stalled = store.list_stalled(cutoff).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, old);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_job() {
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..50 {
            store.create(job("op")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next_waiting().await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: BTreeSet<JobId> = all.iter().copied().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
        assert_eq!(store.counts().await.unwrap().active, 50);
    }
}
