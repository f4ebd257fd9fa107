//! Queue facade used by request handlers.
//!
//! `submit` only records the job; the caller gets its id back immediately and
//! learns the outcome later through `status`.

use std::sync::Arc;
use tracing::{info, instrument};

use super::job::{Job, JobId, JobOptions, JobState, SubmitRequest};
use super::store::{InMemoryJobStore, JobCounts, JobStore};
use crate::config::QueueConfig;
use crate::error::{Result, SubmitqError};
use crate::telemetry::QueueMetrics;

/// Submission queue.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    options: JobOptions,
}

impl JobQueue {
    /// Create a queue over an existing store.
    pub fn new(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            options: JobOptions::from(config),
        }
    }

    /// Create a queue over a fresh in-memory store.
    pub fn in_memory(config: &QueueConfig) -> Self {
        Self::new(Arc::new(InMemoryJobStore::new()), config)
    }

    /// The underlying store, shared with workers and schedulers.
    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Options stamped onto every new job.
    pub fn options(&self) -> JobOptions {
        self.options
    }

    /// Enqueue a submission and return its id.
    #[instrument(skip(self, request), fields(operation = %request.operation_name))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId> {
        if request.operation_name.trim().is_empty() {
            return Err(SubmitqError::validation("Operation name must not be empty"));
        }

        let operation = request.operation_name.clone();
        let id = self.store.create(Job::new(request, self.options)).await?;

        QueueMetrics::record_submitted(&operation);
        info!(job_id = %id, "Submit job enqueued");
        Ok(id)
    }

    /// Current record of a job, or `None` if unknown or evicted.
    pub async fn status(&self, id: JobId) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    /// Retained completed jobs, newest first.
    pub async fn list_completed(&self, limit: usize, offset: usize) -> Result<Vec<Job>> {
        self.store.list_retained(JobState::Completed, limit, offset).await
    }

    /// Retained failed jobs, newest first.
    pub async fn list_failed(&self, limit: usize, offset: usize) -> Result<Vec<Job>> {
        self.store.list_retained(JobState::Failed, limit, offset).await
    }

    /// Number of jobs per state.
    pub async fn counts(&self) -> Result<JobCounts> {
        self.store.counts().await
    }
}
