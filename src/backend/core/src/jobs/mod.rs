//! Asynchronous submission job queue.
//!
//! Request handlers enqueue ledger submissions and return immediately. Workers
//! execute them against the ledger gateway with classified retries, and a
//! scheduler resumes delayed retries once their backoff has elapsed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  submit   ┌───────────┐  claim   ┌─────────────┐  invoke  ┌─────────┐
//! │ JobQueue │──────────▶│  JobStore │◀────────▶│ WorkerPool  │─────────▶│ Ledger  │
//! │ (facade) │  status   │  (CAS)    │transition│ + Executor  │          │ Gateway │
//! └──────────┘◀──────────│           │◀───┐     └─────────────┘          └─────────┘
//!                        └───────────┘    │ delayed → waiting
//!                                   ┌─────┴───────┐
//!                                   │ JobScheduler│
//!                                   └─────────────┘
//! ```
//!
//! Lifecycle: `waiting → active → (completed | delayed | failed)` and
//! `delayed → waiting`. Every transition is a compare-and-swap in the store.
//! An `active` job whose claim outlives the stall timeout is recovered by the
//! scheduler as a failed attempt.
//!
//! # Usage
//!
//! ```rust,ignore
//! use submitq_core::jobs::*;
//!
//! let queue = JobQueue::in_memory(&config.queue);
//! let executor = Arc::new(SubmissionExecutor::new(
//!     queue.store(),
//!     Arc::new(HttpLedgerGateway::new(&config.gateway)?),
//!     RetentionLimits::from(&config.queue),
//! ));
//! let workers = WorkerPool::new(queue.store(), executor, WorkerConfig::from(&config.queue)).start();
//! let scheduler = JobScheduler::new(queue.store(), Duration::from_secs(1))
//!     .with_stall_recovery(Duration::from_secs(300), RetentionLimits::from(&config.queue))
//!     .start();
//!
//! let id = queue.submit(SubmitRequest::new("CreateAsset", ["asset1", "blue"], "Org1MSP")).await?;
//! ```

pub mod backoff;
pub mod executor;
pub mod gateway;
pub mod job;
pub mod queue;
pub mod redis_store;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use backoff::{BackoffPolicy, BackoffType};
pub use executor::{AttemptOutcome, SubmissionExecutor};
pub use gateway::{GatewayError, HttpLedgerGateway, Invocation, LedgerGateway};
pub use job::{
    ErrorClass, Job, JobError, JobId, JobOptions, JobPatch, JobState, SubmitRequest,
};
pub use queue::JobQueue;
pub use redis_store::RedisJobStore;
pub use scheduler::{JobScheduler, SchedulerHandle};
pub use store::{InMemoryJobStore, JobCounts, JobStore, RetentionLimits, Transition};
pub use worker::{WorkerConfig, WorkerHandle, WorkerPool, WorkerStats};
