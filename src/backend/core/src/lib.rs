#![allow(clippy::result_large_err)]
//! # submitq core
//!
//! Asynchronous submission job queue for state-changing ledger operations.
//!
//! ## Architecture
//!
//! - **Job Store**: durable job records with compare-and-swap transitions (Redis or in-memory)
//! - **Backoff Policy**: fixed or exponential retry delays
//! - **Submission Executor**: one classified attempt against the ledger gateway
//! - **Worker Pool**: bounded-concurrency claiming with graceful drain
//! - **Scheduler**: promotes due delayed jobs back to waiting and recovers stalled claims
//! - **Queue Facade**: submit, status and retention listings
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, Result, SubmitqError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, QueueConfig};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, Result, SubmitqError};
    pub use crate::jobs::{
        AttemptOutcome, BackoffPolicy, BackoffType, ErrorClass, GatewayError, Invocation, Job,
        JobCounts, JobError, JobId, JobQueue, JobScheduler, JobState, JobStore, LedgerGateway,
        SubmissionExecutor, SubmitRequest, WorkerConfig, WorkerPool,
    };
}
