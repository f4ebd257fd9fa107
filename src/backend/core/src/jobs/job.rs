//! Job records and their lifecycle.
//!
//! - **JobId**: opaque identifier assigned at enqueue time
//! - **JobState**: `waiting | active | delayed | completed | failed`
//! - **Job**: the stored record, including attempt accounting and outcome
//! - **JobPatch**: the field changes carried by one atomic state transition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::backoff::{BackoffPolicy, BackoffType};
use crate::config::QueueConfig;
use crate::error::{Result, SubmitqError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a submit job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = SubmitqError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SubmitqError::validation(format!("Invalid job id {:?}: {}", s, e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// State of a submit job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Runnable, waiting to be claimed by a worker
    Waiting,
    /// Claimed by exactly one worker, attempt in flight
    Active,
    /// Transient failure, waiting for its backoff delay to elapse
    Delayed,
    /// The ledger accepted the operation
    Completed,
    /// Permanent rejection or attempt budget exhausted
    Failed,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a transition from `self` to `next` is part of the lifecycle.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Delayed)
                | (Self::Active, Self::Failed)
                | (Self::Delayed, Self::Waiting)
        )
    }

    /// Stable lowercase name, used as the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = SubmitqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "delayed" => Ok(Self::Delayed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SubmitqError::validation(format!("Unknown job state: {}", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, unavailable endorsers, network partitions
    Transient,
    /// Malformed arguments, business-rule rejection, authorization refusal
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// Classified error recorded on a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Retryable or not
    pub class: ErrorClass,
    /// Error message
    pub message: String,
    /// Optional gateway-specific error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl JobError {
    /// Create a transient (retryable) error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
            code: None,
        }
    }

    /// Create a permanent (non-retryable) error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.class, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

// ═══════════════════════════════════════════════════════════════════════════════
// Submission Request & Options
// ═══════════════════════════════════════════════════════════════════════════════

/// A request to invoke a state-changing ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Name of the contract operation
    pub operation_name: String,
    /// Ordered string arguments
    pub arguments: Vec<String>,
    /// Identity / contract context to submit under (e.g. an MSP id)
    pub organization_identity: String,
}

impl SubmitRequest {
    pub fn new<I, S>(
        operation_name: impl Into<String>,
        arguments: I,
        organization_identity: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operation_name: operation_name.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            organization_identity: organization_identity.into(),
        }
    }
}

/// Per-job retry settings, fixed at enqueue time from process configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for JobOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: BackoffPolicy::new(config.backoff_type, config.backoff_delay_ms),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A submit job as held by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub operation_name: String,
    pub arguments: Vec<String>,
    pub organization_identity: String,
    pub state: JobState,
    /// Incremented on every execution attempt
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_type: BackoffType,
    pub backoff_delay_ms: u64,
    /// Only meaningful while `state == Delayed`
    pub next_run_at: Option<DateTime<Utc>>,
    /// Payload returned by the ledger on success
    pub result: Option<String>,
    /// Error of the most recent failed attempt
    pub last_error: Option<JobError>,
    /// Ledger transaction id of each attempt, in attempt order
    #[serde(default)]
    pub transaction_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// When the current (or last) worker claimed the job
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new waiting job.
    pub fn new(request: SubmitRequest, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            operation_name: request.operation_name,
            arguments: request.arguments,
            organization_identity: request.organization_identity,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: options.max_attempts,
            backoff_type: options.backoff.backoff_type,
            backoff_delay_ms: options.backoff.delay_ms,
            next_run_at: None,
            result: None,
            last_error: None,
            transaction_ids: Vec::new(),
            created_at: Utc::now(),
            claimed_at: None,
            finished_at: None,
        }
    }

    /// The backoff policy this job was enqueued with.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_type, self.backoff_delay_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another attempt fits in the budget.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Check that moving to `next` with `patch` respects the lifecycle and the
    /// attempt budget.
    pub fn check_transition(&self, next: JobState, patch: &JobPatch) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SubmitqError::invalid_state_transition(self.id, self.state, next));
        }
        if let Some(attempts) = patch.attempts_made {
            if attempts < self.attempts_made || attempts > self.max_attempts {
                return Err(SubmitqError::attempt_budget_exceeded(
                    self.id,
                    attempts,
                    self.max_attempts,
                ));
            }
        }
        Ok(())
    }

    /// Apply a transition. Callers must have checked it with
    /// [`check_transition`](Self::check_transition) against the stored state.
    pub fn apply(&mut self, next: JobState, patch: JobPatch) {
        self.state = next;
        if let Some(attempts) = patch.attempts_made {
            self.attempts_made = attempts;
        }
        self.next_run_at = if next == JobState::Delayed {
            patch.next_run_at
        } else {
            None
        };
        if let Some(result) = patch.result {
            self.result = Some(result);
            self.last_error = None;
        }
        if let Some(error) = patch.last_error {
            self.last_error = Some(error);
            self.result = None;
        }
        if let Some(ids) = patch.transaction_ids {
            self.transaction_ids = ids;
        }
        if let Some(finished_at) = patch.finished_at {
            self.finished_at = Some(finished_at);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transition Patch
// ═══════════════════════════════════════════════════════════════════════════════

/// Field changes applied together with a state transition.
///
/// `next_run_at` is cleared by every transition whose target is not
/// `delayed`; `result` and `last_error` overwrite each other.
///
/// Two fields are conditions on the write rather than changes to the record:
/// `expected_claim` turns a claim mismatch into a conflict, and
/// `retention_cap` evicts the oldest members of the destination retention
/// list in the same atomic step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub attempts_made: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub last_error: Option<JobError>,
    pub transaction_ids: Option<Vec<String>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expected_claim: Option<DateTime<Utc>>,
    pub retention_cap: Option<usize>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts_made(mut self, attempts: u32) -> Self {
        self.attempts_made = Some(attempts);
        self
    }

    pub fn next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn last_error(mut self, error: JobError) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn transaction_ids(mut self, ids: Vec<String>) -> Self {
        self.transaction_ids = Some(ids);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    /// Only apply while the job is still held by the claim made at `at`.
    pub fn expect_claim(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expected_claim = at;
        self
    }

    /// Keep at most `cap` jobs in the destination retention list.
    pub fn retain_at_most(mut self, cap: Option<usize>) -> Self {
        self.retention_cap = cap;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
