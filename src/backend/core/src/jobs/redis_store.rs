//! Redis-backed job store.
//!
//! Key layout under the configured prefix `{p}`:
//!
//! | key              | type       | content                                  |
//! |------------------|------------|------------------------------------------|
//! | `{p}:job:{id}`   | hash       | one field per job attribute              |
//! | `{p}:waiting`    | list       | job ids in FIFO order                    |
//! | `{p}:active`     | sorted set | job ids scored by `claimed_at` (ms)      |
//! | `{p}:delayed`    | sorted set | job ids scored by `next_run_at` (ms)     |
//! | `{p}:completed`  | sorted set | job ids scored by `finished_at` (ms)     |
//! | `{p}:failed`     | sorted set | job ids scored by `finished_at` (ms)     |
//!
//! Claims, transitions and retention trimming run as Lua scripts so each one
//! is a single atomic step on the server. A terminal transition evicts from
//! its retention list inside the same script.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use super::backoff::BackoffType;
use super::job::{Job, JobError, JobId, JobPatch, JobState};
use super::store::{ensure_retained, stamp_finished, JobCounts, JobStore, Transition};
use crate::config::RedisConfig;
use crate::error::{ErrorCode, Result, SubmitqError};
use crate::telemetry::QueueMetrics;

const CLAIM_SCRIPT: &str = r#"
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local key = ARGV[1] .. ':job:' .. id
  if redis.call('HGET', key, 'state') == 'waiting' then
    redis.call('HSET', key, 'state', 'active', 'claimed_at', ARGV[2])
    redis.call('ZADD', KEYS[2], ARGV[3], id)
    return redis.call('HGETALL', key)
  end
end
"#;

/// Replies `{code, evicted}`: code 1 applied, 0 conflict, -1 attempt budget
/// violated, -2 missing job.
const TRANSITION_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-2, 0}
end
if redis.call('HGET', KEYS[1], 'state') ~= ARGV[1] then
  return {0, 0}
end
if ARGV[6] ~= '' and redis.call('HGET', KEYS[1], 'claimed_at') ~= ARGV[6] then
  return {0, 0}
end
if ARGV[5] ~= '' then
  local attempts = tonumber(ARGV[5])
  local current = tonumber(redis.call('HGET', KEYS[1], 'attempts_made') or '0')
  local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts') or '0')
  if attempts < current or attempts > max then
    return {-1, 0}
  end
  redis.call('HSET', KEYS[1], 'attempts_made', ARGV[5])
end

redis.call('HSET', KEYS[1], 'state', ARGV[2])
local i = 10
for _ = 1, tonumber(ARGV[9]) do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  i = i + 2
end
while i <= #ARGV do
  redis.call('HDEL', KEYS[1], ARGV[i])
  i = i + 1
end

if ARGV[1] == 'waiting' then
  redis.call('LREM', KEYS[2], 0, ARGV[3])
else
  redis.call('ZREM', KEYS[2], ARGV[3])
end
if ARGV[2] == 'waiting' then
  redis.call('RPUSH', KEYS[3], ARGV[3])
else
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[3])
end

local evicted = 0
if ARGV[7] ~= '' then
  local excess = redis.call('ZCARD', KEYS[3]) - tonumber(ARGV[7])
  if excess > 0 then
    local ids = redis.call('ZRANGE', KEYS[3], 0, excess - 1)
    for _, id in ipairs(ids) do
      redis.call('DEL', ARGV[8] .. ':job:' .. id)
    end
    redis.call('ZREMRANGEBYRANK', KEYS[3], 0, excess - 1)
    evicted = excess
  end
end
return {1, evicted}
"#;

const TRIM_SCRIPT: &str = r#"
local excess = redis.call('ZCARD', KEYS[1]) - tonumber(ARGV[1])
if excess <= 0 then
  return 0
end
local ids = redis.call('ZRANGE', KEYS[1], 0, excess - 1)
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[2] .. ':job:' .. id)
end
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, excess - 1)
return excess
"#;

/// Job store backed by Redis.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisJobStore {
    /// Connect and verify the server is reachable.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!(prefix = %config.key_prefix, "Connected to Redis job store");
        Ok(Self::with_connection(conn, config.key_prefix.clone()))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Check the server will not evict queue keys under memory pressure.
    ///
    /// When `required` is false a wrong policy is only logged.
    pub async fn check_eviction_policy(&self, required: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<Vec<String>> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("maxmemory-policy")
            .query_async(&mut conn)
            .await;

        let policy = match reply {
            Ok(values) => values.get(1).cloned().unwrap_or_default(),
            Err(e) => {
                // Managed deployments often disable CONFIG.
                warn!(error = %e, "Could not read Redis maxmemory-policy");
                return Ok(());
            }
        };

        if policy == "noeviction" {
            return Ok(());
        }
        if required {
            return Err(SubmitqError::configuration(format!(
                "Redis maxmemory-policy is {:?}, the job store requires \"noeviction\"",
                policy
            )));
        }
        warn!(policy = %policy, "Redis maxmemory-policy is not noeviction, jobs may be lost");
        Ok(())
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn index_key(&self, state: JobState) -> String {
        format!("{}:{}", self.prefix, state.as_str())
    }

    async fn load(&self, conn: &mut ConnectionManager, id: JobId) -> Result<Option<Job>> {
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(&fields).map(Some)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn create(&self, job: Job) -> Result<JobId> {
        if job.state != JobState::Waiting {
            return Err(SubmitqError::validation(format!(
                "New jobs must be waiting, got {}",
                job.state
            )));
        }
        let fields = encode_job(&job)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(job.id), &fields)
            .ignore()
            .rpush(self.index_key(JobState::Waiting), job.id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!("Job stored");
        Ok(job.id)
    }

    async fn claim_next_waiting(&self) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = Script::new(CLAIM_SCRIPT)
            .key(self.index_key(JobState::Waiting))
            .key(self.index_key(JobState::Active))
            .arg(&self.prefix)
            .arg(encode_time(now))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match reply {
            Some(flat) => decode_job(&pairs_to_map(flat)).map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, patch), fields(job_id = %id, from = %expected, to = %next))]
    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        patch: JobPatch,
    ) -> Result<Transition> {
        if !expected.can_transition_to(next) {
            return Err(SubmitqError::invalid_state_transition(id, expected, next));
        }
        let now = Utc::now();
        let patch = stamp_finished(next, patch);
        let score = index_score(next, &patch, now)?;
        let attempts = patch.attempts_made;
        let claim = patch.expected_claim.map(encode_time).unwrap_or_default();
        let cap = patch
            .retention_cap
            .filter(|_| next.is_terminal())
            .map(|cap| cap.to_string())
            .unwrap_or_default();
        let (set, del) = patch_fields(next, patch, now)?;

        let script = Script::new(TRANSITION_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.job_key(id))
            .key(self.index_key(expected))
            .key(self.index_key(next))
            .arg(expected.as_str())
            .arg(next.as_str())
            .arg(id.to_string())
            .arg(score)
            .arg(attempts.map(|a| a.to_string()).unwrap_or_default())
            .arg(claim)
            .arg(cap)
            .arg(&self.prefix)
            .arg(set.len());
        for (field, value) in &set {
            invocation.arg(*field).arg(value);
        }
        for field in &del {
            invocation.arg(*field);
        }

        let mut conn = self.conn.clone();
        let (code, evicted): (i64, usize) = invocation.invoke_async(&mut conn).await?;
        match code {
            1 => {
                if evicted > 0 {
                    debug!(list = %next, evicted, "Evicted from retention list");
                    QueueMetrics::record_evicted(next.as_str(), evicted);
                }
                Ok(Transition::Applied)
            }
            0 => Ok(Transition::Conflict),
            -1 => Err(SubmitqError::new(
                ErrorCode::AttemptBudgetExceeded,
                format!(
                    "Job {} cannot record {} attempts",
                    id,
                    attempts.unwrap_or_default()
                ),
            )),
            -2 => Err(SubmitqError::job_not_found(id)),
            other => Err(SubmitqError::with_internal(
                ErrorCode::StoreError,
                "Unexpected reply from job store",
                format!("transition script returned {}", other),
            )),
        }
    }

    async fn list_delayed_due(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.index_key(JobState::Delayed), "-inf", now.timestamp_millis())
            .await?;
        ids.iter().map(|id| id.parse()).collect()
    }

    async fn list_stalled(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(
                self.index_key(JobState::Active),
                "-inf",
                claimed_before.timestamp_millis(),
            )
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(&mut conn, id.parse()?).await? {
                if job.state == JobState::Active {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        self.load(&mut conn, id).await
    }

    async fn list_retained(&self, state: JobState, limit: usize, offset: usize) -> Result<Vec<Job>> {
        ensure_retained(state)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let (start, stop) = rank_range(offset, limit);
        let ids: Vec<String> = conn.zrevrange(self.index_key(state), start, stop).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            // Trimmed between ZREVRANGE and HGETALL
            if let Some(job) = self.load(&mut conn, id.parse()?).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn trim_retained(&self, state: JobState, cap: usize) -> Result<usize> {
        ensure_retained(state)?;
        let mut conn = self.conn.clone();
        let evicted: usize = Script::new(TRIM_SCRIPT)
            .key(self.index_key(state))
            .arg(cap)
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await?;
        if evicted > 0 {
            QueueMetrics::record_evicted(state.as_str(), evicted);
        }
        Ok(evicted)
    }

    async fn counts(&self) -> Result<JobCounts> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .llen(self.index_key(JobState::Waiting))
                .zcard(self.index_key(JobState::Active))
                .zcard(self.index_key(JobState::Delayed))
                .zcard(self.index_key(JobState::Completed))
                .zcard(self.index_key(JobState::Failed))
                .query_async(&mut conn)
                .await?;
        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field Encoding
// ═══════════════════════════════════════════════════════════════════════════════

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn encode_job(job: &Job) -> Result<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("operation_name", job.operation_name.clone()),
        ("arguments", serde_json::to_string(&job.arguments)?),
        ("organization_identity", job.organization_identity.clone()),
        ("state", job.state.as_str().to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("backoff_type", job.backoff_type.as_str().to_string()),
        ("backoff_delay_ms", job.backoff_delay_ms.to_string()),
        ("transaction_ids", serde_json::to_string(&job.transaction_ids)?),
        ("created_at", encode_time(job.created_at)),
    ];
    if let Some(at) = job.next_run_at {
        fields.push(("next_run_at", encode_time(at)));
    }
    if let Some(result) = &job.result {
        fields.push(("result", result.clone()));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", serde_json::to_string(error)?));
    }
    if let Some(at) = job.claimed_at {
        fields.push(("claimed_at", encode_time(at)));
    }
    if let Some(at) = job.finished_at {
        fields.push(("finished_at", encode_time(at)));
    }
    Ok(fields)
}

/// Inclusive `ZREVRANGE` bounds for a page. Out-of-range values saturate
/// instead of wrapping into negative (tail-relative) ranks.
fn rank_range(offset: usize, limit: usize) -> (isize, isize) {
    let start = isize::try_from(offset).unwrap_or(isize::MAX);
    let limit = isize::try_from(limit).unwrap_or(isize::MAX);
    (start, start.saturating_add(limit.saturating_sub(1)))
}

/// Score of the job in the destination index.
fn index_score(next: JobState, patch: &JobPatch, now: DateTime<Utc>) -> Result<i64> {
    match next {
        JobState::Delayed => patch.next_run_at.map(|at| at.timestamp_millis()).ok_or_else(|| {
            SubmitqError::validation("A delayed transition needs next_run_at")
        }),
        JobState::Completed | JobState::Failed => Ok(patch
            .finished_at
            .map(|at| at.timestamp_millis())
            .unwrap_or_else(|| now.timestamp_millis())),
        JobState::Active => Ok(now.timestamp_millis()),
        JobState::Waiting => Ok(0),
    }
}

type FieldUpdates = (Vec<(&'static str, String)>, Vec<&'static str>);

/// Fields to set and fields to delete for a transition, matching
/// [`Job::apply`].
fn patch_fields(next: JobState, patch: JobPatch, now: DateTime<Utc>) -> Result<FieldUpdates> {
    let mut set = Vec::new();
    let mut del = Vec::new();

    if next == JobState::Active {
        set.push(("claimed_at", encode_time(now)));
    }

    match patch.next_run_at {
        Some(at) if next == JobState::Delayed => set.push(("next_run_at", encode_time(at))),
        _ => del.push("next_run_at"),
    }
    match (patch.result, patch.last_error) {
        (_, Some(error)) => {
            set.push(("last_error", serde_json::to_string(&error)?));
            del.push("result");
        }
        (Some(result), None) => {
            set.push(("result", result));
            del.push("last_error");
        }
        (None, None) => {}
    }
    if let Some(ids) = patch.transaction_ids {
        set.push(("transaction_ids", serde_json::to_string(&ids)?));
    }
    if let Some(at) = patch.finished_at {
        set.push(("finished_at", encode_time(at)));
    }
    Ok((set, del))
}

fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        map.insert(field, value);
    }
    map
}

fn decode_job(fields: &HashMap<String, String>) -> Result<Job> {
    let id: JobId = required(fields, "id")?.parse()?;
    let key = |field: &str| format!("job {} field {}", id, field);

    let parse_time = |field: &'static str| -> Result<Option<DateTime<Utc>>> {
        fields
            .get(field)
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(|e| SubmitqError::corrupt_record(key(field), e.to_string()))
            })
            .transpose()
    };
    let parse_number = |field: &'static str| -> Result<u64> {
        required(fields, field)?
            .parse()
            .map_err(|e: std::num::ParseIntError| SubmitqError::corrupt_record(key(field), e.to_string()))
    };

    let last_error: Option<JobError> = fields
        .get("last_error")
        .map(|raw| serde_json::from_str(raw))
        .transpose()?;
    let transaction_ids: Vec<String> = match fields.get("transaction_ids") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Vec::new(),
    };
    let attempts_made = u32::try_from(parse_number("attempts_made")?)
        .map_err(|e| SubmitqError::corrupt_record(key("attempts_made"), e.to_string()))?;
    let max_attempts = u32::try_from(parse_number("max_attempts")?)
        .map_err(|e| SubmitqError::corrupt_record(key("max_attempts"), e.to_string()))?;

    Ok(Job {
        id,
        operation_name: required(fields, "operation_name")?.to_string(),
        arguments: serde_json::from_str(required(fields, "arguments")?)?,
        organization_identity: required(fields, "organization_identity")?.to_string(),
        state: required(fields, "state")?.parse()?,
        attempts_made,
        max_attempts,
        backoff_type: required(fields, "backoff_type")?.parse::<BackoffType>()?,
        backoff_delay_ms: parse_number("backoff_delay_ms")?,
        next_run_at: parse_time("next_run_at")?,
        result: fields.get("result").cloned(),
        last_error,
        transaction_ids,
        created_at: parse_time("created_at")?
            .ok_or_else(|| SubmitqError::corrupt_record(key("created_at"), "missing"))?,
        claimed_at: parse_time("claimed_at")?,
        finished_at: parse_time("finished_at")?,
    })
}

fn required<'a>(fields: &'a HashMap<String, String>, field: &str) -> Result<&'a str> {
    fields
        .get(field)
        .map(String::as_str)
        .ok_or_else(|| SubmitqError::corrupt_record(field, "missing field"))
}
