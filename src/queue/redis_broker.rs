// Redis-backed broker
//
// Key layout per category, under `<prefix>:<category>`:
//
// - `:jobs`      hash, job id -> job JSON
// - `:state`     hash, job id -> job state
// - `:rank`      hash, job id -> wait score (restored when a retry is promoted)
// - `:errors`    hash, job id -> failure reason
// - `:wait`      sorted set of ready jobs, scored by priority then arrival
// - `:delayed`   sorted set of parked retries, scored by ready-at (ms since epoch)
// - `:completed` sorted set of completed jobs, scored by finish time
// - `:failed`    sorted set of failed jobs, scored by finish time
// - `:seq`       arrival counter
//
// Finished jobs past the retention count are dropped, oldest first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use tokio::sync::OnceCell;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::queue::broker::{Broker, Channel, JobSource};
use crate::queue::connection::ConnectionDescriptor;
use crate::queue::jobs::{Category, Job, JobState};
use crate::types::{QueueError, QueueResult};

/// Arrival slots per priority level in a wait score.
const PRIORITY_SPAN: f64 = 1e9;

/// Highest priority value kept distinct; larger values share the last level.
const MAX_PRIORITY: u32 = 2_097_152;

/// Promotes due retries back into the wait set, then claims the lowest-scored job.
/// Returns `{id, body}`; the body is nil when the job hash lost it.
const FETCH_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local rank = redis.call('HGET', KEYS[5], id) or 0
  redis.call('ZADD', KEYS[1], rank, id)
  redis.call('HSET', KEYS[4], id, 'waiting')
end
local next = redis.call('ZPOPMIN', KEYS[1])
if #next == 0 then
  return false
end
local id = next[1]
redis.call('HSET', KEYS[4], id, 'active')
return {id, redis.call('HGET', KEYS[3], id)}
"#;

/// Records a finished job and trims the finished set to ARGV[5] entries.
/// KEYS: jobs, state, rank, errors, finished.
/// ARGV: id, body (empty keeps the stored one), state, finished-at, keep, reason (may be empty).
const FINISH_SCRIPT: &str = r#"
local id = ARGV[1]
if ARGV[2] ~= '' then
  redis.call('HSET', KEYS[1], id, ARGV[2])
end
redis.call('HSET', KEYS[2], id, ARGV[3])
redis.call('HDEL', KEYS[3], id)
if ARGV[6] ~= '' then
  redis.call('HSET', KEYS[4], id, ARGV[6])
end
redis.call('ZADD', KEYS[5], ARGV[4], id)
local excess = redis.call('ZCARD', KEYS[5]) - tonumber(ARGV[5])
if excess <= 0 then
  return 0
end
local expired = redis.call('ZRANGE', KEYS[5], 0, excess - 1)
for _, old in ipairs(expired) do
  redis.call('HDEL', KEYS[1], old)
  redis.call('HDEL', KEYS[2], old)
  redis.call('HDEL', KEYS[4], old)
end
redis.call('ZREMRANGEBYRANK', KEYS[5], 0, excess - 1)
return excess
"#;

#[derive(Debug, Clone)]
struct Keys {
    jobs: String,
    state: String,
    rank: String,
    errors: String,
    wait: String,
    delayed: String,
    completed: String,
    failed: String,
    seq: String,
}

impl Keys {
    fn new(prefix: &str, category: Category) -> Self {
        let base = format!("{}:{}", prefix, category);
        Self {
            jobs: format!("{}:jobs", base),
            state: format!("{}:state", base),
            rank: format!("{}:rank", base),
            errors: format!("{}:errors", base),
            wait: format!("{}:wait", base),
            delayed: format!("{}:delayed", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            seq: format!("{}:seq", base),
        }
    }
}

fn wait_score(priority: Option<u32>, seq: u64) -> f64 {
    f64::from(priority.unwrap_or(0).min(MAX_PRIORITY)) * PRIORITY_SPAN + seq as f64
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn broker_error(e: RedisError) -> QueueError {
    QueueError::Broker(e.to_string())
}

fn submission_error(e: RedisError) -> QueueError {
    QueueError::Submission(e.to_string())
}

/// Client plus a connection manager created on first use.
struct RedisConnection {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisConnection {
    fn open(connection: &ConnectionDescriptor) -> QueueResult<Self> {
        let client = redis::Client::open(connection.to_url().as_str())
            .map_err(|e| QueueError::Configuration(e.to_string()))?;
        Ok(Self { client, manager: OnceCell::new() })
    }

    async fn get(&self) -> RedisResult<ConnectionManager> {
        self.manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
    }
}

#[derive(Debug, Clone)]
pub struct RedisBroker {
    prefix: String,
    retention: RetentionConfig,
}

impl RedisBroker {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), retention: RetentionConfig::default() }
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }
}

impl Broker for RedisBroker {
    fn open_channel(
        &self,
        category: Category,
        connection: &ConnectionDescriptor,
    ) -> QueueResult<Arc<dyn Channel>> {
        Ok(Arc::new(RedisChannel {
            category,
            keys: Keys::new(&self.prefix, category),
            conn: RedisConnection::open(connection)?,
            closed: AtomicBool::new(false),
        }))
    }

    fn open_source(
        &self,
        category: Category,
        connection: &ConnectionDescriptor,
    ) -> QueueResult<Arc<dyn JobSource>> {
        Ok(Arc::new(RedisSource {
            category,
            keys: Keys::new(&self.prefix, category),
            conn: RedisConnection::open(connection)?,
            retention: self.retention.clone(),
            fetch_script: Script::new(FETCH_SCRIPT),
            finish_script: Script::new(FINISH_SCRIPT),
        }))
    }
}

struct RedisChannel {
    category: Category,
    keys: Keys,
    conn: RedisConnection,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for RedisChannel {
    fn category(&self) -> Category {
        self.category
    }

    async fn enqueue(&self, job: Job) -> QueueResult<Uuid> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Submission(format!("channel {} is closed", self.category)));
        }

        let body = serde_json::to_string(&job)?;
        let id = job.id.to_string();
        let mut conn = self.conn.get().await.map_err(submission_error)?;

        let seq: u64 = conn.incr(&self.keys.seq, 1).await.map_err(submission_error)?;
        let score = wait_score(job.policy.priority, seq);

        let _: () = redis::pipe()
            .atomic()
            .hset(&self.keys.jobs, &id, body)
            .ignore()
            .hset(&self.keys.state, &id, JobState::Waiting.as_str())
            .ignore()
            .hset(&self.keys.rank, &id, score)
            .ignore()
            .zadd(&self.keys.wait, &id, score)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(submission_error)?;

        debug!(category = %self.category, job_id = %id, "Job written to redis");
        Ok(job.id)
    }

    async fn state(&self, id: Uuid) -> QueueResult<JobState> {
        let mut conn = self.conn.get().await.map_err(broker_error)?;
        let state: Option<String> = conn
            .hget(&self.keys.state, id.to_string())
            .await
            .map_err(broker_error)?;
        Ok(state.as_deref().map(JobState::parse).unwrap_or(JobState::Unknown))
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct RedisSource {
    category: Category,
    keys: Keys,
    conn: RedisConnection,
    retention: RetentionConfig,
    fetch_script: Script,
    finish_script: Script,
}

impl RedisSource {
    /// Stores the final state and trims the matching finished set.
    /// An empty `body` keeps whatever the job hash already holds.
    async fn finish(&self, id: &str, body: &str, state: JobState, reason: &str) -> QueueResult<()> {
        let (finished, keep) = match state {
            JobState::Completed => (&self.keys.completed, self.retention.keep_completed),
            _ => (&self.keys.failed, self.retention.keep_failed),
        };
        let mut conn = self.conn.get().await.map_err(broker_error)?;
        let expired: i64 = self
            .finish_script
            .key(&self.keys.jobs)
            .key(&self.keys.state)
            .key(&self.keys.rank)
            .key(&self.keys.errors)
            .key(finished)
            .arg(id)
            .arg(body)
            .arg(state.as_str())
            .arg(now_millis())
            .arg(keep)
            .arg(reason)
            .invoke_async(&mut conn)
            .await
            .map_err(broker_error)?;

        if expired > 0 {
            debug!(category = %self.category, expired, state = state.as_str(), "Trimmed finished jobs");
        }
        Ok(())
    }
}

#[async_trait]
impl JobSource for RedisSource {
    fn category(&self) -> Category {
        self.category
    }

    async fn fetch(&self) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.get().await.map_err(broker_error)?;
        let claimed: Option<(String, Option<String>)> = self
            .fetch_script
            .key(&self.keys.wait)
            .key(&self.keys.delayed)
            .key(&self.keys.jobs)
            .key(&self.keys.state)
            .key(&self.keys.rank)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(broker_error)?;

        let Some((id, body)) = claimed else {
            return Ok(None);
        };

        // A claimed job that cannot be decoded would otherwise stay active forever.
        let parsed = match body.as_deref() {
            Some(body) => serde_json::from_str::<Job>(body).map_err(QueueError::from),
            None => Err(QueueError::Broker(format!("job {} has no stored body", id))),
        };
        match parsed {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                error!(category = %self.category, job_id = %id, error = %e, "Failing unreadable job");
                self.finish(&id, "", JobState::Failed, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn complete(&self, job: &Job) -> QueueResult<()> {
        let body = serde_json::to_string(job)?;
        self.finish(&job.id.to_string(), &body, JobState::Completed, "").await
    }

    async fn retry(&self, job: &Job, delay: Duration) -> QueueResult<()> {
        let body = serde_json::to_string(job)?;
        let id = job.id.to_string();
        let ready_at = now_millis() + delay.as_millis() as i64;
        let mut conn = self.conn.get().await.map_err(broker_error)?;
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.keys.jobs, &id, body)
            .ignore()
            .hset(&self.keys.state, &id, JobState::Delayed.as_str())
            .ignore()
            .zadd(&self.keys.delayed, &id, ready_at)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn fail(&self, job: &Job, reason: &str) -> QueueResult<()> {
        let mut failed = job.clone();
        failed.failed_reason = Some(reason.to_string());
        let body = serde_json::to_string(&failed)?;
        self.finish(&failed.id.to_string(), &body, JobState::Failed, reason).await
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}
