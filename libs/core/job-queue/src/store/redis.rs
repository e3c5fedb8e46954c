//! Redis-backed store shared by every worker process.
//!
//! Layout under `{prefix}:{queue}`:
//!
//! | key | type | contents |
//! |-----|------|----------|
//! | `:seq` | string | enqueue counter |
//! | `:job:{id}` | hash | one job record |
//! | `:waiting` | zset | score `(16 - priority) * 2^40 + seq`, lowest first |
//! | `:delayed` | zset | score = ready time (ms) |
//! | `:active` | zset | score = lease deadline (ms) |
//! | `:completed`, `:failed` | list | newest first, capped by retention |
//!
//! Every state transition runs as a single Lua script. Leasing bumps the
//! record's `lease_token`; extend, complete and fail compare it against the
//! caller's token before touching the job.

use super::{JobStore, NackOutcome, StateCounts};
use crate::error::{QueueError, QueueResult};
use crate::job::{Backoff, Job, JobId, JobState, Lease, Priority, QueueJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use tracing::{debug, info};

const LUA_HELPERS: &str = r"
local function waiting_score(key)
  local p = tonumber(redis.call('HGET', key, 'priority'))
  local s = tonumber(redis.call('HGET', key, 'seq'))
  return string.format('%.0f', (16 - p) * 1099511627776 + s)
end

local function lease_status(key, token)
  local state = redis.call('HGET', key, 'state')
  if not state then return '' end
  if state ~= 'active' or redis.call('HGET', key, 'lease_token') ~= token then
    return state
  end
  return 'ok'
end

local function trim(list, prefix, keep)
  local stale = redis.call('LRANGE', list, keep, -1)
  for _, old in ipairs(stale) do
    redis.call('DEL', prefix .. old)
  end
  if keep == 0 then
    redis.call('DEL', list)
  else
    redis.call('LTRIM', list, 0, keep - 1)
  end
end
";

// KEYS: seq, waiting, delayed, job
// ARGV: id, kind, data, priority, max_attempts, backoff_kind, backoff_ms, delay_ms, created_at, ready_at|''
const ENQUEUE: &str = r"
local seq = redis.call('INCR', KEYS[1])
redis.call('HSET', KEYS[4],
  'id', ARGV[1], 'kind', ARGV[2], 'data', ARGV[3], 'priority', ARGV[4], 'seq', seq,
  'attempts_made', 0, 'max_attempts', ARGV[5], 'backoff_kind', ARGV[6],
  'backoff_ms', ARGV[7], 'delay_ms', ARGV[8], 'created_at', ARGV[9], 'stalled_count', 0,
  'lease_token', 0)
if ARGV[10] ~= '' then
  redis.call('HSET', KEYS[4], 'state', 'delayed', 'ready_at', ARGV[10])
  redis.call('ZADD', KEYS[3], ARGV[10], ARGV[1])
else
  redis.call('HSET', KEYS[4], 'state', 'waiting')
  redis.call('ZADD', KEYS[2], waiting_score(KEYS[4]), ARGV[1])
end
return seq
";

// KEYS: active, waiting
// ARGV: job prefix, now
const RECLAIM: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[2])
for _, id in ipairs(expired) do
  local key = ARGV[1] .. id
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', key, 'lease_expires_at')
  redis.call('HINCRBY', key, 'stalled_count', 1)
  redis.call('HSET', key, 'state', 'waiting')
  redis.call('ZADD', KEYS[2], waiting_score(key), id)
end
return expired
";

// KEYS: waiting, delayed, active
// ARGV: job prefix, now, lease_until
const LEASE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, id in ipairs(due) do
  local key = ARGV[1] .. id
  redis.call('ZREM', KEYS[2], id)
  redis.call('HSET', key, 'state', 'waiting')
  redis.call('ZADD', KEYS[1], waiting_score(key), id)
end
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then
  return false
end
local id = head[1]
local key = ARGV[1] .. id
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[3], ARGV[3], id)
redis.call('HSET', key, 'state', 'active', 'lease_expires_at', ARGV[3], 'processed_at', ARGV[2])
redis.call('HINCRBY', key, 'lease_token', 1)
return redis.call('HGETALL', key)
";

// KEYS: active, job
// ARGV: id, lease_until, token
const EXTEND: &str = r"
local status = lease_status(KEYS[2], ARGV[3])
if status ~= 'ok' then return status end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], 'lease_expires_at', ARGV[2])
return 'ok'
";

// KEYS: active, completed, job
// ARGV: job prefix, id, now, keep, token
const COMPLETE: &str = r"
local status = lease_status(KEYS[3], ARGV[5])
if status ~= 'ok' then return status end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HDEL', KEYS[3], 'lease_expires_at')
redis.call('HSET', KEYS[3], 'state', 'completed', 'finished_at', ARGV[3])
redis.call('LPUSH', KEYS[2], ARGV[2])
trim(KEYS[2], ARGV[1], tonumber(ARGV[4]))
return 'ok'
";

// KEYS: active, delayed, failed, job
// ARGV: job prefix, id, now, keep, error, token
const FAIL: &str = r"
local status = lease_status(KEYS[4], ARGV[6])
if status ~= 'ok' then return {status, 0, 0} end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HDEL', KEYS[4], 'lease_expires_at')
redis.call('HSET', KEYS[4], 'last_error', ARGV[5])
local attempts = redis.call('HINCRBY', KEYS[4], 'attempts_made', 1)
local max = tonumber(redis.call('HGET', KEYS[4], 'max_attempts'))
if attempts < max then
  local delay = tonumber(redis.call('HGET', KEYS[4], 'backoff_ms'))
  if redis.call('HGET', KEYS[4], 'backoff_kind') == 'exponential' then
    delay = delay * math.pow(2, attempts - 1)
  end
  local ready = string.format('%.0f', tonumber(ARGV[3]) + delay)
  redis.call('HSET', KEYS[4], 'state', 'delayed', 'ready_at', ready)
  redis.call('ZADD', KEYS[2], ready, ARGV[2])
  return {'retrying', attempts, ready}
end
redis.call('HSET', KEYS[4], 'state', 'failed', 'finished_at', ARGV[3])
redis.call('LPUSH', KEYS[3], ARGV[2])
trim(KEYS[3], ARGV[1], tonumber(ARGV[4]))
return {'failed', attempts, 0}
";

// KEYS: failed, waiting
// ARGV: job prefix
const RETRY_FAILED: &str = r"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  local key = ARGV[1] .. id
  redis.call('HSET', key, 'state', 'waiting', 'attempts_made', 0)
  redis.call('HDEL', key, 'finished_at', 'ready_at')
  redis.call('ZADD', KEYS[2], waiting_score(key), id)
end
redis.call('DEL', KEYS[1])
return #ids
";

// KEYS: completed, failed
// ARGV: job prefix
const PURGE: &str = r"
local removed = 0
for i = 1, 2 do
  local ids = redis.call('LRANGE', KEYS[i], 0, -1)
  for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[1] .. id)
  end
  removed = removed + #ids
  redis.call('DEL', KEYS[i])
end
return removed
";

struct Scripts {
    enqueue: Script,
    reclaim: Script,
    lease: Script,
    extend: Script,
    complete: Script,
    fail: Script,
    retry_failed: Script,
    purge: Script,
}

impl Scripts {
    fn load() -> Self {
        let with_helpers = |body: &str| Script::new(&format!("{LUA_HELPERS}\n{body}"));
        Self {
            enqueue: with_helpers(ENQUEUE),
            reclaim: with_helpers(RECLAIM),
            lease: with_helpers(LEASE),
            extend: with_helpers(EXTEND),
            complete: with_helpers(COMPLETE),
            fail: with_helpers(FAIL),
            retry_failed: with_helpers(RETRY_FAILED),
            purge: with_helpers(PURGE),
        }
    }
}

struct Keys {
    seq: String,
    job_prefix: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{prefix}:{queue}");
        Self {
            seq: format!("{base}:seq"),
            job_prefix: format!("{base}:job:"),
            waiting: format!("{base}:waiting"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
        }
    }

    fn job(&self, id: JobId) -> String {
        format!("{}{}", self.job_prefix, id)
    }
}

pub struct RedisStore<J> {
    conn: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
    _job: PhantomData<fn() -> J>,
}

impl<J> RedisStore<J> {
    pub fn new(conn: ConnectionManager, key_prefix: &str, queue_name: &str) -> Self {
        Self {
            conn,
            keys: Keys::new(key_prefix, queue_name),
            scripts: Scripts::load(),
            _job: PhantomData,
        }
    }

    /// Open a managed connection to `uri` and build the store on top of it.
    pub async fn connect(uri: &str, key_prefix: &str, queue_name: &str) -> QueueResult<Self> {
        let client = redis::Client::open(uri)?;
        let conn = ConnectionManager::new(client).await?;
        info!(queue = queue_name, prefix = key_prefix, "connected queue store to redis");
        Ok(Self::new(conn, key_prefix, queue_name))
    }
}

/// Translate the status string the scripts return for a missing or non-active job.
fn check_status(id: JobId, status: &str) -> QueueResult<()> {
    match status {
        "ok" => Ok(()),
        "" => Err(QueueError::NotFound(id)),
        other => Err(QueueError::NotActive {
            id,
            state: other.to_string(),
        }),
    }
}

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

struct Record {
    id: String,
    fields: HashMap<String, String>,
}

impl Record {
    fn corrupt(&self, details: impl Into<String>) -> QueueError {
        QueueError::Corrupt {
            id: self.id.clone(),
            details: details.into(),
        }
    }

    fn text(&self, name: &str) -> QueueResult<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| self.corrupt(format!("missing field '{name}'")))
    }

    fn parse<T: FromStr>(&self, name: &str) -> QueueResult<T> {
        self.text(name)?
            .parse()
            .map_err(|_| self.corrupt(format!("bad value in '{name}'")))
    }

    fn time(&self, name: &str) -> QueueResult<Option<DateTime<Utc>>> {
        match self.fields.get(name).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .and_then(DateTime::from_timestamp_millis)
                .map(Some)
                .ok_or_else(|| self.corrupt(format!("bad timestamp in '{name}'"))),
        }
    }

    fn into_job<J: QueueJob>(self) -> QueueResult<Job<J>> {
        let id = JobId::from_str(&self.id).map_err(|e| self.corrupt(e.to_string()))?;
        let priority = Priority::from_value(self.parse("priority")?)
            .ok_or_else(|| self.corrupt("unknown priority"))?;
        let state = JobState::from_str(self.text("state")?)
            .map_err(|_| self.corrupt("unknown state"))?;
        let backoff = Backoff::from_parts(self.text("backoff_kind")?, self.parse("backoff_ms")?)
            .ok_or_else(|| self.corrupt("unknown backoff"))?;
        let created_at = self
            .time("created_at")?
            .ok_or_else(|| self.corrupt("missing created_at"))?;

        Ok(Job {
            id,
            kind: self.text("kind")?.to_string(),
            data: serde_json::from_str(self.text("data")?)?,
            priority,
            state,
            attempts_made: self.parse("attempts_made")?,
            max_attempts: self.parse("max_attempts")?,
            backoff,
            delay_ms: self.parse("delay_ms")?,
            sequence: self.parse("seq")?,
            created_at,
            ready_at: self.time("ready_at")?,
            lease_expires_at: self.time("lease_expires_at")?,
            processed_at: self.time("processed_at")?,
            finished_at: self.time("finished_at")?,
            last_error: self.fields.get("last_error").cloned(),
            stalled_count: self.parse("stalled_count")?,
            lease_token: match self.fields.get("lease_token") {
                Some(_) => self.parse("lease_token")?,
                None => 0,
            },
        })
    }
}

fn decode<J: QueueJob>(fields: HashMap<String, String>) -> QueueResult<Job<J>> {
    let id = fields.get("id").cloned().unwrap_or_default();
    Record { id, fields }.into_job()
}

#[async_trait]
impl<J: QueueJob> JobStore<J> for RedisStore<J> {
    async fn insert(&self, mut job: Job<J>) -> QueueResult<Job<J>> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(&job.data)?;
        let ready_at = match (job.state, job.ready_at) {
            (JobState::Delayed, Some(at)) => ms(at).to_string(),
            _ => String::new(),
        };

        let seq: u64 = self
            .scripts
            .enqueue
            .key(&self.keys.seq)
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(self.keys.job(job.id))
            .arg(job.id.to_string())
            .arg(&job.kind)
            .arg(data)
            .arg(u32::from(job.priority.value()))
            .arg(job.max_attempts)
            .arg(job.backoff.kind_name())
            .arg(job.backoff.base_ms())
            .arg(job.delay_ms)
            .arg(ms(job.created_at))
            .arg(&ready_at)
            .invoke_async(&mut conn)
            .await?;

        job.sequence = seq;
        if ready_at.is_empty() {
            job.state = JobState::Waiting;
        }
        debug!(job_id = %job.id, seq, "job stored");
        Ok(job)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .scripts
            .reclaim
            .key(&self.keys.active)
            .key(&self.keys.waiting)
            .arg(&self.keys.job_prefix)
            .arg(ms(now))
            .invoke_async(&mut conn)
            .await?;

        ids.iter()
            .map(|raw| {
                JobId::from_str(raw).map_err(|e| QueueError::Corrupt {
                    id: raw.clone(),
                    details: e.to_string(),
                })
            })
            .collect()
    }

    async fn lease_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> QueueResult<Option<Job<J>>> {
        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, String>> = self
            .scripts
            .lease
            .key(&self.keys.waiting)
            .key(&self.keys.delayed)
            .key(&self.keys.active)
            .arg(&self.keys.job_prefix)
            .arg(ms(now))
            .arg(ms(lease_until))
            .invoke_async(&mut conn)
            .await?;

        fields.map(decode::<J>).transpose()
    }

    async fn extend_lease(&self, lease: Lease, lease_until: DateTime<Utc>) -> QueueResult<()> {
        let id = lease.id;
        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .extend
            .key(&self.keys.active)
            .key(self.keys.job(id))
            .arg(id.to_string())
            .arg(ms(lease_until))
            .arg(lease.token)
            .invoke_async(&mut conn)
            .await?;
        check_status(id, &status)
    }

    async fn complete(&self, lease: Lease, now: DateTime<Utc>, keep: usize) -> QueueResult<()> {
        let id = lease.id;
        let mut conn = self.conn.clone();
        let status: String = self
            .scripts
            .complete
            .key(&self.keys.active)
            .key(&self.keys.completed)
            .key(self.keys.job(id))
            .arg(&self.keys.job_prefix)
            .arg(id.to_string())
            .arg(ms(now))
            .arg(keep)
            .arg(lease.token)
            .invoke_async(&mut conn)
            .await?;
        check_status(id, &status)
    }

    async fn fail(
        &self,
        lease: Lease,
        error: &str,
        now: DateTime<Utc>,
        keep: usize,
    ) -> QueueResult<NackOutcome> {
        let id = lease.id;
        let mut conn = self.conn.clone();
        let (status, attempts_made, retry_ms): (String, u32, i64) = self
            .scripts
            .fail
            .key(&self.keys.active)
            .key(&self.keys.delayed)
            .key(&self.keys.failed)
            .key(self.keys.job(id))
            .arg(&self.keys.job_prefix)
            .arg(id.to_string())
            .arg(ms(now))
            .arg(keep)
            .arg(error)
            .arg(lease.token)
            .invoke_async(&mut conn)
            .await?;

        match status.as_str() {
            "retrying" => {
                let retry_at = DateTime::from_timestamp_millis(retry_ms).ok_or_else(|| {
                    QueueError::Corrupt {
                        id: id.to_string(),
                        details: format!("retry time {retry_ms} out of range"),
                    }
                })?;
                Ok(NackOutcome::Retrying {
                    attempts_made,
                    retry_at,
                })
            }
            "failed" => Ok(NackOutcome::Failed { attempts_made }),
            other => check_status(id, other).and_then(|()| {
                Err(QueueError::Corrupt {
                    id: id.to_string(),
                    details: "unexpected fail status".to_string(),
                })
            }),
        }
    }

    async fn counts(&self) -> QueueResult<StateCounts> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .atomic()
                .zcard(&self.keys.waiting)
                .zcard(&self.keys.delayed)
                .zcard(&self.keys.active)
                .llen(&self.keys.completed)
                .llen(&self.keys.failed)
                .query_async(&mut conn)
                .await?;

        Ok(StateCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn retry_failed(&self, _now: DateTime<Utc>) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .scripts
            .retry_failed
            .key(&self.keys.failed)
            .key(&self.keys.waiting)
            .arg(&self.keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn purge(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = self
            .scripts
            .purge
            .key(&self.keys.completed)
            .key(&self.keys.failed)
            .arg(&self.keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job<J>>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode(fields).map(Some)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
