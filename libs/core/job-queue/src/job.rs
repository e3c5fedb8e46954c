//! Job model: identifiers, priorities, lifecycle states and retry policy.

use crate::error::InvalidPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Payload carried by a job.
///
/// Implementors describe their own kind and the required-field rules for it.
/// The queue calls [`QueueJob::validate`] before accepting a job when
/// enqueue-time validation is enabled.
///
/// ```rust,ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Reindex { index: String }
///
/// impl QueueJob for Reindex {
///     fn kind(&self) -> &str { "reindex" }
///     fn validate(&self) -> Result<(), InvalidPayload> {
///         if self.index.is_empty() {
///             return Err(InvalidPayload::new("reindex", "index is required"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait QueueJob: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn kind(&self) -> &str;

    fn validate(&self) -> Result<(), InvalidPayload> {
        Ok(())
    }
}

/// Time-ordered job identifier (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Symbolic priority level. Higher weight is dequeued first.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const fn value(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Critical => 15,
        }
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Priority::Low),
            5 => Some(Priority::Normal),
            10 => Some(Priority::High),
            15 => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Lenient lookup: unknown names map to `Normal`.
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Delay applied before a failed job becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(attempts_made - 1)`
    Exponential { base_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential { base_ms: 2000 }
    }
}

impl Backoff {
    /// Delay before the next attempt, given the attempts already made
    /// (including the one that just failed).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Exponential { base_ms } => {
                let exp = attempts_made.saturating_sub(1).min(63);
                base_ms.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(ms)
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Backoff::Fixed { .. } => "fixed",
            Backoff::Exponential { .. } => "exponential",
        }
    }

    pub(crate) fn base_ms(&self) -> u64 {
        match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Exponential { base_ms } => base_ms,
        }
    }

    pub(crate) fn from_parts(kind: &str, ms: u64) -> Option<Self> {
        match kind {
            "fixed" => Some(Backoff::Fixed { delay_ms: ms }),
            "exponential" => Some(Backoff::Exponential { base_ms: ms }),
            _ => None,
        }
    }
}

/// Per-enqueue overrides. Unset fields fall back to the queue configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    #[serde(default)]
    pub priority: Priority,
    /// Milliseconds to wait before the job becomes eligible
    #[serde(default)]
    pub delay_ms: u64,
    /// `None` or `Some(0)` means "use the queue default"
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Attempts to use, treating zero as "not set".
    pub fn resolved_attempts(&self, default: u32) -> u32 {
        match self.attempts {
            Some(n) if n > 0 => n,
            _ => default,
        }
    }
}

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job<J> {
    pub id: JobId,
    pub kind: String,
    pub data: J,
    pub priority: Priority,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub delay_ms: u64,
    /// Enqueue order; FIFO tie-break within a priority level
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    /// When a delayed job becomes eligible
    pub ready_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Most recent lease time
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Times the job was reclaimed from an expired lease
    pub stalled_count: u32,
    /// Bumped on every lease; only the current holder may ack, nack or extend
    #[serde(default)]
    pub lease_token: u64,
}

/// Claim on a leased job, handed back to [`QueueCore`](crate::QueueCore) to
/// ack, nack or extend it. A claim from an earlier lease is refused once the
/// job has been leased again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub id: JobId,
    pub token: u64,
}

impl<J: QueueJob> Job<J> {
    /// Build a job that has not been stored yet. The store assigns `sequence`.
    pub fn new(
        data: J,
        options: &EnqueueOptions,
        max_attempts: u32,
        backoff: Backoff,
        now: DateTime<Utc>,
    ) -> Self {
        let delayed = options.delay_ms > 0;
        let ready_at = delayed.then(|| after(now, options.delay_ms));
        Self {
            id: JobId::new(),
            kind: data.kind().to_string(),
            data,
            priority: options.priority,
            state: if delayed {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts_made: 0,
            max_attempts,
            backoff,
            delay_ms: options.delay_ms,
            sequence: 0,
            created_at: now,
            ready_at,
            lease_expires_at: None,
            processed_at: None,
            finished_at: None,
            last_error: None,
            stalled_count: 0,
            lease_token: 0,
        }
    }
}

impl<J> Job<J> {
    /// Claim held by whoever leased this copy of the job.
    pub fn lease(&self) -> Lease {
        Lease {
            id: self.id,
            token: self.lease_token,
        }
    }

    /// Attempts left after the current one, assuming it fails.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts
            .saturating_sub(self.attempts_made.saturating_add(1))
    }
}

/// `now + ms`, clamped to the largest representable instant.
pub(crate) fn after(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
