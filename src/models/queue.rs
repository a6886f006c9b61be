use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

/// Named broker queues, one per work item type.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, EnumIter, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum QueueName {
    ImageAnalysis,
    Email,
    PushNotification,
    DataSync,
    Webhook,
    Cleanup,
}

/// Redelivery delay shape after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^attempts_made`
    Exponential { base: Duration },
    Fixed { delay: Duration },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts have already failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Exponential { base } => base.saturating_mul(2u32.saturating_pow(attempts_made)),
            Backoff::Fixed { delay } => delay,
        }
    }
}

/// At most `max` task starts per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

/// Bound on how many finished tasks are kept, by count and by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub count: u32,
    pub age: Duration,
}

/// Per-queue defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub keep_completed: Retention,
    pub keep_failed: Retention,
    pub timeout: Duration,
}

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl QueueName {
    pub fn options(self) -> QueueOptions {
        match self {
            QueueName::ImageAnalysis => QueueOptions {
                attempts: 3,
                backoff: Backoff::Exponential { base: Duration::from_secs(1) },
                concurrency: 3,
                rate_limit: Some(RateLimit { max: 5, window: Duration::from_secs(1) }),
                keep_completed: Retention { count: 100, age: DAY },
                keep_failed: Retention { count: 500, age: 7 * DAY },
                timeout: Duration::from_secs(60),
            },
            QueueName::Email => QueueOptions {
                attempts: 5,
                backoff: Backoff::Exponential { base: Duration::from_secs(2) },
                concurrency: 10,
                rate_limit: Some(RateLimit { max: 50, window: Duration::from_secs(1) }),
                keep_completed: Retention { count: 1000, age: DAY },
                keep_failed: Retention { count: 1000, age: 7 * DAY },
                timeout: Duration::from_secs(30),
            },
            QueueName::PushNotification => QueueOptions {
                attempts: 3,
                backoff: Backoff::Fixed { delay: Duration::from_secs(5) },
                concurrency: 20,
                rate_limit: Some(RateLimit { max: 100, window: Duration::from_secs(1) }),
                keep_completed: Retention { count: 1000, age: HOUR },
                keep_failed: Retention { count: 1000, age: DAY },
                timeout: Duration::from_secs(15),
            },
            QueueName::DataSync => QueueOptions {
                attempts: 3,
                backoff: Backoff::Exponential { base: Duration::from_secs(5) },
                concurrency: 2,
                rate_limit: Some(RateLimit { max: 10, window: Duration::from_secs(60) }),
                keep_completed: Retention { count: 100, age: DAY },
                keep_failed: Retention { count: 500, age: 7 * DAY },
                timeout: Duration::from_secs(300),
            },
            QueueName::Webhook => QueueOptions {
                attempts: 5,
                backoff: Backoff::Exponential { base: Duration::from_secs(2) },
                concurrency: 10,
                rate_limit: Some(RateLimit { max: 20, window: Duration::from_secs(1) }),
                keep_completed: Retention { count: 500, age: DAY },
                keep_failed: Retention { count: 1000, age: 7 * DAY },
                timeout: Duration::from_secs(30),
            },
            QueueName::Cleanup => QueueOptions {
                attempts: 1,
                backoff: Backoff::Fixed { delay: Duration::from_secs(60) },
                concurrency: 1,
                rate_limit: None,
                keep_completed: Retention { count: 30, age: 30 * DAY },
                keep_failed: Retention { count: 30, age: 30 * DAY },
                timeout: Duration::from_secs(600),
            },
        }
    }
}

/// Subscription tier of the submitting user. Lower priority number is served first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionTier {
    Premium,
    Standard,
    #[default]
    Free,
}

impl SubscriptionTier {
    pub fn priority(self) -> u8 {
        match self {
            SubscriptionTier::Premium => 1,
            SubscriptionTier::Standard => 2,
            SubscriptionTier::Free => 3,
        }
    }
}

/// A unit of work held by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub priority: u8,
    #[serde(default)]
    pub attempts_made: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub enqueued_at: i64,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, queue: QueueName, payload: serde_json::Value, priority: u8) -> Self {
        Self {
            id: id.into(),
            queue,
            payload,
            priority,
            attempts_made: 0,
            max_attempts: queue.options().attempts,
            error: None,
            enqueued_at: Utc::now().timestamp_millis(),
            finished_at: None,
            result: None,
        }
    }
}

/// Aggregate task counts for one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_name: QueueName,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Waiting tasks held back because the queue is paused.
    pub paused: u64,
    pub is_paused: bool,
}

/// A daily wall-clock time in UTC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyAt {
    pub hour: u32,
    pub minute: u32,
}

impl DailyAt {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN);
        let today = Utc.from_utc_datetime(&after.date_naive().and_time(time));
        if today > after {
            today
        } else {
            today + ChronoDuration::days(1)
        }
    }
}
