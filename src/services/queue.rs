use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;

use crate::models::queue::{DailyAt, QueueName, QueueStats, Task};
use crate::pipeline::broker::{Broker, BrokerError, LEASE_EXPIRED};

const KEY_PREFIX: &str = "meal";

/// Priorities above this would lose precision in the wait-set score.
const MAX_PRIORITY: u8 = 9;

const ENQUEUE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'priority', ARGV[2], 'attempts_made', ARGV[4], 'max_attempts', ARGV[6])
if tonumber(ARGV[3]) > 0 then
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[5])
else
  local seq = redis.call('INCR', KEYS[4])
  redis.call('ZADD', KEYS[2], tonumber(ARGV[2]) * 1e13 + seq, ARGV[5])
end
return 1
"#;

const RESERVE: &str = r#"
local lapsed = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[2])
for _, id in ipairs(lapsed) do
  redis.call('ZREM', KEYS[3], id)
  local key = ARGV[1] .. id
  if redis.call('EXISTS', key) == 1 then
    local attempts = redis.call('HINCRBY', key, 'attempts_made', 1)
    redis.call('HSET', key, 'error', ARGV[6])
    if attempts >= tonumber(redis.call('HGET', key, 'max_attempts') or '1') then
      redis.call('HSET', key, 'finished_at', ARGV[2])
      redis.call('ZADD', KEYS[7], ARGV[2], id)
    else
      local priority = tonumber(redis.call('HGET', key, 'priority') or '3')
      local seq = redis.call('INCR', KEYS[6])
      redis.call('ZADD', KEYS[1], priority * 1e13 + seq, id)
    end
  end
end
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local priority = tonumber(redis.call('HGET', ARGV[1] .. id, 'priority') or '3')
  local seq = redis.call('INCR', KEYS[6])
  redis.call('ZADD', KEYS[1], priority * 1e13 + seq, id)
end
if redis.call('EXISTS', KEYS[4]) == 1 then return false end
local max = tonumber(ARGV[3])
if max > 0 and tonumber(redis.call('GET', KEYS[5]) or '0') >= max then return false end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then return false end
local id = popped[1]
if max > 0 and redis.call('INCR', KEYS[5]) == 1 then
  redis.call('PEXPIRE', KEYS[5], ARGV[4])
end
redis.call('ZADD', KEYS[3], tonumber(ARGV[2]) + tonumber(ARGV[5]), id)
return id
"#;

const PROGRESS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then redis.call('HSET', KEYS[1], 'progress', ARGV[1]) end
return 1
"#;

const FINISH: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[2]) == 0 then return 0 end
local key = ARGV[1] .. ARGV[2]
if ARGV[6] == 'failed' then
  redis.call('HINCRBY', key, 'attempts_made', 1)
  redis.call('HSET', key, 'error', ARGV[7], 'finished_at', ARGV[3])
else
  redis.call('HSET', key, 'result', ARGV[7], 'finished_at', ARGV[3], 'progress', 100)
  redis.call('HDEL', key, 'error')
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
local cutoff = '(' .. (tonumber(ARGV[3]) - tonumber(ARGV[5]))
local old = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', cutoff)
for _, id in ipairs(old) do redis.call('DEL', ARGV[1] .. id) end
if #old > 0 then redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', cutoff) end
local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[4])
if excess > 0 then
  local drop = redis.call('ZRANGE', KEYS[2], 0, excess - 1)
  for _, id in ipairs(drop) do redis.call('DEL', ARGV[1] .. id) end
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
end
return 1
"#;

const RETRY_LATER: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[2]) == 0 then return 0 end
local key = ARGV[1] .. ARGV[2]
redis.call('HINCRBY', key, 'attempts_made', 1)
redis.call('HSET', key, 'error', ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

const RETRY_FAILED: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[2]) - 1)
for _, id in ipairs(ids) do
  local key = ARGV[1] .. id
  redis.call('ZREM', KEYS[1], id)
  if redis.call('EXISTS', key) == 1 then
    redis.call('HSET', key, 'attempts_made', 0)
    redis.call('HDEL', key, 'error', 'finished_at', 'progress')
    local priority = tonumber(redis.call('HGET', key, 'priority') or '3')
    local seq = redis.call('INCR', KEYS[3])
    redis.call('ZADD', KEYS[2], priority * 1e13 + seq, id)
  end
end
return #ids
"#;

const CLEAR: &str = r#"
local removed = 0
for i = 1, 2 do
  local ids = redis.call('ZRANGE', KEYS[i], 0, -1)
  for _, id in ipairs(ids) do redis.call('DEL', ARGV[1] .. id) end
  removed = removed + #ids
  redis.call('DEL', KEYS[i])
end
local active = redis.call('ZRANGE', KEYS[3], 0, -1)
for _, id in ipairs(active) do redis.call('DEL', ARGV[1] .. id) end
redis.call('DEL', KEYS[3])
return removed + #active
"#;

/// Key layout of one named queue.
struct QueueKeys {
    base: String,
}

impl QueueKeys {
    fn new(queue: QueueName) -> Self {
        Self {
            base: format!("{KEY_PREFIX}:{queue}"),
        }
    }

    /// Prefix of per-task hashes; the task id is appended.
    fn task_prefix(&self) -> String {
        format!("{}:t:", self.base)
    }

    fn task(&self, id: &str) -> String {
        format!("{}{id}", self.task_prefix())
    }

    fn named(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.base)
    }
}

/// Redis-backed broker. Every state change that spans more than one key runs
/// as a Lua script so concurrent workers in any process see it atomically.
pub struct RedisBroker {
    client: redis::Client,
    scripts: Scripts,
}

struct Scripts {
    enqueue: Script,
    reserve: Script,
    progress: Script,
    finish: Script,
    retry_later: Script,
    retry_failed: Script,
    clear: Script,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url).map_err(BrokerError::Redis)?;
        Ok(Self {
            client,
            scripts: Scripts {
                enqueue: Script::new(ENQUEUE),
                reserve: Script::new(RESERVE),
                progress: Script::new(PROGRESS),
                finish: Script::new(FINISH),
                retry_later: Script::new(RETRY_LATER),
                retry_failed: Script::new(RETRY_FAILED),
                clear: Script::new(CLEAR),
            },
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn finish(
        &self,
        queue: QueueName,
        task_id: &str,
        outcome: &str,
        detail: &str,
    ) -> Result<(), BrokerError> {
        let keys = QueueKeys::new(queue);
        let options = queue.options();
        let (target, keep) = if outcome == "failed" {
            (keys.named("failed"), options.keep_failed)
        } else {
            (keys.named("completed"), options.keep_completed)
        };

        let mut conn = self.conn().await?;
        self.scripts.finish
            .key(keys.named("active"))
            .key(target)
            .arg(keys.task_prefix())
            .arg(task_id)
            .arg(Utc::now().timestamp_millis())
            .arg(keep.count)
            .arg(keep.age.as_millis() as u64)
            .arg(outcome)
            .arg(detail)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Rebuild a task from its hash: the immutable `data` JSON plus the fields
/// that change over the task's life.
fn task_from_fields(task_id: &str, mut fields: HashMap<String, String>) -> Result<Task, BrokerError> {
    let corrupt = |reason: String| BrokerError::Corrupt {
        task_id: task_id.to_string(),
        reason,
    };

    let data = fields.remove("data").ok_or_else(|| corrupt("missing data".to_string()))?;
    let mut task: Task = serde_json::from_str(&data)?;

    if let Some(attempts) = fields.remove("attempts_made") {
        task.attempts_made = attempts.parse().map_err(|e| corrupt(format!("attempts_made: {e}")))?;
    }
    task.error = fields.remove("error");
    if let Some(at) = fields.remove("finished_at") {
        task.finished_at = Some(at.parse().map_err(|e| corrupt(format!("finished_at: {e}")))?);
    }
    if let Some(result) = fields.remove("result") {
        task.result = Some(serde_json::from_str(&result)?);
    }
    Ok(task)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, mut task: Task, delay: Duration) -> Result<bool, BrokerError> {
        task.priority = task.priority.clamp(1, MAX_PRIORITY);
        let keys = QueueKeys::new(task.queue);
        let ready_at = if delay.is_zero() {
            0
        } else {
            Utc::now().timestamp_millis() + delay.as_millis() as i64
        };

        let mut conn = self.conn().await?;
        let added: i64 = self
            .scripts
            .enqueue
            .key(keys.task(&task.id))
            .key(keys.named("wait"))
            .key(keys.named("delayed"))
            .key(keys.named("seq"))
            .arg(serde_json::to_string(&task)?)
            .arg(task.priority)
            .arg(ready_at)
            .arg(task.attempts_made)
            .arg(&task.id)
            .arg(task.max_attempts)
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn reserve(&self, queue: QueueName, lease: Duration) -> Result<Option<Task>, BrokerError> {
        let keys = QueueKeys::new(queue);
        let (max, window_ms) = queue
            .options()
            .rate_limit
            .map(|l| (l.max, l.window.as_millis() as u64))
            .unwrap_or((0, 0));

        let mut conn = self.conn().await?;
        let reserved: Option<String> = self
            .scripts
            .reserve
            .key(keys.named("wait"))
            .key(keys.named("delayed"))
            .key(keys.named("active"))
            .key(keys.named("paused"))
            .key(keys.named("limiter"))
            .key(keys.named("seq"))
            .key(keys.named("failed"))
            .arg(keys.task_prefix())
            .arg(Utc::now().timestamp_millis())
            .arg(max)
            .arg(window_ms)
            .arg(lease.as_millis() as u64)
            .arg(LEASE_EXPIRED)
            .invoke_async(&mut conn)
            .await?;

        let Some(task_id) = reserved else {
            return Ok(None);
        };
        let fields: HashMap<String, String> = conn.hgetall(keys.task(&task_id)).await?;
        task_from_fields(&task_id, fields).map(Some)
    }

    async fn report_progress(&self, queue: QueueName, task_id: &str, percent: u8) -> Result<(), BrokerError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        self.scripts.progress
            .key(keys.task(task_id))
            .arg(percent.min(100))
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn complete(&self, queue: QueueName, task_id: &str, result: &serde_json::Value) -> Result<(), BrokerError> {
        self.finish(queue, task_id, "completed", &serde_json::to_string(result)?)
            .await
    }

    async fn retry_later(
        &self,
        queue: QueueName,
        task_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let keys = QueueKeys::new(queue);
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn().await?;
        self.scripts.retry_later
            .key(keys.named("active"))
            .key(keys.named("delayed"))
            .arg(keys.task_prefix())
            .arg(task_id)
            .arg(ready_at)
            .arg(error)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn fail(&self, queue: QueueName, task_id: &str, error: &str) -> Result<(), BrokerError> {
        self.finish(queue, task_id, "failed", error).await
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, BrokerError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let (waiting, active, completed, failed, delayed, is_paused): (u64, u64, u64, u64, u64, bool) =
            redis::pipe()
                .zcard(keys.named("wait"))
                .zcard(keys.named("active"))
                .zcard(keys.named("completed"))
                .zcard(keys.named("failed"))
                .zcard(keys.named("delayed"))
                .exists(keys.named("paused"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            queue_name: queue,
            waiting: if is_paused { 0 } else { waiting },
            active,
            completed,
            failed,
            delayed,
            paused: if is_paused { waiting } else { 0 },
            is_paused,
        })
    }

    async fn pause(&self, queue: QueueName) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(QueueKeys::new(queue).named("paused"), 1).await?;
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(QueueKeys::new(queue).named("paused")).await?;
        Ok(())
    }

    async fn failed_tasks(&self, queue: QueueName, limit: u64) -> Result<Vec<Task>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrange(keys.named("failed"), 0, limit as isize - 1).await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = conn.hgetall(keys.task(&id)).await?;
            if !fields.is_empty() {
                tasks.push(task_from_fields(&id, fields)?);
            }
        }
        Ok(tasks)
    }

    async fn retry_failed(&self, queue: QueueName, limit: u64) -> Result<u64, BrokerError> {
        if limit == 0 {
            return Ok(0);
        }
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let retried: u64 = self
            .scripts
            .retry_failed
            .key(keys.named("failed"))
            .key(keys.named("wait"))
            .key(keys.named("seq"))
            .arg(keys.task_prefix())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(retried)
    }

    async fn clear(&self, queue: QueueName) -> Result<u64, BrokerError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let removed: u64 = self
            .scripts
            .clear
            .key(keys.named("wait"))
            .key(keys.named("delayed"))
            .key(keys.named("active"))
            .arg(keys.task_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn set_schedule(&self, queue: QueueName, at: DailyAt) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(QueueKeys::new(queue).named("schedule"), serde_json::to_string(&at)?)
            .await?;
        Ok(())
    }

    async fn schedule(&self, queue: QueueName) -> Result<Option<DailyAt>, BrokerError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(QueueKeys::new(queue).named("schedule")).await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    /// Check Redis connectivity (for health checks).
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
