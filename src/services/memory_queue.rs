use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::queue::{DailyAt, QueueName, QueueStats, Retention, Task};
use crate::pipeline::broker::{Broker, BrokerError, LEASE_EXPIRED};

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, Task>,
    progress: HashMap<String, u8>,
    /// (priority, seq, id)
    waiting: BTreeSet<(u8, u64, String)>,
    /// (ready_at, seq, id)
    delayed: BTreeSet<(i64, u64, String)>,
    /// id -> lease expiry
    active: HashMap<String, i64>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    paused: bool,
    starts: VecDeque<Instant>,
    schedule: Option<DailyAt>,
}

impl QueueState {
    fn push_waiting(&mut self, task: &Task, seq: u64) {
        self.waiting.insert((task.priority, seq, task.id.clone()));
    }

    /// Take back tasks whose holder let the lease run out. The lapse counts
    /// as an attempt; a task out of attempts goes to `failed`.
    fn reclaim_expired(&mut self, queue: QueueName, now_ms: i64, seq: &mut u64) {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, until)| **until <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            self.active.remove(&id);
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            task.attempts_made += 1;
            task.error = Some(LEASE_EXPIRED.to_string());
            if task.attempts_made >= task.max_attempts {
                task.finished_at = Some(now_ms);
                self.failed.push_back(id);
                Self::trim(&mut self.tasks, &mut self.failed, queue.options().keep_failed, now_ms);
            } else {
                let task = task.clone();
                *seq += 1;
                self.push_waiting(&task, *seq);
            }
        }
    }

    fn promote_due(&mut self, now_ms: i64, seq: &mut u64) {
        while let Some(first) = self.delayed.first().cloned() {
            if first.0 > now_ms {
                break;
            }
            self.delayed.remove(&first);
            if let Some(task) = self.tasks.get(&first.2).cloned() {
                *seq += 1;
                self.push_waiting(&task, *seq);
            }
        }
    }

    fn trim(tasks: &mut HashMap<String, Task>, list: &mut VecDeque<String>, keep: Retention, now_ms: i64) {
        let max_age = keep.age.as_millis() as i64;
        while let Some(front) = list.front() {
            let too_many = list.len() > keep.count as usize;
            let too_old = tasks
                .get(front)
                .and_then(|t| t.finished_at)
                .is_some_and(|at| now_ms - at > max_age);
            if !too_many && !too_old {
                break;
            }
            if let Some(id) = list.pop_front() {
                tasks.remove(&id);
            }
        }
    }
}

/// In-process broker with the same semantics as the Redis one. Intended for
/// development and tests; state does not survive a restart.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    rate_limits: bool,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<QueueName, QueueState>,
    seq: u64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            rate_limits: true,
        }
    }

    /// Ignore the per-queue rate limiters.
    pub fn without_rate_limits(mut self) -> Self {
        self.rate_limits = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of a task, wherever it is.
    pub async fn task(&self, queue: QueueName, task_id: &str) -> Option<Task> {
        self.lock().queues.get(&queue)?.tasks.get(task_id).cloned()
    }

    pub async fn progress(&self, queue: QueueName, task_id: &str) -> Option<u8> {
        self.lock().queues.get(&queue)?.progress.get(task_id).copied()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<bool, BrokerError> {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let state = inner.queues.entry(task.queue).or_default();
        if state.tasks.contains_key(&task.id) {
            return Ok(false);
        }

        if delay.is_zero() {
            state.push_waiting(&task, seq);
        } else {
            let ready_at = now_ms() + delay.as_millis() as i64;
            state.delayed.insert((ready_at, seq, task.id.clone()));
        }
        state.tasks.insert(task.id.clone(), task);
        Ok(true)
    }

    async fn reserve(&self, queue: QueueName, lease: Duration) -> Result<Option<Task>, BrokerError> {
        let mut inner = self.lock();
        let Inner { queues, seq } = &mut *inner;
        let state = queues.entry(queue).or_default();
        let now = now_ms();

        state.reclaim_expired(queue, now, seq);
        state.promote_due(now, seq);
        if state.paused {
            return Ok(None);
        }

        if let (true, Some(limit)) = (self.rate_limits, queue.options().rate_limit) {
            let now = Instant::now();
            while state.starts.front().is_some_and(|at| now.duration_since(*at) >= limit.window) {
                state.starts.pop_front();
            }
            if state.starts.len() >= limit.max as usize {
                return Ok(None);
            }
        }

        let Some(next) = state.waiting.pop_first() else {
            return Ok(None);
        };
        let id = next.2;
        state.starts.push_back(Instant::now());
        state.active.insert(id.clone(), now + lease.as_millis() as i64);
        Ok(state.tasks.get(&id).cloned())
    }

    async fn report_progress(&self, queue: QueueName, task_id: &str, percent: u8) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        if let Some(state) = inner.queues.get_mut(&queue) {
            if state.tasks.contains_key(task_id) {
                state.progress.insert(task_id.to_string(), percent.min(100));
            }
        }
        Ok(())
    }

    async fn complete(&self, queue: QueueName, task_id: &str, result: &serde_json::Value) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let Some(state) = inner.queues.get_mut(&queue) else {
            return Ok(());
        };
        if state.active.remove(task_id).is_none() {
            return Ok(());
        }
        let now = now_ms();
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.finished_at = Some(now);
            task.result = Some(result.clone());
            task.error = None;
        }
        state.progress.insert(task_id.to_string(), 100);
        state.completed.push_back(task_id.to_string());
        QueueState::trim(&mut state.tasks, &mut state.completed, queue.options().keep_completed, now);
        Ok(())
    }

    async fn retry_later(
        &self,
        queue: QueueName,
        task_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let Some(state) = inner.queues.get_mut(&queue) else {
            return Ok(());
        };
        if state.active.remove(task_id).is_none() {
            return Ok(());
        }
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.attempts_made += 1;
            task.error = Some(error.to_string());
        }
        let ready_at = now_ms() + delay.as_millis() as i64;
        state.delayed.insert((ready_at, seq, task_id.to_string()));
        Ok(())
    }

    async fn fail(&self, queue: QueueName, task_id: &str, error: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let Some(state) = inner.queues.get_mut(&queue) else {
            return Ok(());
        };
        if state.active.remove(task_id).is_none() {
            return Ok(());
        }
        let now = now_ms();
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.attempts_made += 1;
            task.error = Some(error.to_string());
            task.finished_at = Some(now);
        }
        state.failed.push_back(task_id.to_string());
        QueueState::trim(&mut state.tasks, &mut state.failed, queue.options().keep_failed, now);
        Ok(())
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, BrokerError> {
        let mut inner = self.lock();
        let state = inner.queues.entry(queue).or_default();
        let waiting = state.waiting.len() as u64;
        Ok(QueueStats {
            queue_name: queue,
            waiting: if state.paused { 0 } else { waiting },
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            delayed: state.delayed.len() as u64,
            paused: if state.paused { waiting } else { 0 },
            is_paused: state.paused,
        })
    }

    async fn pause(&self, queue: QueueName) -> Result<(), BrokerError> {
        self.lock().queues.entry(queue).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), BrokerError> {
        self.lock().queues.entry(queue).or_default().paused = false;
        Ok(())
    }

    async fn failed_tasks(&self, queue: QueueName, limit: u64) -> Result<Vec<Task>, BrokerError> {
        let inner = self.lock();
        let Some(state) = inner.queues.get(&queue) else {
            return Ok(Vec::new());
        };
        Ok(state
            .failed
            .iter()
            .take(limit as usize)
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    async fn retry_failed(&self, queue: QueueName, limit: u64) -> Result<u64, BrokerError> {
        let mut inner = self.lock();
        let Inner { queues, seq } = &mut *inner;
        let Some(state) = queues.get_mut(&queue) else {
            return Ok(0);
        };

        let mut retried = 0;
        while retried < limit {
            let Some(id) = state.failed.pop_front() else {
                break;
            };
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            task.attempts_made = 0;
            task.error = None;
            task.finished_at = None;
            let task = task.clone();
            *seq += 1;
            state.progress.remove(&id);
            state.push_waiting(&task, *seq);
            retried += 1;
        }
        Ok(retried)
    }

    async fn clear(&self, queue: QueueName) -> Result<u64, BrokerError> {
        let mut inner = self.lock();
        let Some(state) = inner.queues.get_mut(&queue) else {
            return Ok(0);
        };

        let doomed: Vec<String> = state
            .waiting
            .iter()
            .map(|w| w.2.clone())
            .chain(state.delayed.iter().map(|d| d.2.clone()))
            .chain(state.active.keys().cloned())
            .collect();
        state.waiting.clear();
        state.delayed.clear();
        state.active.clear();
        for id in &doomed {
            state.tasks.remove(id);
            state.progress.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn set_schedule(&self, queue: QueueName, at: DailyAt) -> Result<(), BrokerError> {
        self.lock().queues.entry(queue).or_default().schedule = Some(at);
        Ok(())
    }

    async fn schedule(&self, queue: QueueName) -> Result<Option<DailyAt>, BrokerError> {
        Ok(self.lock().queues.get(&queue).and_then(|s| s.schedule))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
