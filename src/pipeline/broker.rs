use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::instrument;

use super::handlers::AnalysisPayload;
use super::worker::ProgressReporter;
use super::{Scheduler, SchedulerError, SchedulerMode};
use crate::models::job::AnalysisJob;
use crate::models::queue::{DailyAt, QueueName, QueueStats, SubscriptionTier, Task};

const IDLE_INTERVAL: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Added to a queue's timeout before the consumer gives up on a running task.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Error recorded on a task whose lease ran out before it was settled.
pub const LEASE_EXPIRED: &str = "lease expired before the task was settled";

/// External task broker: named queues with priority, delayed delivery,
/// pause, rate limiting and bounded retention of finished tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Add a task, delivered no earlier than `delay` from now. Returns `false`
    /// (and changes nothing) when a task with the same id already exists.
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<bool, BrokerError>;

    /// Take back active tasks whose lease has run out (counting the attempt),
    /// promote due delayed tasks, then take the highest-priority waiting task
    /// (FIFO within a priority) under a lease of `lease`. `None` when nothing is
    /// waiting, the queue is paused, or the rate limiter is exhausted.
    async fn reserve(&self, queue: QueueName, lease: Duration) -> Result<Option<Task>, BrokerError>;

    async fn report_progress(&self, queue: QueueName, task_id: &str, percent: u8) -> Result<(), BrokerError>;

    async fn complete(&self, queue: QueueName, task_id: &str, result: &serde_json::Value) -> Result<(), BrokerError>;

    /// Count the failed attempt and park the task in `delayed`.
    async fn retry_later(
        &self,
        queue: QueueName,
        task_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Count the failed attempt and move the task to `failed`.
    async fn fail(&self, queue: QueueName, task_id: &str, error: &str) -> Result<(), BrokerError>;

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, BrokerError>;

    async fn pause(&self, queue: QueueName) -> Result<(), BrokerError>;

    async fn resume(&self, queue: QueueName) -> Result<(), BrokerError>;

    /// Up to `limit` failed tasks, oldest first, without moving them.
    async fn failed_tasks(&self, queue: QueueName, limit: u64) -> Result<Vec<Task>, BrokerError>;

    /// Move up to `limit` failed tasks, oldest first, back to waiting.
    async fn retry_failed(&self, queue: QueueName, limit: u64) -> Result<u64, BrokerError>;

    /// Drop every waiting, delayed and active task.
    async fn clear(&self, queue: QueueName) -> Result<u64, BrokerError>;

    async fn set_schedule(&self, queue: QueueName, at: DailyAt) -> Result<(), BrokerError>;

    async fn schedule(&self, queue: QueueName) -> Result<Option<DailyAt>, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt task {task_id}: {reason}")]
    Corrupt { task_id: String, reason: String },
}

/// How a handler run ended when it did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// Redeliver after the queue's backoff, if attempts remain.
    #[error("{0}")]
    Retry(String),

    /// Move straight to `failed`.
    #[error("{0}")]
    Permanent(String),
}

/// Executes tasks delivered from one queue.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value, TaskError>;
}

/// Per-delivery handle passed to a handler.
pub struct TaskContext {
    broker: Arc<dyn Broker>,
    queue: QueueName,
    task_id: String,
}

impl TaskContext {
    pub fn new(broker: Arc<dyn Broker>, queue: QueueName, task_id: impl Into<String>) -> Self {
        Self {
            broker,
            queue,
            task_id: task_id.into(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

#[async_trait]
impl ProgressReporter for TaskContext {
    async fn report(&self, percent: u8) {
        if let Err(e) = self.broker.report_progress(self.queue, &self.task_id, percent).await {
            tracing::warn!(task_id = %self.task_id, queue = %self.queue, error = %e, "Failed to report progress");
        }
    }
}

/// Scheduler that pulls tasks from a [`Broker`] and runs them through the
/// registered handler of each queue, at most `concurrency` at a time per queue.
pub struct BrokerScheduler {
    broker: Arc<dyn Broker>,
    handlers: HashMap<QueueName, Arc<dyn TaskHandler>>,
    timeouts: HashMap<QueueName, Duration>,
    attempts: HashMap<QueueName, u32>,
    idle_interval: Duration,
    drain_timeout: Duration,
}

impl BrokerScheduler {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            handlers: HashMap::new(),
            timeouts: HashMap::new(),
            attempts: HashMap::new(),
            idle_interval: IDLE_INTERVAL,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    pub fn register(mut self, queue: QueueName, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(queue, handler);
        self
    }

    /// Override the queue's default per-task timeout.
    pub fn with_timeout(mut self, queue: QueueName, timeout: Duration) -> Self {
        self.timeouts.insert(queue, timeout);
        self
    }

    /// Override the queue's default attempt ceiling for tasks admitted here.
    pub fn with_attempts(mut self, queue: QueueName, attempts: u32) -> Self {
        self.attempts.insert(queue, attempts.max(1));
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    async fn enqueue_analysis(
        &self,
        payload: AnalysisPayload,
        tier: SubscriptionTier,
    ) -> Result<(), SchedulerError> {
        let queue = QueueName::ImageAnalysis;
        let mut task = Task::new(payload.task_id(), queue, serde_json::to_value(&payload)?, tier.priority());
        if let Some(attempts) = self.attempts.get(&queue) {
            task.max_attempts = *attempts;
        }

        let task_id = task.id.clone();
        if !self.broker.enqueue(task, Duration::ZERO).await? {
            tracing::debug!(task_id = %task_id, "Task already queued");
        }
        Ok(())
    }
}

#[async_trait]
impl Scheduler for BrokerScheduler {
    fn mode(&self) -> SchedulerMode {
        SchedulerMode::Broker
    }

    async fn admit(&self, job: &AnalysisJob, tier: SubscriptionTier) -> Result<(), SchedulerError> {
        self.enqueue_analysis(AnalysisPayload::Single { job_id: job.id }, tier).await
    }

    async fn admit_batch(&self, jobs: &[AnalysisJob], tier: SubscriptionTier) -> Result<(), SchedulerError> {
        match jobs {
            [] => Ok(()),
            [job] => self.admit(job, tier).await,
            _ => {
                let job_ids = jobs.iter().map(|j| j.id).collect();
                self.enqueue_analysis(AnalysisPayload::Batch { job_ids }, tier).await
            }
        }
    }

    /// Run one consumer loop per registered queue until `shutdown` flips to true.
    async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut loops = JoinSet::new();
        for (queue, handler) in &self.handlers {
            let consumer = QueueConsumer {
                broker: Arc::clone(&self.broker),
                handler: Arc::clone(handler),
                queue: *queue,
                timeout: self.timeouts.get(queue).copied().unwrap_or(queue.options().timeout),
                idle_interval: self.idle_interval,
                drain_timeout: self.drain_timeout,
            };
            loops.spawn(consumer.run(shutdown.clone()));
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Queue consumer panicked");
            }
        }
    }
}

/// Pull loop for one queue.
struct QueueConsumer {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn TaskHandler>,
    queue: QueueName,
    timeout: Duration,
    idle_interval: Duration,
    drain_timeout: Duration,
}

impl QueueConsumer {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.queue.options().concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut running = JoinSet::new();

        tracing::info!(queue = %self.queue, concurrency, "Queue consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(queue = %self.queue, error = %e, "Task execution panicked");
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            // Longer than the hard limit in `execute`, so a live consumer always
            // settles before its lease lapses.
            let lease = self.timeout + TIMEOUT_GRACE * 2;
            match self.broker.reserve(self.queue, lease).await {
                Ok(Some(task)) => {
                    let broker = Arc::clone(&self.broker);
                    let handler = Arc::clone(&self.handler);
                    let (queue, timeout) = (self.queue, self.timeout);
                    running.spawn(async move {
                        let _permit = permit;
                        execute(broker, handler, queue, timeout, task).await;
                    });
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    self.record_depth().await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(queue = %self.queue, error = %e, "Failed to reserve task");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.idle_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!(queue = %self.queue, in_flight = running.len(), "Queue consumer stopping");
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while running.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(queue = %self.queue, "Drain timed out, aborting in-flight tasks");
            running.abort_all();
        }
    }

    async fn record_depth(&self) {
        if let Ok(stats) = self.broker.stats(self.queue).await {
            metrics::gauge!("queue_depth", "queue" => self.queue.to_string())
                .set((stats.waiting + stats.delayed) as f64);
        }
    }
}

/// Run one delivery and settle it with the broker.
#[instrument(
    name = "broker.execute",
    skip_all,
    fields(queue = %queue, task_id = %task.id, attempt = task.attempts_made + 1)
)]
async fn execute(
    broker: Arc<dyn Broker>,
    handler: Arc<dyn TaskHandler>,
    queue: QueueName,
    timeout: Duration,
    task: Task,
) {
    let ctx = TaskContext::new(Arc::clone(&broker), queue, task.id.clone());
    let limit = timeout + TIMEOUT_GRACE;

    let outcome = match tokio::time::timeout(limit, handler.handle(&task, &ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(TaskError::Retry(format!("task timed out after {}s", limit.as_secs()))),
    };

    let settled = match outcome {
        Ok(result) => broker.complete(queue, &task.id, &result).await,
        Err(TaskError::Permanent(error)) => {
            tracing::warn!(error = %error, "Task failed permanently");
            broker.fail(queue, &task.id, &error).await
        }
        Err(TaskError::Retry(error)) => {
            let attempts = task.attempts_made + 1;
            if attempts < task.max_attempts {
                let delay = queue.options().backoff.delay_for(attempts);
                tracing::info!(error = %error, delay_ms = delay.as_millis() as u64, "Task will be redelivered");
                broker.retry_later(queue, &task.id, &error, delay).await
            } else {
                tracing::warn!(error = %error, attempts, "Task out of attempts");
                broker.fail(queue, &task.id, &error).await
            }
        }
    };

    if let Err(e) = settled {
        tracing::error!(error = %e, "Failed to settle task with the broker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_queue::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records deliveries and answers every one with the same outcome.
    struct RecordingHandler {
        outcome: Result<serde_json::Value, TaskError>,
        work: Duration,
        seen: Mutex<Vec<String>>,
        current: AtomicUsize,
        peak: AtomicUsize,
        progress: Option<u8>,
    }

    impl RecordingHandler {
        fn new(outcome: Result<serde_json::Value, TaskError>) -> Self {
            Self {
                outcome,
                work: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                progress: None,
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().push(task.id.clone());
            if let Some(percent) = self.progress {
                ctx.report(percent).await;
            }
            tokio::time::sleep(self.work).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    async fn run_for(scheduler: BrokerScheduler, duration: Duration) {
        let (tx, rx) = watch::channel(false);
        let runner = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(duration).await;
        tx.send(true).unwrap();
        runner.await.unwrap();
    }

    fn task(id: &str, queue: QueueName, priority: u8) -> Task {
        Task::new(id, queue, serde_json::json!({}), priority)
    }

    #[tokio::test]
    async fn test_delivers_by_priority_then_fifo() {
        let broker = Arc::new(MemoryBroker::new());
        for (id, priority) in [("free-1", 3), ("premium", 1), ("standard", 2), ("free-2", 3)] {
            broker.enqueue(task(id, QueueName::Cleanup, priority), Duration::ZERO).await.unwrap();
        }

        let handler = Arc::new(RecordingHandler::new(Ok(serde_json::json!({}))));
        let scheduler = BrokerScheduler::new(broker.clone())
            .register(QueueName::Cleanup, handler.clone())
            .with_idle_interval(Duration::from_millis(5));
        run_for(scheduler, Duration::from_millis(100)).await;

        assert_eq!(handler.seen(), vec!["premium", "standard", "free-1", "free-2"]);
        assert_eq!(broker.stats(QueueName::Cleanup).await.unwrap().completed, 4);
    }

    #[tokio::test]
    async fn test_respects_queue_concurrency() {
        let broker = Arc::new(MemoryBroker::new().without_rate_limits());
        for i in 0..8 {
            let id = format!("job-{i}");
            broker.enqueue(task(&id, QueueName::ImageAnalysis, 2), Duration::ZERO).await.unwrap();
        }

        let mut handler = RecordingHandler::new(Ok(serde_json::json!({})));
        handler.work = Duration::from_millis(30);
        let handler = Arc::new(handler);
        let scheduler = BrokerScheduler::new(broker.clone())
            .register(QueueName::ImageAnalysis, handler.clone())
            .with_idle_interval(Duration::from_millis(5));
        run_for(scheduler, Duration::from_millis(400)).await;

        assert_eq!(handler.seen().len(), 8);
        assert!(handler.peak.load(Ordering::SeqCst) <= QueueName::ImageAnalysis.options().concurrency);
        assert_eq!(broker.stats(QueueName::ImageAnalysis).await.unwrap().completed, 8);
    }

    #[tokio::test]
    async fn test_retryable_error_delays_redelivery() {
        let broker = Arc::new(MemoryBroker::new());
        broker.enqueue(task("flaky", QueueName::ImageAnalysis, 2), Duration::ZERO).await.unwrap();

        let handler = Arc::new(RecordingHandler::new(Err(TaskError::Retry("503".to_string()))));
        let scheduler = BrokerScheduler::new(broker.clone())
            .register(QueueName::ImageAnalysis, handler.clone())
            .with_idle_interval(Duration::from_millis(5));
        run_for(scheduler, Duration::from_millis(100)).await;

        // Backoff after the first failure is two seconds, so only one delivery.
        assert_eq!(handler.seen().len(), 1);
        let stored = broker.task(QueueName::ImageAnalysis, "flaky").await.unwrap();
        assert_eq!(stored.attempts_made, 1);
        assert_eq!(stored.error.as_deref(), Some("503"));
        assert_eq!(broker.stats(QueueName::ImageAnalysis).await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_last_attempt_fails_task() {
        let broker = Arc::new(MemoryBroker::new());
        let mut last = task("flaky", QueueName::ImageAnalysis, 2);
        last.attempts_made = 2;
        broker.enqueue(last, Duration::ZERO).await.unwrap();

        let handler = Arc::new(RecordingHandler::new(Err(TaskError::Retry("503".to_string()))));
        let scheduler = BrokerScheduler::new(broker.clone())
            .register(QueueName::ImageAnalysis, handler)
            .with_idle_interval(Duration::from_millis(5));
        run_for(scheduler, Duration::from_millis(100)).await;

        let stats = broker.stats(QueueName::ImageAnalysis).await.unwrap();
        assert_eq!((stats.failed, stats.delayed), (1, 0));
        assert_eq!(broker.task(QueueName::ImageAnalysis, "flaky").await.unwrap().attempts_made, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let broker = Arc::new(MemoryBroker::new());
        broker.enqueue(task("bad", QueueName::ImageAnalysis, 2), Duration::ZERO).await.unwrap();

        let handler = Arc::new(RecordingHandler::new(Err(TaskError::Permanent("unsupported".to_string()))));
        let scheduler = BrokerScheduler::new(broker.clone())
            .register(QueueName::ImageAnalysis, handler.clone())
            .with_idle_interval(Duration::from_millis(5));
        run_for(scheduler, Duration::from_millis(100)).await;

        assert_eq!(handler.seen().len(), 1);
        let stats = broker.stats(QueueName::ImageAnalysis).await.unwrap();
        assert_eq!((stats.failed, stats.delayed), (1, 0));
        assert_eq!(broker.task(QueueName::ImageAnalysis, "bad").await.unwrap().attempts_made, 1);
    }

    #[tokio::test]
    async fn test_progress_reaches_broker() {
        let broker = Arc::new(MemoryBroker::new());
        broker.enqueue(task("slow", QueueName::ImageAnalysis, 2), Duration::ZERO).await.unwrap();

        let mut handler = RecordingHandler::new(Err(TaskError::Retry("later".to_string())));
        handler.progress = Some(50);
        let scheduler = BrokerScheduler::new(broker.clone())
            .register(QueueName::ImageAnalysis, Arc::new(handler))
            .with_idle_interval(Duration::from_millis(5));
        run_for(scheduler, Duration::from_millis(100)).await;

        assert_eq!(broker.progress(QueueName::ImageAnalysis, "slow").await, Some(50));
    }

    #[tokio::test]
    async fn test_admit_uses_tier_priority_and_attempts() {
        let broker = Arc::new(MemoryBroker::new());
        let scheduler = BrokerScheduler::new(broker.clone()).with_attempts(QueueName::ImageAnalysis, 5);
        let job_id = uuid::Uuid::new_v4();

        scheduler
            .enqueue_analysis(AnalysisPayload::Single { job_id }, SubscriptionTier::Premium)
            .await
            .unwrap();
        scheduler
            .enqueue_analysis(AnalysisPayload::Single { job_id }, SubscriptionTier::Premium)
            .await
            .unwrap();

        let queued = broker.task(QueueName::ImageAnalysis, &job_id.to_string()).await.unwrap();
        assert_eq!((queued.priority, queued.max_attempts), (1, 5));
        assert_eq!(broker.stats(QueueName::ImageAnalysis).await.unwrap().waiting, 1);
    }
}
