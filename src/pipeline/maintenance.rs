use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::broker::{Broker, BrokerError};
use super::store::{JobStore, StoreError};
use crate::models::queue::{DailyAt, QueueName, Task};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Delete completed jobs past the retention horizon.
pub async fn run_cleanup(store: &dyn JobStore, retention: Duration) -> Result<u64, StoreError> {
    let deleted = store.delete_expired(retention).await?;
    tracing::info!(deleted, retention_secs = retention.as_secs(), "Expired jobs cleaned up");
    Ok(deleted)
}

/// Deterministic task id of the cleanup occurrence at `at`, so enqueueing the
/// same occurrence twice is a no-op.
pub fn cleanup_task_id(at: DateTime<Utc>) -> String {
    format!("cleanup:{}", at.format("%Y%m%dT%H%MZ"))
}

/// Enqueue the first occurrence of `schedule` strictly after `now` as a delayed
/// cleanup task. Returns when it will run.
pub async fn enqueue_next_cleanup(
    broker: &dyn Broker,
    schedule: DailyAt,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, BrokerError> {
    let next = schedule.next_after(now);
    let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let task = Task::new(
        cleanup_task_id(next),
        QueueName::Cleanup,
        serde_json::to_value(schedule)?,
        1,
    );

    if broker.enqueue(task, delay).await? {
        tracing::info!(next_run_at = %next, "Cleanup occurrence scheduled");
    }
    Ok(next)
}

/// The cleanup occurrence the polling loop is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPlan {
    pub schedule: DailyAt,
    pub next_run: DateTime<Utc>,
}

/// Decide at `now` whether cleanup is due under the stored `schedule`, and
/// which occurrence to wait for next. A plan made for a different schedule is
/// discarded and re-planned from `now`.
pub fn plan_cleanup(planned: Option<CleanupPlan>, schedule: DailyAt, now: DateTime<Utc>) -> (bool, CleanupPlan) {
    let next_run = match planned {
        Some(plan) if plan.schedule == schedule => plan.next_run,
        _ => schedule.next_after(now),
    };

    if now >= next_run {
        let plan = CleanupPlan {
            schedule,
            next_run: schedule.next_after(now),
        };
        (true, plan)
    } else {
        (false, CleanupPlan { schedule, next_run })
    }
}

/// Runs the daily cleanup for the polling deployment, where there is no broker
/// to hold the delayed occurrence. The schedule is re-read on every check so an
/// operator change takes effect without a restart.
pub struct MaintenanceLoop {
    store: Arc<dyn JobStore>,
    retention: Duration,
    check_interval: Duration,
}

impl MaintenanceLoop {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            check_interval: CHECK_INTERVAL,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut planned: Option<CleanupPlan> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.store.cleanup_schedule().await {
                Ok(Some(schedule)) => {
                    let (due, plan) = plan_cleanup(planned, schedule, Utc::now());
                    if due {
                        if let Err(e) = run_cleanup(self.store.as_ref(), self.retention).await {
                            tracing::error!(error = %e, "Cleanup failed");
                        }
                    }
                    planned = Some(plan);
                }
                Ok(None) => planned = None,
                Err(e) => tracing::error!(error = %e, "Failed to read cleanup schedule"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
}
