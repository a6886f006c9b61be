use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

use super::limiter::ConcurrencyLimiter;
use super::worker::{NoProgress, Worker};
use super::{Scheduler, SchedulerError, SchedulerMode};
use crate::models::job::AnalysisJob;
use crate::models::queue::{QueueName, SubscriptionTier};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Turns the job table into a queue: every `interval` it claims as many
/// pending rows as there are free slots and runs each through the worker.
///
/// Cross-process exclusion comes from the store's skip-locked claim; the
/// limiter only bounds this instance.
pub struct PollingScheduler {
    worker: Worker,
    limiter: ConcurrencyLimiter,
    interval: Duration,
    retry_backoff: Option<Duration>,
    drain_timeout: Duration,
}

impl PollingScheduler {
    pub fn new(worker: Worker, max_concurrent_jobs: usize, interval: Duration) -> Self {
        Self {
            worker,
            limiter: ConcurrencyLimiter::new(max_concurrent_jobs),
            interval,
            retry_backoff: None,
            drain_timeout: Duration::from_secs(30),
        }
    }

    /// Hold a retried row back for `base * 2^retry_count` after its last failure.
    pub fn with_retry_backoff(mut self, base: Option<Duration>) -> Self {
        self.retry_backoff = base;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// One polling pass. Returns how many jobs were admitted.
    #[instrument(name = "polling.tick", skip(self), fields(available = tracing::field::Empty, claimed = tracing::field::Empty))]
    pub async fn tick(&self) -> usize {
        let store = self.worker.store();

        match store.queue_paused(QueueName::ImageAnalysis).await {
            Ok(true) => {
                tracing::debug!("Analysis queue paused, not admitting");
                return 0;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, "Failed to read queue state");
                return 0;
            }
        }

        let available = self.limiter.available();
        tracing::Span::current().record("available", available);
        if available == 0 {
            return 0;
        }

        let jobs = match store.claim_pending(available, self.retry_backoff).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to claim pending jobs, will retry next tick");
                return 0;
            }
        };
        tracing::Span::current().record("claimed", jobs.len());

        self.dispatch(jobs).await
    }

    /// Start each claimed job under its own slot. A job that cannot take a
    /// slot goes back to `pending` untouched instead of running over the cap.
    /// Returns how many were started.
    async fn dispatch(&self, jobs: Vec<AnalysisJob>) -> usize {
        let store = self.worker.store();
        let mut started = 0;

        for job in jobs {
            let Some(slot) = self.limiter.admit(job.id) else {
                tracing::warn!(job_id = %job.id, "Claimed job could not take a local slot, releasing");
                if let Err(e) = store.release_claim(job.id).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to release claimed job");
                }
                continue;
            };

            let worker = self.worker.clone();
            tokio::spawn(async move {
                let _slot = slot;
                let job_id = job.id;
                if let Err(e) = worker.process(job, &NoProgress).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                }
            });
            started += 1;
        }
        started
    }

    /// Wait for in-flight jobs to finish, up to the drain timeout.
    async fn drain(&self) {
        let waited = tokio::time::timeout(self.drain_timeout, async {
            while self.limiter.in_flight() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await;
        if waited.is_err() {
            tracing::warn!(in_flight = self.limiter.in_flight(), "Shutting down with jobs still in flight");
        }
    }
}

#[async_trait]
impl Scheduler for PollingScheduler {
    fn mode(&self) -> SchedulerMode {
        SchedulerMode::Polling
    }

    /// A pending row is all the polling path needs.
    async fn admit(&self, _job: &AnalysisJob, _tier: SubscriptionTier) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn admit_batch(&self, _jobs: &[AnalysisJob], _tier: SubscriptionTier) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            max_concurrent_jobs = self.limiter.cap(),
            "Polling scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
        }

        tracing::info!("Polling scheduler stopping");
        self.drain().await;
    }
}
