use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{JobStore, StoreError};
use crate::models::job::{AnalysisJob, JobStatus, NewAnalysisJob, StatusCounts};
use crate::models::queue::{DailyAt, QueueName};

/// In-process job store for development and tests. Claims happen under one
/// lock, which gives the same mutual exclusion as `FOR UPDATE SKIP LOCKED`.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, StoredJob>,
    next_seq: u64,
    paused: HashSet<QueueName>,
    cleanup: Option<DailyAt>,
}

struct StoredJob {
    seq: u64,
    job: AnalysisJob,
    image: Vec<u8>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job, oldest first.
    pub async fn all_jobs(&self) -> Vec<AnalysisJob> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state.jobs.values().collect();
        jobs.sort_by_key(|s| s.seq);
        jobs.into_iter().map(|s| s.job.clone()).collect()
    }
}

fn is_eligible(job: &AnalysisJob, retry_backoff: Option<Duration>) -> bool {
    let now = Utc::now();
    if job.status != JobStatus::Pending || job.expires_at.is_some_and(|at| at <= now) {
        return false;
    }
    !backing_off(job, retry_backoff)
}

/// Whether a retried row is still inside its `base * 2^retry_count` wait.
fn backing_off(job: &AnalysisJob, retry_backoff: Option<Duration>) -> bool {
    match retry_backoff {
        Some(base) if job.retry_count > 0 => {
            let wait = base.saturating_mul(2u32.saturating_pow(job.retry_count as u32));
            chrono::Duration::from_std(wait)
                .map(|wait| job.updated_at + wait > Utc::now())
                .unwrap_or(true)
        }
        _ => false,
    }
}

fn start(job: &mut AnalysisJob) {
    let now = Utc::now();
    job.status = JobStatus::Processing;
    job.started_at.get_or_insert(now);
    job.updated_at = now;
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob, StoreError> {
        let now = Utc::now();
        let job = AnalysisJob {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            image_ref: new.image_ref,
            image_content_type: new.image_content_type,
            meal_type: new.meal_type,
            status: JobStatus::Pending,
            result: None,
            produced_meal_id: None,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            expires_at: new.expires_at,
        };

        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job.id,
            StoredJob {
                seq,
                job: job.clone(),
                image: new.image_data,
            },
        );
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid, owner: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .get(&job_id)
            .filter(|s| s.job.user_id == owner)
            .map(|s| s.job.clone()))
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|s| s.job.clone()))
    }

    async fn list_jobs(&self, owner: Uuid, limit: i64) -> Result<Vec<AnalysisJob>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state.jobs.values().filter(|s| s.job.user_id == owner).collect();
        jobs.sort_by_key(|s| std::cmp::Reverse(s.seq));
        Ok(jobs
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|s| s.job.clone())
            .collect())
    }

    async fn load_image(&self, job_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|s| s.image.clone()))
    }

    async fn claim_pending(
        &self,
        limit: usize,
        retry_backoff: Option<Duration>,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        let mut state = self.state.lock().await;
        let mut eligible: Vec<(u64, Uuid)> = state
            .jobs
            .values()
            .filter(|s| is_eligible(&s.job, retry_backoff))
            .map(|s| (s.seq, s.job.id))
            .collect();
        eligible.sort_unstable();

        let mut claimed = Vec::new();
        for (_, id) in eligible.into_iter().take(limit) {
            if let Some(stored) = state.jobs.get_mut(&id) {
                start(&mut stored.job);
                claimed.push(stored.job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(stored) if is_eligible(&stored.job, None) => {
                start(&mut stored.job);
                Ok(Some(stored.job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn reclaim_abandoned(&self, job_id: Uuid, stale_after: Duration) -> Result<Option<AnalysisJob>, StoreError> {
        let stale_after =
            chrono::Duration::from_std(stale_after).map_err(|_| StoreError::InvalidStaleAfter(stale_after))?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(stored) if stored.job.status == JobStatus::Processing && stored.job.updated_at < now - stale_after => {
                stored.job.updated_at = now;
                Ok(Some(stored.job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_claim(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(stored) if stored.job.status == JobStatus::Processing => {
                stored.job.status = JobStatus::Pending;
                stored.job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: &serde_json::Value,
        meal_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = match state.jobs.get_mut(&job_id) {
            Some(stored) if stored.job.status == JobStatus::Processing => &mut stored.job,
            _ => {
                return Err(StoreError::StaleTransition {
                    job_id,
                    expected: JobStatus::Processing,
                })
            }
        };
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.result = Some(result.clone());
        job.produced_meal_id = Some(meal_id);
        job.error = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        retry_count: i32,
        status: JobStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = match state.jobs.get_mut(&job_id) {
            Some(stored) if stored.job.status == JobStatus::Processing => &mut stored.job,
            _ => {
                return Err(StoreError::StaleTransition {
                    job_id,
                    expected: JobStatus::Processing,
                })
            }
        };
        let now = Utc::now();
        job.status = status;
        job.error = Some(error.to_string());
        job.retry_count = job.retry_count.max(retry_count);
        if status == JobStatus::Failed {
            job.completed_at = Some(now);
        }
        job.updated_at = now;
        Ok(())
    }

    async fn delete_expired(&self, retention: Duration) -> Result<u64, StoreError> {
        let retention =
            chrono::Duration::from_std(retention).map_err(|_| StoreError::InvalidRetention(retention))?;
        let cutoff = Utc::now() - retention;
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, s| {
            !(s.job.status == JobStatus::Completed && s.job.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn count_by_status(&self, retry_backoff: Option<Duration>) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for stored in state.jobs.values() {
            match stored.job.status {
                JobStatus::Pending => {
                    counts.pending += 1;
                    if backing_off(&stored.job, retry_backoff) {
                        counts.backing_off += 1;
                    }
                }
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn queue_paused(&self, queue: QueueName) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.paused.contains(&queue))
    }

    async fn set_queue_paused(&self, queue: QueueName, paused: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if paused {
            state.paused.insert(queue);
        } else {
            state.paused.remove(&queue);
        }
        Ok(())
    }

    async fn cleanup_schedule(&self) -> Result<Option<DailyAt>, StoreError> {
        Ok(self.state.lock().await.cleanup)
    }

    async fn set_cleanup_schedule(&self, at: DailyAt) -> Result<(), StoreError> {
        self.state.lock().await.cleanup = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::MealType;
    use std::sync::Arc;

    fn new_job(owner: Uuid) -> NewAnalysisJob {
        NewAnalysisJob {
            user_id: owner,
            image_ref: "plate.jpg".to_string(),
            image_content_type: "image/jpeg".to_string(),
            image_data: vec![0xFF, 0xD8, 0xFF],
            meal_type: MealType::Lunch,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_get_job_hides_other_owners() {
        let store = MemoryJobStore::new();
        let owner = Uuid::new_v4();
        let job = store.create_job(new_job(owner)).await.unwrap();

        assert!(store.get_job(job.id, owner).await.unwrap().is_some());
        assert!(store.get_job(job.id, Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.get_job(Uuid::new_v4(), owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_job_is_idempotent() {
        let store = MemoryJobStore::new();
        let owner = Uuid::new_v4();
        let job = store.create_job(new_job(owner)).await.unwrap();

        let first = store.get_job(job.id, owner).await.unwrap();
        let second = store.get_job(job.id, owner).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first() {
        let store = MemoryJobStore::new();
        let owner = Uuid::new_v4();
        let first = store.create_job(new_job(owner)).await.unwrap();
        let second = store.create_job(new_job(owner)).await.unwrap();
        store.create_job(new_job(Uuid::new_v4())).await.unwrap();

        let jobs = store.list_jobs(owner, 10).await.unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert_eq!(store.list_jobs(owner, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_oldest_first_and_bounded() {
        let store = MemoryJobStore::new();
        let owner = Uuid::new_v4();
        let a = store.create_job(new_job(owner)).await.unwrap();
        let b = store.create_job(new_job(owner)).await.unwrap();
        store.create_job(new_job(owner)).await.unwrap();

        let claimed = store.claim_pending(2, None).await.unwrap();
        assert_eq!(claimed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Processing && j.started_at.is_some()));
        assert_eq!(store.claim_pending(5, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_job() {
        let store = Arc::new(MemoryJobStore::new());
        store.create_job(new_job(Uuid::new_v4())).await.unwrap();

        let (left, right) = tokio::join!(store.claim_pending(3, None), store.claim_pending(3, None));
        let total = left.unwrap().len() + right.unwrap().len();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_expired_pending_jobs_are_not_claimed() {
        let store = MemoryJobStore::new();
        let mut expired = new_job(Uuid::new_v4());
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.create_job(expired).await.unwrap();

        assert!(store.claim_pending(3, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_backoff_holds_back_failed_rows() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        store.claim_pending(1, None).await.unwrap();
        store
            .record_failure(job.id, "HTTP 503", 1, JobStatus::Pending)
            .await
            .unwrap();

        let backoff = Some(Duration::from_secs(60));
        assert!(store.claim_pending(1, backoff).await.unwrap().is_empty());
        assert_eq!(store.claim_pending(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_rows_reject_further_writes() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        store.mark_processing(job.id).await.unwrap();
        store
            .record_failure(job.id, "unsupported format", 1, JobStatus::Failed)
            .await
            .unwrap();

        let err = store
            .complete_job(job.id, &serde_json::json!({}), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleTransition { .. }));
        assert!(store.mark_processing(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_expired_only_removes_old_completed() {
        let store = MemoryJobStore::new();
        let owner = Uuid::new_v4();
        let done = store.create_job(new_job(owner)).await.unwrap();
        let failed = store.create_job(new_job(owner)).await.unwrap();
        store.create_job(new_job(owner)).await.unwrap();

        store.claim_pending(2, None).await.unwrap();
        store
            .complete_job(done.id, &serde_json::json!({"dish_name": "Ramen"}), Uuid::new_v4())
            .await
            .unwrap();
        store
            .record_failure(failed.id, "unsupported format", 1, JobStatus::Failed)
            .await
            .unwrap();

        assert_eq!(store.delete_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.delete_expired(Duration::ZERO).await.unwrap(), 1);
        assert!(store.find_job(done.id).await.unwrap().is_none());
        assert!(store.find_job(failed.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reclaim_takes_only_stale_processing_rows() {
        let store = Arc::new(MemoryJobStore::new());
        let pending = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        let running = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        store.mark_processing(running.id).await.unwrap();

        assert!(store.reclaim_abandoned(pending.id, Duration::ZERO).await.unwrap().is_none());
        assert!(store
            .reclaim_abandoned(running.id, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let (left, right) = tokio::join!(
            store.reclaim_abandoned(running.id, Duration::from_millis(1)),
            store.reclaim_abandoned(running.id, Duration::from_millis(1))
        );
        let taken = [left.unwrap(), right.unwrap()];
        assert_eq!(taken.iter().flatten().count(), 1);
        assert_eq!(store.find_job(running.id).await.unwrap().unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_release_returns_claimed_row_without_attempt() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();

        assert!(!store.release_claim(job.id).await.unwrap());
        store.claim_pending(1, None).await.unwrap();
        assert!(store.release_claim(job.id).await.unwrap());

        let stored = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(store.claim_pending(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_counts_backing_off_only_while_backoff_holds() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        store.mark_processing(job.id).await.unwrap();
        store
            .record_failure(job.id, "HTTP 503", 1, JobStatus::Pending)
            .await
            .unwrap();

        let immediate = store.count_by_status(None).await.unwrap();
        assert_eq!((immediate.pending, immediate.backing_off), (2, 0));

        let held = store.count_by_status(Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!((held.pending, held.backing_off), (2, 1));

        let elapsed = store.count_by_status(Some(Duration::ZERO)).await.unwrap();
        assert_eq!(elapsed.backing_off, 0);
    }
}
