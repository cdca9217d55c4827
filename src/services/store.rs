use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{JobStatus, VerdictCounts, VerificationJob};
use crate::models::verdict::{AddressResult, AddressTask};

/// Durable record of bulk verification jobs.
///
/// Counter writes overwrite rather than increment, so replaying a checkpoint
/// is harmless. Writes against a job that has left PROCESSING are refused
/// (`Ok(false)`), which keeps terminal records immutable.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        workspace_id: Uuid,
        name: &str,
        addresses: &[AddressTask],
    ) -> Result<VerificationJob, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError>;

    /// PENDING -> PROCESSING. Returns the job as stored afterwards; callers
    /// must check for a terminal status.
    async fn start_job(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError>;

    async fn checkpoint(&self, job_id: Uuid, counts: &VerdictCounts) -> Result<bool, StoreError>;

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counts: &VerdictCounts,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn increment_retry_count(&self, job_id: Uuid) -> Result<i32, StoreError>;

    async fn append_result(
        &self,
        job_id: Uuid,
        position: i32,
        result: &AddressResult,
    ) -> Result<(), StoreError>;

    async fn results(&self, job_id: Uuid) -> Result<Vec<AddressResult>, StoreError>;

    async fn job_addresses(&self, job_id: Uuid) -> Result<Vec<AddressTask>, StoreError>;

    async fn find_stalled(&self, older_than: DateTime<Utc>) -> Result<Vec<VerificationJob>, StoreError>;

    async fn record_reap(&self, job_id: Uuid) -> Result<i32, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Store backed by PostgreSQL.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(
        &self,
        workspace_id: Uuid,
        name: &str,
        addresses: &[AddressTask],
    ) -> Result<VerificationJob, StoreError> {
        Ok(queries::create_job(&self.pool, workspace_id, name, addresses).await?)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn start_job(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
        Ok(queries::start_job(&self.pool, job_id).await?)
    }

    async fn checkpoint(&self, job_id: Uuid, counts: &VerdictCounts) -> Result<bool, StoreError> {
        Ok(queries::checkpoint_job(&self.pool, job_id, counts).await?)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counts: &VerdictCounts,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        Ok(queries::finish_job(&self.pool, job_id, status, counts, error).await?)
    }

    async fn increment_retry_count(&self, job_id: Uuid) -> Result<i32, StoreError> {
        Ok(queries::increment_retry_count(&self.pool, job_id).await?)
    }

    async fn append_result(
        &self,
        job_id: Uuid,
        position: i32,
        result: &AddressResult,
    ) -> Result<(), StoreError> {
        Ok(queries::append_result(&self.pool, job_id, position, result).await?)
    }

    async fn results(&self, job_id: Uuid) -> Result<Vec<AddressResult>, StoreError> {
        Ok(queries::get_results(&self.pool, job_id).await?)
    }

    async fn job_addresses(&self, job_id: Uuid) -> Result<Vec<AddressTask>, StoreError> {
        Ok(queries::get_job_addresses(&self.pool, job_id).await?)
    }

    async fn find_stalled(&self, older_than: DateTime<Utc>) -> Result<Vec<VerificationJob>, StoreError> {
        Ok(queries::find_stalled_jobs(&self.pool, older_than).await?)
    }

    async fn record_reap(&self, job_id: Uuid) -> Result<i32, StoreError> {
        Ok(queries::record_reap(&self.pool, job_id).await?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(crate::db::ping(&self.pool).await?)
    }
}

struct StoredJob {
    job: VerificationJob,
    addresses: Vec<AddressTask>,
    results: BTreeMap<i32, AddressResult>,
}

/// In-process store with the same transition rules as the SQL one.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, StoredJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind a job's staleness clock.
    pub async fn set_last_checkpoint(&self, job_id: Uuid, at: DateTime<Utc>) {
        if let Some(stored) = self.jobs.lock().await.get_mut(&job_id) {
            stored.job.last_checkpoint_at = Some(at);
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        workspace_id: Uuid,
        name: &str,
        addresses: &[AddressTask],
    ) -> Result<VerificationJob, StoreError> {
        let now = Utc::now();
        let job = VerificationJob {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.to_string(),
            total_emails: addresses.len() as i32,
            counts: VerdictCounts::default(),
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            reap_count: 0,
            last_checkpoint_at: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().await.insert(
            job.id,
            StoredJob {
                job: job.clone(),
                addresses: addresses.to_vec(),
                results: BTreeMap::new(),
            },
        );
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
        Ok(self.jobs.lock().await.get(&job_id).map(|s| s.job.clone()))
    }

    async fn start_job(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(stored) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let job = &mut stored.job;
        if job.status.can_transition_to(JobStatus::Processing) {
            let now = Utc::now();
            job.status = JobStatus::Processing;
            job.started_at.get_or_insert(now);
            job.last_checkpoint_at = Some(now);
            job.updated_at = now;
        }
        Ok(Some(job.clone()))
    }

    async fn checkpoint(&self, job_id: Uuid, counts: &VerdictCounts) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let job = &mut stored.job;
        if job.status != JobStatus::Processing || counts.processed < job.counts.processed {
            return Ok(false);
        }
        let now = Utc::now();
        job.counts = *counts;
        job.last_checkpoint_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counts: &VerdictCounts,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let job = &mut stored.job;
        if !status.is_terminal() || !job.status.can_transition_to(status) {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = status;
        job.counts = *counts;
        job.error = error.map(str::to_string);
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn increment_retry_count(&self, job_id: Uuid) -> Result<i32, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        stored.job.retry_count += 1;
        Ok(stored.job.retry_count)
    }

    async fn append_result(
        &self,
        job_id: Uuid,
        position: i32,
        result: &AddressResult,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        stored.results.entry(position).or_insert_with(|| result.clone());
        Ok(())
    }

    async fn results(&self, job_id: Uuid) -> Result<Vec<AddressResult>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(&job_id)
            .map(|s| s.results.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn job_addresses(&self, job_id: Uuid) -> Result<Vec<AddressTask>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .await
            .get(&job_id)
            .map(|s| s.addresses.clone())
            .unwrap_or_default())
    }

    async fn find_stalled(&self, older_than: DateTime<Utc>) -> Result<Vec<VerificationJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut stalled: Vec<_> = jobs
            .values()
            .map(|s| &s.job)
            .filter(|job| job.status == JobStatus::Processing)
            .filter(|job| {
                job.last_checkpoint_at
                    .or(job.started_at)
                    .unwrap_or(job.updated_at)
                    < older_than
            })
            .cloned()
            .collect();
        stalled.sort_by_key(|job| job.created_at);
        Ok(stalled)
    }

    async fn record_reap(&self, job_id: Uuid) -> Result<i32, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let now = Utc::now();
        stored.job.reap_count += 1;
        stored.job.last_checkpoint_at = Some(now);
        stored.job.updated_at = now;
        Ok(stored.job.reap_count)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} not found")]
    NotFound(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::verdict::Verdict;

    fn addresses(n: usize) -> Vec<AddressTask> {
        (0..n)
            .map(|i| AddressTask::new(format!("lead{i}@example.com")))
            .collect()
    }

    #[tokio::test]
    async fn test_lifecycle_is_monotonic() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job(Uuid::new_v4(), "q3 leads", &addresses(2))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_emails, 2);

        let started = store.start_job(job.id).await.unwrap().unwrap();
        assert_eq!(started.status, JobStatus::Processing);
        assert!(started.started_at.is_some());

        let mut counts = VerdictCounts::default();
        counts.record(Verdict::Valid, 1);
        counts.record(Verdict::Invalid, 1);
        assert!(store
            .finish_job(job.id, JobStatus::Completed, &counts, None)
            .await
            .unwrap());

        // Terminal records refuse further writes.
        let restarted = store.start_job(job.id).await.unwrap().unwrap();
        assert_eq!(restarted.status, JobStatus::Completed);
        assert!(!store.checkpoint(job.id, &counts).await.unwrap());
        assert!(!store
            .finish_job(job.id, JobStatus::Failed, &counts, Some("late"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_restart_keeps_original_start_time() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job(Uuid::new_v4(), "resume", &addresses(1))
            .await
            .unwrap();

        let first = store.start_job(job.id).await.unwrap().unwrap();
        let second = store.start_job(job.id).await.unwrap().unwrap();
        assert_eq!(first.started_at, second.started_at);
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_cursor_backward() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job(Uuid::new_v4(), "cursor", &addresses(5))
            .await
            .unwrap();
        store.start_job(job.id).await.unwrap();

        let mut ahead = VerdictCounts::default();
        (0..3).for_each(|_| ahead.record(Verdict::Valid, 1));
        assert!(store.checkpoint(job.id, &ahead).await.unwrap());

        let mut behind = VerdictCounts::default();
        behind.record(Verdict::Valid, 1);
        assert!(!store.checkpoint(job.id, &behind).await.unwrap());

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.counts.processed, 3);
    }

    #[tokio::test]
    async fn test_results_are_append_only() {
        let store = InMemoryJobStore::new();
        let job = store
            .create_job(Uuid::new_v4(), "results", &addresses(1))
            .await
            .unwrap();
        let first = AddressResult {
            email: "lead0@example.com".to_string(),
            lead_id: None,
            verdict: Verdict::Valid,
            credits_used: 1,
        };
        let replay = AddressResult {
            verdict: Verdict::Unknown,
            ..first.clone()
        };

        store.append_result(job.id, 0, &first).await.unwrap();
        store.append_result(job.id, 0, &replay).await.unwrap();

        assert_eq!(store.results(job.id).await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_find_stalled_only_returns_processing() {
        let store = InMemoryJobStore::new();
        let workspace = Uuid::new_v4();
        let pending = store.create_job(workspace, "a", &addresses(1)).await.unwrap();
        let running = store.create_job(workspace, "b", &addresses(1)).await.unwrap();
        store.start_job(running.id).await.unwrap();
        store
            .set_last_checkpoint(running.id, Utc::now() - chrono::Duration::minutes(30))
            .await;

        let stalled = store
            .find_stalled(Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, running.id);
        assert_ne!(stalled[0].id, pending.id);
    }
}
