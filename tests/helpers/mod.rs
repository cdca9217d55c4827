//! Test helpers: a scripted classifier, a store with injectable outages, and
//! a harness wiring the in-memory backends together.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use bulk_verify::config::WorkerSettings;
use bulk_verify::models::job::{JobStatus, VerdictCounts, VerificationJob};
use bulk_verify::models::verdict::{AddressResult, AddressTask, Verdict, VerificationSource};
use bulk_verify::models::verification::{BulkVerifyRequest, JobView};
use bulk_verify::services::classifier::{Classification, ClassifyError, Classifier};
use bulk_verify::services::lease::InMemoryWorkspaceLease;
use bulk_verify::services::ledger::{CreditLedger, Debit, InMemoryCreditLedger};
use bulk_verify::services::queue::{Delivery, InMemoryJobQueue, JobOutcome, QueueError, QueueMessage, WorkQueue};
use bulk_verify::services::store::{InMemoryJobStore, JobStore, StoreError};
use bulk_verify::services::submission::submit_job;
use bulk_verify::worker::BulkJobWorker;

/// Classifier honoring the debit-first contract with canned verdicts.
pub struct ScriptedClassifier {
    ledger: Arc<dyn CreditLedger>,
    verdicts: HashMap<String, Verdict>,
    transient: HashSet<String>,
    hang_on_call: AtomicUsize,
    latency: Duration,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn new(ledger: Arc<dyn CreditLedger>) -> Self {
        Self {
            ledger,
            verdicts: HashMap::new(),
            transient: HashSet::new(),
            hang_on_call: AtomicUsize::new(usize::MAX),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_verdict(mut self, email: &str, verdict: Verdict) -> Self {
        self.verdicts.insert(email.to_string(), verdict);
        self
    }

    /// The provider fails for `email` after the credit was debited.
    pub fn with_transient_error(mut self, email: &str) -> Self {
        self.transient.insert(email.to_string());
        self
    }

    /// The provider takes `latency` to answer each debited request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Never return from the `call`-th classification (1-based), as if the
    /// process died mid-request.
    pub fn hang_on_call(&self, call: usize) {
        self.hang_on_call.store(call, Ordering::SeqCst);
    }

    pub fn stop_hanging(&self) {
        self.hang_on_call.store(usize::MAX, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, email: &str) -> usize {
        self.calls.lock().await.iter().filter(|c| *c == email).count()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        task: &AddressTask,
        workspace_id: Uuid,
        _source: VerificationSource,
    ) -> Result<Classification, ClassifyError> {
        let call = {
            let mut calls = self.calls.lock().await;
            calls.push(task.email.clone());
            calls.len()
        };
        if call == self.hang_on_call.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }

        if let Debit::Insufficient = self.ledger.debit(workspace_id, 1).await? {
            return Ok(Classification::InsufficientCredits);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.transient.contains(&task.email) {
            return Err(ClassifyError::Provider {
                message: "upstream timeout".to_string(),
                credits_used: 1,
            });
        }
        Ok(Classification::Verified {
            verdict: self.verdicts.get(&task.email).copied().unwrap_or(Verdict::Valid),
            credits_used: 1,
        })
    }
}

fn connection_lost() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

/// Delegating store whose `checkpoint` can be made to fail, or which can be
/// taken down entirely.
pub struct FlakyStore {
    inner: Arc<InMemoryJobStore>,
    checkpoint_calls: AtomicUsize,
    failing_checkpoints: Mutex<HashSet<usize>>,
    fail_all_checkpoints: AtomicBool,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryJobStore>) -> Self {
        Self {
            inner,
            checkpoint_calls: AtomicUsize::new(0),
            failing_checkpoints: Mutex::new(HashSet::new()),
            fail_all_checkpoints: AtomicBool::new(false),
            down: AtomicBool::new(false),
        }
    }

    /// Fail the `n`-th checkpoint call (1-based).
    pub async fn fail_checkpoint(&self, n: usize) {
        self.failing_checkpoints.lock().await.insert(n);
    }

    pub fn fail_every_checkpoint(&self) {
        self.fail_all_checkpoints.store(true, Ordering::SeqCst);
    }

    /// While down, every read and write fails.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(connection_lost());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(
        &self,
        workspace_id: Uuid,
        name: &str,
        addresses: &[AddressTask],
    ) -> Result<VerificationJob, StoreError> {
        self.check_up()?;
        self.inner.create_job(workspace_id, name, addresses).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
        self.check_up()?;
        self.inner.get_job(job_id).await
    }

    async fn start_job(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
        self.check_up()?;
        self.inner.start_job(job_id).await
    }

    async fn checkpoint(&self, job_id: Uuid, counts: &VerdictCounts) -> Result<bool, StoreError> {
        self.check_up()?;
        let call = self.checkpoint_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_all_checkpoints.load(Ordering::SeqCst)
            || self.failing_checkpoints.lock().await.contains(&call)
        {
            return Err(connection_lost());
        }
        self.inner.checkpoint(job_id, counts).await
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counts: &VerdictCounts,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.check_up()?;
        self.inner.finish_job(job_id, status, counts, error).await
    }

    async fn increment_retry_count(&self, job_id: Uuid) -> Result<i32, StoreError> {
        self.check_up()?;
        self.inner.increment_retry_count(job_id).await
    }

    async fn append_result(
        &self,
        job_id: Uuid,
        position: i32,
        result: &AddressResult,
    ) -> Result<(), StoreError> {
        self.check_up()?;
        self.inner.append_result(job_id, position, result).await
    }

    async fn results(&self, job_id: Uuid) -> Result<Vec<AddressResult>, StoreError> {
        self.check_up()?;
        self.inner.results(job_id).await
    }

    async fn job_addresses(&self, job_id: Uuid) -> Result<Vec<AddressTask>, StoreError> {
        self.check_up()?;
        self.inner.job_addresses(job_id).await
    }

    async fn find_stalled(&self, older_than: DateTime<Utc>) -> Result<Vec<VerificationJob>, StoreError> {
        self.check_up()?;
        self.inner.find_stalled(older_than).await
    }

    async fn record_reap(&self, job_id: Uuid) -> Result<i32, StoreError> {
        self.check_up()?;
        self.inner.record_reap(job_id).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check_up()?;
        self.inner.health_check().await
    }
}

/// Delegating queue whose next `ack` calls can be made to fail.
pub struct FlakyQueue {
    inner: Arc<InMemoryJobQueue>,
    failing_acks: AtomicUsize,
}

impl FlakyQueue {
    pub fn new(inner: Arc<InMemoryJobQueue>) -> Self {
        Self {
            inner,
            failing_acks: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_acks(&self, n: usize) {
        self.failing_acks.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.inner.enqueue(message).await
    }

    async fn enqueue_after(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        self.inner.enqueue_after(message, delay).await
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        self.inner.dequeue().await
    }

    async fn ack(&self, delivery: &Delivery, outcome: JobOutcome) -> Result<(), QueueError> {
        let failing = self
            .failing_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection reset",
            ))));
        }
        self.inner.ack(delivery, outcome).await
    }

    async fn retry(&self, delivery: &Delivery, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        self.inner.retry(delivery, message, delay).await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.inner.depth().await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.inner.health_check().await
    }
}

pub fn test_settings() -> WorkerSettings {
    WorkerSettings {
        checkpoint_interval: 10,
        address_delay: Duration::from_millis(100),
        max_retries: 3,
        retry_base_delay: Duration::from_secs(1),
        retry_max_delay: Duration::from_secs(30),
        lease_ttl: Duration::from_secs(60),
        lease_busy_delay: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        stale_after: Duration::from_secs(600),
        reaper_interval: Duration::from_secs(60),
        max_reaps: 2,
    }
}

pub fn emails(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("lead{i}@example.com")).collect()
}

/// In-memory backends for one workspace.
pub struct Harness {
    pub workspace_id: Uuid,
    pub store: Arc<InMemoryJobStore>,
    pub queue: Arc<InMemoryJobQueue>,
    pub ledger: Arc<InMemoryCreditLedger>,
    pub lease: Arc<InMemoryWorkspaceLease>,
}

impl Harness {
    pub fn with_balance(balance: i64) -> Self {
        let workspace_id = Uuid::new_v4();
        Self {
            workspace_id,
            store: Arc::new(InMemoryJobStore::new()),
            queue: Arc::new(InMemoryJobQueue::default()),
            ledger: Arc::new(InMemoryCreditLedger::with_balance(workspace_id, balance)),
            lease: Arc::new(InMemoryWorkspaceLease::new()),
        }
    }

    pub fn classifier(&self) -> ScriptedClassifier {
        ScriptedClassifier::new(self.ledger.clone())
    }

    pub fn worker(&self, classifier: Arc<ScriptedClassifier>, settings: WorkerSettings) -> BulkJobWorker {
        self.worker_with_store(self.store.clone(), classifier, settings)
    }

    pub fn worker_with_store(
        &self,
        store: Arc<dyn JobStore>,
        classifier: Arc<ScriptedClassifier>,
        settings: WorkerSettings,
    ) -> BulkJobWorker {
        self.worker_with(store, self.queue.clone(), classifier, settings)
    }

    pub fn worker_with(
        &self,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        classifier: Arc<ScriptedClassifier>,
        settings: WorkerSettings,
    ) -> BulkJobWorker {
        BulkJobWorker::new(store, queue, classifier, self.lease.clone(), settings).with_worker_id("worker-a")
    }

    pub async fn submit(&self, addresses: &[String]) -> JobView {
        submit_job(
            self.store.as_ref(),
            self.queue.as_ref(),
            BulkVerifyRequest {
                workspace_id: self.workspace_id,
                name: "imported leads".to_string(),
                emails: addresses.iter().map(AddressTask::new).collect(),
            },
        )
        .await
        .expect("submission failed")
    }

    pub async fn job(&self, job_id: Uuid) -> VerificationJob {
        self.store
            .get_job(job_id)
            .await
            .expect("store error")
            .expect("job not found")
    }
}
