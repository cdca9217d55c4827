//! Bulk verification worker.
//!
//! One worker instance runs one job at a time and classifies its addresses
//! strictly in order, pausing before each call. Progress is checkpointed
//! every `checkpoint_interval` addresses; the checkpointed `processed`
//! counter is the resume cursor for any redelivery of the job.

pub mod reaper;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::models::job::{JobStatus, VerdictCounts, VerificationJob};
use crate::models::verdict::{AddressResult, AddressTask, Verdict, VerificationSource};
use crate::services::classifier::{Classification, Classifier};
use crate::services::lease::{LeaseError, WorkspaceLease};
use crate::services::queue::{backoff_delay, Delivery, JobOutcome, QueueError, WorkQueue};
use crate::services::store::{JobStore, StoreError};

pub use reaper::{ReapReport, Reaper};

pub const INSUFFICIENT_CREDITS_ERROR: &str = "Insufficient credits to complete verification";

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed(VerdictCounts),
    /// Credits ran out; the job is FAILED with the counts reached.
    CreditsExhausted(VerdictCounts),
    /// Retries exhausted; the job is FAILED.
    Failed,
    /// Job already terminal or missing; nothing was done.
    Skipped,
    /// Another worker holds the workspace lease; redelivered later.
    Deferred,
    /// Infrastructure error; redelivered after backoff.
    Retrying { attempt: i32 },
    /// Shutdown requested mid-job; redelivered from the checkpoint.
    Interrupted { processed: i32 },
}

enum RunOutcome {
    Completed(VerdictCounts),
    CreditsExhausted(VerdictCounts),
    AlreadyTerminal,
    Interrupted(VerdictCounts),
}

pub struct BulkJobWorker {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    classifier: Arc<dyn Classifier>,
    lease: Arc<dyn WorkspaceLease>,
    settings: WorkerSettings,
    worker_id: String,
}

impl BulkJobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        classifier: Arc<dyn Classifier>,
        lease: Arc<dyn WorkspaceLease>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            classifier,
            lease,
            settings,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Process the next job from the queue.
    /// Returns `Ok(None)` if no job was available.
    pub async fn process_next(&self, shutdown: &CancellationToken) -> Result<Option<Disposition>, WorkerError> {
        let Some(delivery) = self.queue.dequeue().await? else {
            return Ok(None);
        };

        tracing::info!(
            job_id = %delivery.message.job_id,
            workspace_id = %delivery.message.workspace_id,
            addresses = delivery.message.addresses.len(),
            cursor = delivery.message.cursor,
            "Processing bulk verification job"
        );

        let disposition = match self.handle(&delivery, shutdown).await {
            Ok(disposition) => disposition,
            Err(e) => self.handle_failure(&delivery, e).await?,
        };
        Ok(Some(disposition))
    }

    async fn handle(&self, delivery: &Delivery, shutdown: &CancellationToken) -> Result<Disposition, WorkerError> {
        let message = &delivery.message;

        let job = match self.store.get_job(message.job_id).await? {
            Some(job) if !job.status.is_terminal() => job,
            Some(job) => {
                tracing::info!(job_id = %job.id, status = %job.status, "Job already finished, skipping redelivery");
                self.queue.ack(delivery, JobOutcome::Skipped).await?;
                return Ok(Disposition::Skipped);
            }
            None => {
                tracing::warn!(job_id = %message.job_id, "Job record not found, dropping message");
                self.queue.ack(delivery, JobOutcome::Skipped).await?;
                return Ok(Disposition::Skipped);
            }
        };

        let acquired = self
            .lease
            .try_acquire(job.workspace_id, &self.worker_id, self.settings.lease_ttl)
            .await?;
        if !acquired {
            tracing::info!(
                job_id = %job.id,
                workspace_id = %job.workspace_id,
                delay_ms = self.settings.lease_busy_delay.as_millis() as u64,
                "Workspace busy with another bulk job, deferring"
            );
            self.queue
                .retry(delivery, message, self.settings.lease_busy_delay)
                .await?;
            return Ok(Disposition::Deferred);
        }

        let outcome = tokio::select! {
            outcome = self.run_job(&job, &message.addresses, shutdown) => outcome,
            lost = self.hold_lease(job.workspace_id) => Err(lost),
        };

        if let Err(e) = self.lease.release(job.workspace_id, &self.worker_id).await {
            tracing::warn!(workspace_id = %job.workspace_id, error = %e, "Failed to release workspace lease");
        }

        match outcome? {
            RunOutcome::Completed(counts) => {
                self.queue.ack(delivery, JobOutcome::Completed).await?;
                Ok(Disposition::Completed(counts))
            }
            RunOutcome::CreditsExhausted(counts) => {
                self.queue.ack(delivery, JobOutcome::Failed).await?;
                Ok(Disposition::CreditsExhausted(counts))
            }
            RunOutcome::AlreadyTerminal => {
                self.queue.ack(delivery, JobOutcome::Skipped).await?;
                Ok(Disposition::Skipped)
            }
            RunOutcome::Interrupted(counts) => {
                let resume = message.with_cursor(counts.processed as usize);
                self.queue.retry(delivery, &resume, Duration::ZERO).await?;
                tracing::info!(job_id = %job.id, processed = counts.processed, "Job interrupted by shutdown, requeued");
                Ok(Disposition::Interrupted {
                    processed: counts.processed,
                })
            }
        }
    }

    async fn run_job(
        &self,
        job: &VerificationJob,
        addresses: &[AddressTask],
        shutdown: &CancellationToken,
    ) -> Result<RunOutcome, WorkerError> {
        let started = self
            .store
            .start_job(job.id)
            .await?
            .ok_or(StoreError::NotFound(job.id))?;
        if started.status.is_terminal() {
            return Ok(RunOutcome::AlreadyTerminal);
        }

        let mut counts = started.counts;
        let resume_at = counts.processed.max(0) as usize;
        if job.status == JobStatus::Pending {
            metrics::counter!("bulk_jobs_started_total").increment(1);
            tracing::info!(job_id = %job.id, total_emails = started.total_emails, "Job started");
        } else {
            tracing::info!(
                job_id = %job.id,
                processed = counts.processed,
                remaining = started.remaining(),
                "Resuming job from checkpoint"
            );
        }
        if addresses.len() != started.total_emails as usize {
            tracing::warn!(
                job_id = %job.id,
                payload = addresses.len(),
                total_emails = started.total_emails,
                "Payload size differs from job record"
            );
        }

        let attempt_started = Instant::now();
        let mut since_checkpoint = 0u32;

        for (position, task) in addresses.iter().enumerate().skip(resume_at) {
            if shutdown.is_cancelled() {
                if since_checkpoint > 0 && !self.checkpoint(&started, &counts).await? {
                    return Ok(RunOutcome::AlreadyTerminal);
                }
                return Ok(RunOutcome::Interrupted(counts));
            }

            sleep(self.settings.address_delay).await;

            let (verdict, credits_used) = match self
                .classifier
                .classify(task, started.workspace_id, VerificationSource::Bulk)
                .await
            {
                Ok(Classification::Verified { verdict, credits_used }) => (verdict, credits_used),
                Ok(Classification::InsufficientCredits) => {
                    return self.fail_for_credits(&started, counts).await;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        position,
                        error = %e,
                        "Address classification failed, recording as unknown"
                    );
                    (Verdict::Unknown, e.credits_used())
                }
            };

            counts.record(verdict, credits_used);
            metrics::counter!("bulk_addresses_processed_total", "verdict" => verdict.to_string()).increment(1);
            self.store
                .append_result(
                    job.id,
                    position as i32,
                    &AddressResult {
                        email: task.email.clone(),
                        lead_id: task.lead_id,
                        verdict,
                        credits_used,
                    },
                )
                .await?;

            since_checkpoint += 1;
            if since_checkpoint >= self.settings.checkpoint_interval {
                if !self.checkpoint(&started, &counts).await? {
                    return Ok(RunOutcome::AlreadyTerminal);
                }
                since_checkpoint = 0;
            }
        }

        if since_checkpoint > 0 && !self.checkpoint(&started, &counts).await? {
            return Ok(RunOutcome::AlreadyTerminal);
        }
        if !self
            .store
            .finish_job(job.id, JobStatus::Completed, &counts, None)
            .await?
        {
            return Ok(RunOutcome::AlreadyTerminal);
        }

        metrics::counter!("bulk_jobs_completed_total").increment(1);
        metrics::histogram!("bulk_job_duration_seconds").record(attempt_started.elapsed().as_secs_f64());
        tracing::info!(
            job_id = %job.id,
            processed = counts.processed,
            valid = counts.valid,
            invalid = counts.invalid,
            risky = counts.risky,
            catch_all = counts.catch_all,
            unknown = counts.unknown,
            credits_used = counts.credits_used,
            "Job completed"
        );
        Ok(RunOutcome::Completed(counts))
    }

    /// Persist counters. Returns false if the job left PROCESSING behind our
    /// back (e.g. the reaper failed it).
    async fn checkpoint(&self, job: &VerificationJob, counts: &VerdictCounts) -> Result<bool, WorkerError> {
        if !self.store.checkpoint(job.id, counts).await? {
            tracing::warn!(job_id = %job.id, "Job no longer processing, abandoning attempt");
            return Ok(false);
        }
        tracing::debug!(job_id = %job.id, processed = counts.processed, "Checkpoint written");
        Ok(true)
    }

    /// Renew the workspace lease every third of its TTL while a job runs.
    /// Resolves only when the lease has been lost to someone else.
    async fn hold_lease(&self, workspace_id: Uuid) -> WorkerError {
        let every = (self.settings.lease_ttl / 3).max(Duration::from_millis(10));
        loop {
            sleep(every).await;
            match self
                .lease
                .extend(workspace_id, &self.worker_id, self.settings.lease_ttl)
                .await
            {
                Ok(true) => tracing::trace!(%workspace_id, "Workspace lease renewed"),
                Ok(false) => return WorkerError::LeaseLost(workspace_id),
                // A lease that lapses during the outage surfaces as Ok(false) later.
                Err(e) => tracing::warn!(%workspace_id, error = %e, "Failed to renew workspace lease"),
            }
        }
    }

    async fn fail_for_credits(&self, job: &VerificationJob, counts: VerdictCounts) -> Result<RunOutcome, WorkerError> {
        if !self
            .store
            .finish_job(job.id, JobStatus::Failed, &counts, Some(INSUFFICIENT_CREDITS_ERROR))
            .await?
        {
            return Ok(RunOutcome::AlreadyTerminal);
        }
        metrics::counter!("bulk_credit_exhaustions_total").increment(1);
        metrics::counter!("bulk_jobs_failed_total").increment(1);
        tracing::warn!(
            job_id = %job.id,
            workspace_id = %job.workspace_id,
            processed = counts.processed,
            total_emails = job.total_emails,
            "Credits exhausted, job failed"
        );
        Ok(RunOutcome::CreditsExhausted(counts))
    }

    /// Job-level failure: retry with backoff from the last checkpoint, or
    /// fail the job once retries are used up. The store may be down as well,
    /// so the message's own cursor and attempt count keep the retry going
    /// without it.
    async fn handle_failure(&self, delivery: &Delivery, error: WorkerError) -> Result<Disposition, WorkerError> {
        let message = &delivery.message;
        tracing::error!(job_id = %message.job_id, error = %error, "Job attempt failed");

        if let Err(e) = self.lease.release(message.workspace_id, &self.worker_id).await {
            tracing::warn!(workspace_id = %message.workspace_id, error = %e, "Failed to release workspace lease");
        }

        let stored = match self.store.get_job(message.job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                tracing::info!(job_id = %job.id, status = %job.status, "Job already finished, acknowledging delivery");
                self.queue.ack(delivery, JobOutcome::Skipped).await?;
                return Ok(Disposition::Skipped);
            }
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                tracing::warn!(job_id = %message.job_id, "Job record not found, dropping message");
                self.queue.ack(delivery, JobOutcome::Skipped).await?;
                return Ok(Disposition::Skipped);
            }
            Err(e) => {
                tracing::warn!(job_id = %message.job_id, error = %e, "Could not load job, retrying from message cursor");
                None
            }
        };

        let attempt = match self.store.increment_retry_count(message.job_id).await {
            Ok(retry_count) => retry_count.max(message.attempts + 1),
            Err(e) => {
                tracing::warn!(job_id = %message.job_id, error = %e, "Could not record retry, using message attempt count");
                message.attempts + 1
            }
        };

        if attempt >= self.settings.max_retries {
            if let Some(job) = &stored {
                let reason = format!("Verification failed after {attempt} attempts: {error}");
                match self
                    .store
                    .finish_job(job.id, JobStatus::Failed, &job.counts, Some(&reason))
                    .await
                {
                    Ok(true) => {
                        self.queue.ack(delivery, JobOutcome::Failed).await?;
                        metrics::counter!("bulk_jobs_failed_total").increment(1);
                        tracing::warn!(job_id = %job.id, retry_count = attempt, "Job failed after max retries");
                        return Ok(Disposition::Failed);
                    }
                    Ok(false) => {
                        self.queue.ack(delivery, JobOutcome::Skipped).await?;
                        return Ok(Disposition::Skipped);
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Could not mark job failed, retrying");
                    }
                }
            }
        }

        let cursor = stored
            .map(|job| job.counts.processed.max(0) as usize)
            .unwrap_or(message.cursor);
        let delay = backoff_delay(attempt, self.settings.retry_base_delay, self.settings.retry_max_delay);
        let next = message.with_cursor(cursor).with_attempts(attempt);
        self.queue.retry(delivery, &next, delay).await?;

        metrics::counter!("bulk_jobs_retried_total").increment(1);
        tracing::info!(
            job_id = %message.job_id,
            retry_count = attempt,
            cursor = next.cursor,
            delay_ms = delay.as_millis() as u64,
            "Job re-queued for retry"
        );
        Ok(Disposition::Retrying { attempt })
    }

    async fn record_queue_depth(&self) {
        if let Ok(depth) = self.queue.depth().await {
            metrics::gauge!("bulk_queue_depth").set(depth as f64);
        }
    }
}

/// Owns the worker loop and the reaper, with an explicit start/stop lifecycle.
pub struct WorkerService {
    worker: Arc<BulkJobWorker>,
    reaper: Arc<Reaper>,
}

impl WorkerService {
    pub fn new(worker: BulkJobWorker, reaper: Reaper) -> Self {
        Self {
            worker: Arc::new(worker),
            reaper: Arc::new(reaper),
        }
    }

    pub fn start(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        tracing::info!(worker_id = %self.worker.worker_id(), "Worker ready, starting job processing loop");

        let worker_task = tokio::spawn(run_worker_loop(Arc::clone(&self.worker), shutdown.clone()));
        let reaper_task = tokio::spawn(reaper::run_reaper_loop(Arc::clone(&self.reaper), shutdown.clone()));

        WorkerHandle {
            shutdown,
            tasks: vec![worker_task, reaper_task],
        }
    }
}

pub struct WorkerHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown and wait for the loops to finish. A job in progress
    /// stops at the next address boundary and is requeued from its cursor.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker stopped");
    }
}

async fn run_worker_loop(worker: Arc<BulkJobWorker>, shutdown: CancellationToken) {
    let poll_interval = worker.settings().poll_interval;

    while !shutdown.is_cancelled() {
        match worker.process_next(&shutdown).await {
            Ok(Some(disposition)) => {
                tracing::debug!(?disposition, "Job processed, checking for next job");
                worker.record_queue_depth().await;
            }
            Ok(None) => {
                tracing::trace!("No jobs available, sleeping");
                worker.record_queue_depth().await;
                tokio::select! {
                    _ = sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                tokio::select! {
                    _ = sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Workspace lease for {0} was lost mid-job")]
    LeaseLost(Uuid),
}
