use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::models::job::JobStatus;
use crate::services::queue::{QueueMessage, WorkQueue};
use crate::services::store::JobStore;
use crate::worker::WorkerError;

pub const STALLED_JOB_ERROR: &str = "Verification stalled: no progress within deadline";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: usize,
    pub failed: usize,
}

/// Finds jobs stuck in PROCESSING (no checkpoint within `stale_after`) and
/// either requeues them from their cursor or, after `max_reaps` attempts,
/// fails them.
pub struct Reaper {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    stale_after: Duration,
    interval: Duration,
    max_reaps: i32,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        stale_after: Duration,
        interval: Duration,
        max_reaps: i32,
    ) -> Self {
        Self {
            store,
            queue,
            stale_after,
            interval,
            max_reaps,
        }
    }

    pub async fn reap_once(&self) -> Result<ReapReport, WorkerError> {
        let older_than = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|stale_after| Utc::now().checked_sub_signed(stale_after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = ReapReport::default();
        for job in self.store.find_stalled(older_than).await? {
            if job.reap_count >= self.max_reaps {
                if self
                    .store
                    .finish_job(job.id, JobStatus::Failed, &job.counts, Some(STALLED_JOB_ERROR))
                    .await?
                {
                    report.failed += 1;
                    metrics::counter!("bulk_jobs_failed_total").increment(1);
                    tracing::warn!(
                        job_id = %job.id,
                        reap_count = job.reap_count,
                        processed = job.counts.processed,
                        "Stalled job failed after repeated requeues"
                    );
                }
                continue;
            }

            let reap_count = self.store.record_reap(job.id).await?;
            let addresses = self.store.job_addresses(job.id).await?;
            let message = QueueMessage::new(job.id, job.workspace_id, addresses)
                .with_cursor(job.counts.processed.max(0) as usize);
            self.queue.enqueue(&message).await?;

            report.requeued += 1;
            metrics::counter!("bulk_jobs_reaped_total").increment(1);
            tracing::warn!(
                job_id = %job.id,
                reap_count,
                cursor = message.cursor,
                "Stalled job requeued from checkpoint"
            );
        }
        Ok(report)
    }
}

pub(crate) async fn run_reaper_loop(reaper: Arc<Reaper>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = sleep(reaper.interval) => {}
            _ = shutdown.cancelled() => break,
        }

        match reaper.reap_once().await {
            Ok(report) if report != ReapReport::default() => {
                tracing::info!(requeued = report.requeued, failed = report.failed, "Reaper pass finished");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Reaper pass failed"),
        }
    }
}
