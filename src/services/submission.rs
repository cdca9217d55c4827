use garde::Validate;
use uuid::Uuid;

use crate::models::verification::{BulkVerifyRequest, JobView};
use crate::services::queue::{QueueError, QueueMessage, WorkQueue};
use crate::services::store::{JobStore, StoreError};

/// Validate a bulk request, create its PENDING job and enqueue it.
///
/// Malformed requests never reach the store or the queue.
pub async fn submit_job(
    store: &dyn JobStore,
    queue: &dyn WorkQueue,
    request: BulkVerifyRequest,
) -> Result<JobView, SubmissionError> {
    request
        .validate()
        .map_err(|report| SubmissionError::Validation(report.to_string()))?;

    let job = store
        .create_job(request.workspace_id, &request.name, &request.emails)
        .await?;
    let message = QueueMessage::new(job.id, job.workspace_id, request.emails);
    queue.enqueue(&message).await?;

    metrics::counter!("bulk_jobs_submitted_total").increment(1);
    tracing::info!(
        job_id = %job.id,
        workspace_id = %job.workspace_id,
        total_emails = job.total_emails,
        "Bulk verification job submitted"
    );

    Ok(job.into())
}

/// Fetch a job with its derived progress.
pub async fn fetch_job(store: &dyn JobStore, job_id: Uuid) -> Result<Option<JobView>, StoreError> {
    Ok(store.get_job(job_id).await?.map(JobView::from))
}

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
