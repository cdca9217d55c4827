use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobStatus, VerdictCounts, VerificationJob};
use crate::models::verdict::AddressTask;

/// Request to verify a batch of addresses for a workspace. A batch holds at
/// most 100 000 addresses.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BulkVerifyRequest {
    #[garde(skip)]
    pub workspace_id: Uuid,

    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(length(min = 1, max = 100_000), dive)]
    pub emails: Vec<AddressTask>,
}

/// Read-side view of a job: the full record plus derived progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub total_emails: i32,
    #[serde(flatten)]
    pub counts: VerdictCounts,
    pub status: JobStatus,
    pub progress: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<VerificationJob> for JobView {
    fn from(job: VerificationJob) -> Self {
        Self {
            progress: job.progress(),
            id: job.id,
            workspace_id: job.workspace_id,
            name: job.name,
            total_emails: job.total_emails,
            counts: job.counts,
            status: job.status,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error,
            created_at: job.created_at,
        }
    }
}
