use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::verdict::Verdict;

/// Status of a bulk verification job.
///
/// Transitions are monotonic: `Pending -> Processing -> {Completed | Failed}`.
/// A pending job may also fail directly when it cannot be started at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` respects the state machine.
    /// Re-entering `Processing` is allowed so a redelivered job can resume.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Failed)
        )
    }
}

/// Per-verdict counters plus credits spent. `processed` doubles as the
/// resume cursor into the job's address list.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerdictCounts {
    pub processed: i32,
    pub valid: i32,
    pub invalid: i32,
    pub risky: i32,
    pub catch_all: i32,
    pub unknown: i32,
    pub credits_used: i32,
}

impl VerdictCounts {
    /// Tally one address. `processed` and the matching verdict move together.
    pub fn record(&mut self, verdict: Verdict, credits_used: i32) {
        self.processed += 1;
        self.credits_used += credits_used;
        match verdict {
            Verdict::Valid => self.valid += 1,
            Verdict::Invalid => self.invalid += 1,
            Verdict::Risky => self.risky += 1,
            Verdict::CatchAll => self.catch_all += 1,
            Verdict::Unknown => self.unknown += 1,
        }
    }

    pub fn verdict_total(&self) -> i32 {
        self.valid + self.invalid + self.risky + self.catch_all + self.unknown
    }

    pub fn is_consistent(&self) -> bool {
        self.processed == self.verdict_total()
    }
}

/// A bulk email verification job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationJob {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub total_emails: i32,
    #[serde(flatten)]
    pub counts: VerdictCounts,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub reap_count: i32,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationJob {
    /// Percentage of addresses processed, rounded to the nearest integer.
    pub fn progress(&self) -> i32 {
        if self.total_emails <= 0 {
            return 0;
        }
        ((self.counts.processed as f64 / self.total_emails as f64) * 100.0).round() as i32
    }

    pub fn remaining(&self) -> i32 {
        (self.total_emails - self.counts.processed).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(total: i32, processed: i32) -> VerificationJob {
        let now = Utc::now();
        VerificationJob {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "spring list".to_string(),
            total_emails: total,
            counts: VerdictCounts {
                processed,
                unknown: processed,
                ..Default::default()
            },
            status: JobStatus::Processing,
            started_at: Some(now),
            completed_at: None,
            error: None,
            retry_count: 0,
            reap_count: 0,
            last_checkpoint_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_never_moves_backward() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_status_string_roundtrip_matches_storage() {
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }

    #[test]
    fn test_record_keeps_counts_consistent() {
        let mut counts = VerdictCounts::default();
        counts.record(Verdict::Valid, 1);
        counts.record(Verdict::CatchAll, 1);
        counts.record(Verdict::Unknown, 0);

        assert_eq!(counts.processed, 3);
        assert_eq!(counts.catch_all, 1);
        assert_eq!(counts.credits_used, 2);
        assert!(counts.is_consistent());
    }

    #[test]
    fn test_progress_rounds() {
        assert_eq!(sample_job(3, 1).progress(), 33);
        assert_eq!(sample_job(3, 2).progress(), 67);
        assert_eq!(sample_job(25, 10).progress(), 40);
        assert_eq!(sample_job(0, 0).progress(), 0);
    }

    #[test]
    fn test_counts_serialize_flat() {
        let json = serde_json::to_value(sample_job(4, 2)).unwrap();
        assert_eq!(json["processed"], 2);
        assert_eq!(json["catchAll"], 0);
        assert_eq!(json["status"], "processing");
    }
}
