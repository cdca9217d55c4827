use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{JobStatus, VerdictCounts, VerificationJob};
use crate::models::verdict::{AddressResult, AddressTask, Verdict};

const JOB_COLUMNS: &str = r#"
    id, workspace_id, name, total_emails, processed, valid, invalid, risky,
    catch_all, unknown, credits_used, status, started_at, completed_at, error,
    retry_count, reap_count, last_checkpoint_at, created_at, updated_at
"#;

fn job_from_row(row: &PgRow) -> Result<VerificationJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(VerificationJob {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        name: row.try_get("name")?,
        total_emails: row.try_get("total_emails")?,
        counts: VerdictCounts {
            processed: row.try_get("processed")?,
            valid: row.try_get("valid")?,
            invalid: row.try_get("invalid")?,
            risky: row.try_get("risky")?,
            catch_all: row.try_get("catch_all")?,
            unknown: row.try_get("unknown")?,
            credits_used: row.try_get("credits_used")?,
        },
        status,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
        reap_count: row.try_get("reap_count")?,
        last_checkpoint_at: row.try_get("last_checkpoint_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new PENDING job together with its address payload
pub async fn create_job(
    pool: &PgPool,
    workspace_id: Uuid,
    name: &str,
    addresses: &[AddressTask],
) -> Result<VerificationJob, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO verification_jobs (workspace_id, name, total_emails, status, addresses)
        VALUES ($1, $2, $3, 'pending', $4)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(workspace_id)
    .bind(name)
    .bind(addresses.len() as i32)
    .bind(Json(addresses))
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<VerificationJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM verification_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Move a job into PROCESSING. `started_at` is set only on first entry so a
/// resumed job keeps its original start time. Terminal jobs are returned
/// untouched.
pub async fn start_job(pool: &PgPool, job_id: Uuid) -> Result<Option<VerificationJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE verification_jobs
        SET status = 'processing',
            started_at = COALESCE(started_at, NOW()),
            last_checkpoint_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'processing')
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => Ok(Some(job_from_row(&r)?)),
        None => get_job(pool, job_id).await,
    }
}

/// Overwrite progress counters. The counters are also the resume cursor, so
/// this single statement is both the checkpoint and the cursor advance.
/// Returns false when the job is no longer PROCESSING or the write would move
/// `processed` backward.
pub async fn checkpoint_job(
    pool: &PgPool,
    job_id: Uuid,
    counts: &VerdictCounts,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE verification_jobs
        SET processed = $2, valid = $3, invalid = $4, risky = $5,
            catch_all = $6, unknown = $7, credits_used = $8,
            last_checkpoint_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing' AND processed <= $2
        "#,
    )
    .bind(job_id)
    .bind(counts.processed)
    .bind(counts.valid)
    .bind(counts.invalid)
    .bind(counts.risky)
    .bind(counts.catch_all)
    .bind(counts.unknown)
    .bind(counts.credits_used)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Terminal transition with final counters
pub async fn finish_job(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
    counts: &VerdictCounts,
    error: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE verification_jobs
        SET status = $2,
            processed = $3, valid = $4, invalid = $5, risky = $6,
            catch_all = $7, unknown = $8, credits_used = $9,
            error = $10,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'processing')
        "#,
    )
    .bind(job_id)
    .bind(status.to_string())
    .bind(counts.processed)
    .bind(counts.valid)
    .bind(counts.invalid)
    .bind(counts.risky)
    .bind(counts.catch_all)
    .bind(counts.unknown)
    .bind(counts.credits_used)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Increment retry count
pub async fn increment_retry_count(pool: &PgPool, job_id: Uuid) -> Result<i32, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE verification_jobs
        SET retry_count = retry_count + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING retry_count
        "#,
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;

    row.try_get("retry_count")
}

/// Append a per-address result. Replays of the same position are ignored.
pub async fn append_result(
    pool: &PgPool,
    job_id: Uuid,
    position: i32,
    result: &AddressResult,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO verification_results (job_id, position, email, lead_id, verdict, credits_used)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (job_id, position) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(position)
    .bind(&result.email)
    .bind(result.lead_id)
    .bind(result.verdict.to_string())
    .bind(result.credits_used)
    .execute(pool)
    .await?;

    Ok(())
}

/// Results recorded for a job, in address order
pub async fn get_results(pool: &PgPool, job_id: Uuid) -> Result<Vec<AddressResult>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT email, lead_id, verdict, credits_used
        FROM verification_results
        WHERE job_id = $1
        ORDER BY position ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            let verdict: String = r.try_get("verdict")?;
            Ok(AddressResult {
                email: r.try_get("email")?,
                lead_id: r.try_get("lead_id")?,
                verdict: verdict
                    .parse::<Verdict>()
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
                credits_used: r.try_get("credits_used")?,
            })
        })
        .collect()
}

/// Address payload stored at submission time
pub async fn get_job_addresses(pool: &PgPool, job_id: Uuid) -> Result<Vec<AddressTask>, sqlx::Error> {
    let row = sqlx::query("SELECT addresses FROM verification_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => {
            let Json(addresses): Json<Vec<AddressTask>> = r.try_get("addresses")?;
            Ok(addresses)
        }
        None => Ok(Vec::new()),
    }
}

/// PROCESSING jobs whose last sign of progress is older than `older_than`
pub async fn find_stalled_jobs(
    pool: &PgPool,
    older_than: DateTime<Utc>,
) -> Result<Vec<VerificationJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM verification_jobs
        WHERE status = 'processing'
          AND COALESCE(last_checkpoint_at, started_at, updated_at) < $1
        ORDER BY created_at ASC
        "#
    ))
    .bind(older_than)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Count a reap and reset the staleness clock so the job is not picked
/// again before its redelivery runs.
pub async fn record_reap(pool: &PgPool, job_id: Uuid) -> Result<i32, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE verification_jobs
        SET reap_count = reap_count + 1,
            last_checkpoint_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
        RETURNING reap_count
        "#,
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;

    row.try_get("reap_count")
}

/// Debit credits if the balance covers the amount. Returns the remaining
/// balance, or `None` when the debit was rejected (nothing is written).
pub async fn debit_credits(
    pool: &PgPool,
    workspace_id: Uuid,
    amount: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE workspace_credits
        SET balance = balance - $2, updated_at = NOW()
        WHERE workspace_id = $1 AND balance >= $2
        RETURNING balance
        "#,
    )
    .bind(workspace_id)
    .bind(amount)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get("balance")).transpose()
}

/// Current balance (zero for a workspace with no ledger row)
pub async fn credit_balance(pool: &PgPool, workspace_id: Uuid) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT balance FROM workspace_credits WHERE workspace_id = $1")
        .bind(workspace_id)
        .fetch_optional(pool)
        .await?;

    Ok(match row {
        Some(r) => r.try_get("balance")?,
        None => 0,
    })
}

/// Add credits, creating the ledger row on first grant
pub async fn grant_credits(pool: &PgPool, workspace_id: Uuid, amount: i64) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO workspace_credits (workspace_id, balance)
        VALUES ($1, $2)
        ON CONFLICT (workspace_id)
        DO UPDATE SET balance = workspace_credits.balance + EXCLUDED.balance, updated_at = NOW()
        RETURNING balance
        "#,
    )
    .bind(workspace_id)
    .bind(amount)
    .fetch_one(pool)
    .await?;

    row.try_get("balance")
}
