use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{AnalysisJob, JobState};

const JOB_COLUMNS: &str = "id, status, file_path, stage, attempts, created_at, updated_at, \
                           finished_at, expires_at, result, error";

fn job_from_row(row: &PgRow) -> Result<AnalysisJob, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let state = JobState::from_str(&status).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: Box::new(e),
    })?;

    Ok(AnalysisJob {
        id: row.try_get("id")?,
        state,
        file_path: row.try_get("file_path")?,
        stage: row.try_get("stage")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
        expires_at: row.try_get("expires_at")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
    })
}

/// Insert a new PENDING job
pub async fn create_job(
    pool: &PgPool,
    job_id: Uuid,
    file_path: &str,
) -> Result<AnalysisJob, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO analysis_jobs (id, status, file_path)
        VALUES ($1, 'PENDING', $2)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(file_path)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID, hiding rows past their retention window
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM analysis_jobs
        WHERE id = $1
          AND (expires_at IS NULL OR expires_at > NOW())
        "#
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Delete a job that no worker has claimed yet
pub async fn discard_pending_job(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let done = sqlx::query(
        r#"
        DELETE FROM analysis_jobs
        WHERE id = $1
          AND status = 'PENDING'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

/// Move a live job to STARTED under a new claim token.
///
/// Returns `None` when the job is terminal or missing.
pub async fn claim_job(
    pool: &PgPool,
    job_id: Uuid,
    token: Uuid,
    stage: &str,
) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE analysis_jobs
        SET status = 'STARTED',
            stage = $3,
            claim_token = $2,
            attempts = attempts + 1,
            started_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
          AND status IN ('PENDING', 'STARTED')
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(token)
    .bind(stage)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Write the terminal outcome if `token` still holds the claim.
pub async fn finish_job(
    pool: &PgPool,
    job_id: Uuid,
    token: Uuid,
    status: JobState,
    result: Option<serde_json::Value>,
    error: Option<&str>,
    ttl_secs: f64,
) -> Result<bool, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = $3,
            result = $4,
            error = $5,
            claim_token = NULL,
            updated_at = NOW(),
            finished_at = NOW(),
            expires_at = NOW() + make_interval(secs => $6)
        WHERE id = $1
          AND claim_token = $2
          AND status = 'STARTED'
        "#,
    )
    .bind(job_id)
    .bind(token)
    .bind(status.to_string())
    .bind(result)
    .bind(error)
    .bind(ttl_secs)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

/// Fail a STARTED job whose worker never finished it
pub async fn abandon_job(
    pool: &PgPool,
    job_id: Uuid,
    reason: &str,
    ttl_secs: f64,
) -> Result<bool, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = 'FAILURE',
            error = $2,
            result = NULL,
            claim_token = NULL,
            updated_at = NOW(),
            finished_at = NOW(),
            expires_at = NOW() + make_interval(secs => $3)
        WHERE id = $1
          AND status = 'STARTED'
        "#,
    )
    .bind(job_id)
    .bind(reason)
    .bind(ttl_secs)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

/// Delete terminal jobs past retention
pub async fn purge_expired_jobs(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        DELETE FROM analysis_jobs
        WHERE expires_at IS NOT NULL
          AND expires_at <= NOW()
        "#,
    )
    .execute(pool)
    .await?;

    Ok(done.rows_affected())
}
