use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{AnalysisJob, Claim, JobOutcome, JobState, STAGE_LOADING};

/// Default retention for terminal jobs.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Job state store keyed by job id.
///
/// Transitions are compare-and-set: `claim` moves a live job to STARTED and
/// hands out a fresh token, and only the holder of the latest token can
/// write the terminal outcome.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn create(&self, job_id: Uuid, file_path: &str) -> Result<AnalysisJob, RegistryError>;

    /// Current job, or `None` when unknown or past retention.
    async fn get(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, RegistryError>;

    async fn claim(&self, job_id: Uuid) -> Result<Claim, RegistryError>;

    async fn finish(&self, claim: &Claim, outcome: JobOutcome) -> Result<(), RegistryError>;

    /// Mark a STARTED job as FAILURE regardless of who holds the claim.
    /// Returns `false` if the job was not in STARTED.
    async fn abandon(&self, job_id: Uuid, reason: &str) -> Result<bool, RegistryError>;

    /// Drop a job whose submission was rolled back. Returns `true` once the
    /// job is gone, `false` if a worker has already claimed it.
    async fn discard(&self, job_id: Uuid) -> Result<bool, RegistryError>;

    /// Delete expired terminal jobs, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, RegistryError>;

    async fn health_check(&self) -> Result<(), RegistryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {job_id} already finished with state {state}")]
    AlreadyFinished { job_id: Uuid, state: JobState },

    #[error("Claim on job {0} is no longer held")]
    ClaimLost(Uuid),

    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("In-memory registry lock poisoned")]
    Poisoned,
}

fn outcome_columns(
    outcome: JobOutcome,
) -> Result<(JobState, Option<serde_json::Value>, Option<String>), RegistryError> {
    Ok(match outcome {
        JobOutcome::Success(payload) => (JobState::Success, Some(serde_json::to_value(payload)?), None),
        JobOutcome::Failure(error) => (JobState::Failure, None, Some(error)),
    })
}

/// Expiry instant for a job finishing at `now`; `None` if the TTL overflows.
fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// PostgreSQL-backed registry.
pub struct PgJobRegistry {
    pool: PgPool,
    ttl: Duration,
}

impl PgJobRegistry {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl JobRegistry for PgJobRegistry {
    async fn create(&self, job_id: Uuid, file_path: &str) -> Result<AnalysisJob, RegistryError> {
        Ok(queries::create_job(&self.pool, job_id, file_path).await?)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, RegistryError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn claim(&self, job_id: Uuid) -> Result<Claim, RegistryError> {
        let token = Uuid::new_v4();
        if let Some(job) = queries::claim_job(&self.pool, job_id, token, STAGE_LOADING).await? {
            return Ok(Claim {
                job_id,
                token,
                attempt: job.attempts,
            });
        }
        match queries::get_job(&self.pool, job_id).await? {
            Some(job) => Err(RegistryError::AlreadyFinished {
                job_id,
                state: job.state,
            }),
            None => Err(RegistryError::NotFound(job_id)),
        }
    }

    async fn finish(&self, claim: &Claim, outcome: JobOutcome) -> Result<(), RegistryError> {
        let (state, result, error) = outcome_columns(outcome)?;
        let updated = queries::finish_job(
            &self.pool,
            claim.job_id,
            claim.token,
            state,
            result,
            error.as_deref(),
            self.ttl.as_secs_f64(),
        )
        .await?;
        if updated {
            Ok(())
        } else {
            Err(RegistryError::ClaimLost(claim.job_id))
        }
    }

    async fn abandon(&self, job_id: Uuid, reason: &str) -> Result<bool, RegistryError> {
        Ok(queries::abandon_job(&self.pool, job_id, reason, self.ttl.as_secs_f64()).await?)
    }

    async fn discard(&self, job_id: Uuid) -> Result<bool, RegistryError> {
        if queries::discard_pending_job(&self.pool, job_id).await? {
            return Ok(true);
        }
        Ok(queries::get_job(&self.pool, job_id).await?.is_none())
    }

    async fn purge_expired(&self) -> Result<u64, RegistryError> {
        Ok(queries::purge_expired_jobs(&self.pool).await?)
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct Entry {
    job: AnalysisJob,
    token: Option<Uuid>,
}

/// Process-local registry, for tests and single-node runs.
pub struct InMemoryJobRegistry {
    jobs: Mutex<HashMap<Uuid, Entry>>,
    ttl: Duration,
}

impl InMemoryJobRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Jobs currently held, including expired ones not yet purged.
    pub fn job_count(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    fn finalize(&self, entry: &mut Entry, state: JobState, result: Option<serde_json::Value>, error: Option<String>) {
        let now = Utc::now();
        entry.job.state = state;
        entry.job.result = result;
        entry.job.error = error;
        entry.job.updated_at = now;
        entry.job.finished_at = Some(now);
        entry.job.expires_at = expiry(now, self.ttl);
        entry.token = None;
    }
}

impl Default for InMemoryJobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_TTL)
    }
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn create(&self, job_id: Uuid, file_path: &str) -> Result<AnalysisJob, RegistryError> {
        let mut jobs = self.jobs.lock().map_err(|_| RegistryError::Poisoned)?;
        if jobs.contains_key(&job_id) {
            return Err(RegistryError::Duplicate(job_id));
        }
        let job = AnalysisJob::new(job_id, file_path);
        jobs.insert(
            job_id,
            Entry {
                job: job.clone(),
                token: None,
            },
        );
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, RegistryError> {
        let jobs = self.jobs.lock().map_err(|_| RegistryError::Poisoned)?;
        let now = Utc::now();
        Ok(jobs
            .get(&job_id)
            .filter(|e| !e.job.is_expired(now))
            .map(|e| e.job.clone()))
    }

    async fn claim(&self, job_id: Uuid) -> Result<Claim, RegistryError> {
        let mut jobs = self.jobs.lock().map_err(|_| RegistryError::Poisoned)?;
        let now = Utc::now();
        let entry = jobs
            .get_mut(&job_id)
            .filter(|e| !e.job.is_expired(now))
            .ok_or(RegistryError::NotFound(job_id))?;

        if !entry.job.state.can_transition_to(JobState::Started) {
            return Err(RegistryError::AlreadyFinished {
                job_id,
                state: entry.job.state,
            });
        }

        let token = Uuid::new_v4();
        entry.job.state = JobState::Started;
        entry.job.stage = Some(STAGE_LOADING.to_string());
        entry.job.attempts += 1;
        entry.job.updated_at = now;
        entry.token = Some(token);

        Ok(Claim {
            job_id,
            token,
            attempt: entry.job.attempts,
        })
    }

    async fn finish(&self, claim: &Claim, outcome: JobOutcome) -> Result<(), RegistryError> {
        let (state, result, error) = outcome_columns(outcome)?;
        let mut jobs = self.jobs.lock().map_err(|_| RegistryError::Poisoned)?;
        let entry = jobs
            .get_mut(&claim.job_id)
            .ok_or(RegistryError::NotFound(claim.job_id))?;

        if entry.job.state != JobState::Started || entry.token != Some(claim.token) {
            return Err(RegistryError::ClaimLost(claim.job_id));
        }
        self.finalize(entry, state, result, error);
        Ok(())
    }

    async fn abandon(&self, job_id: Uuid, reason: &str) -> Result<bool, RegistryError> {
        let mut jobs = self.jobs.lock().map_err(|_| RegistryError::Poisoned)?;
        match jobs.get_mut(&job_id) {
            Some(entry) if entry.job.state == JobState::Started => {
                self.finalize(entry, JobState::Failure, None, Some(reason.to_string()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn discard(&self, job_id: Uuid) -> Result<bool, RegistryError> {
        let mut jobs = self.jobs.lock().map_err(|_| RegistryError::Poisoned)?;
        match jobs.get(&job_id) {
            None => Ok(true),
            Some(entry) if entry.job.state == JobState::Pending => {
                jobs.remove(&job_id);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<u64, RegistryError> {
        let mut jobs = self.jobs.lock().map_err(|_| RegistryError::Poisoned)?;
        let now = Utc::now();
        let before = jobs.len();
        jobs.retain(|_, e| !e.job.is_expired(now));
        Ok((before - jobs.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}
