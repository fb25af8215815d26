use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::analysis::ResultPayload;

/// Lifecycle state of an analysis job.
///
/// `Pending → Started → {Success | Failure}`. A redelivered job may re-enter
/// `Started` under a fresh claim; terminal states never change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Started,
    Success,
    Failure,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Started)
                | (Self::Started, Self::Started)
                | (Self::Started, Self::Success)
                | (Self::Started, Self::Failure)
        )
    }

    /// Coarse progress reported to pollers.
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Started => Some(10),
            Self::Success => Some(100),
            Self::Failure => None,
        }
    }
}

/// Stage marker recorded when a worker claims a job.
pub const STAGE_LOADING: &str = "loading";

/// Terminal payload of a job: a result or an error, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(ResultPayload),
    Failure(String),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Success(_) => JobState::Success,
            Self::Failure(_) => JobState::Failure,
        }
    }
}

/// A tracked analysis job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub state: JobState,
    pub file_path: String,
    pub stage: Option<String>,
    /// Number of times a worker has claimed this job.
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal jobs are reported as not found after this instant.
    pub expires_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl AnalysisJob {
    pub fn new(id: Uuid, file_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: JobState::Pending,
            file_path: file_path.into(),
            stage: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
            expires_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Exclusive right to finalize one job, issued by `JobRegistry::claim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub job_id: Uuid,
    pub token: Uuid,
    pub attempt: i32,
}
