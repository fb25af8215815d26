use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use std::path::{Path as FsPath, PathBuf};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{ErrorResponse, JobResultResponse, JobStatusResponse, SubmittedJob, UploadResponse};
use crate::models::job::{AnalysisJob, JobState};
use crate::services::dispatcher;
use crate::services::queue::QueuedJob;

/// Upper bound on file parts in one upload request.
pub const MAX_FILES_PER_REQUEST: usize = 16;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}

/// POST /api/upload: Stage one or more files and enqueue one job per file.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(e.status(), e.body_text()))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| api_error(e.status(), e.body_text()))?;

        if data.len() > state.max_upload_bytes {
            return Err(api_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "{} exceeds {}MB",
                    filename,
                    state.max_upload_bytes / (1024 * 1024)
                ),
            ));
        }
        files.push((filename, data.to_vec()));
        if files.len() > MAX_FILES_PER_REQUEST {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("At most {MAX_FILES_PER_REQUEST} files per request"),
            ));
        }
    }

    if files.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No files provided"));
    }

    // Reject the whole request before staging anything.
    for (filename, _) in &files {
        dispatcher::classify(FsPath::new(filename))
            .map_err(|e| api_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string()))?;
    }

    let mut jobs = Vec::with_capacity(files.len());
    let mut staged = Vec::with_capacity(files.len());
    for (filename, data) in files {
        let job_id = match submit_file(&state, &filename, &data, &mut staged).await {
            Ok(job_id) => job_id,
            Err(e) => {
                roll_back(&state, &staged).await;
                return Err(e);
            }
        };
        tracing::info!(job_id = %job_id, filename = %filename, bytes = data.len(), "Job submitted");
        jobs.push(SubmittedJob { job_id, filename });
    }

    metrics::counter!("analysis_jobs_submitted_total").increment(jobs.len() as u64);
    Ok(Json(UploadResponse { jobs }))
}

/// Stage, register and enqueue one file. Anything staged is recorded in
/// `staged` before the next step can fail.
async fn submit_file(
    state: &AppState,
    filename: &str,
    data: &[u8],
    staged: &mut Vec<(Uuid, PathBuf)>,
) -> Result<Uuid, ApiError> {
    let job_id = Uuid::new_v4();
    let path = state.staging.stage(job_id, filename, data).await.map_err(|e| {
        tracing::error!(filename = %filename, error = %e, "Failed to stage upload");
        api_error(StatusCode::BAD_REQUEST, e.to_string())
    })?;
    let file_path = path.to_string_lossy().into_owned();
    staged.push((job_id, path));

    state.registry.create(job_id, &file_path).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to register job");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to register job")
    })?;
    state
        .queue
        .enqueue(&QueuedJob::new(job_id, file_path))
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to enqueue job");
            api_error(StatusCode::SERVICE_UNAVAILABLE, "Job queue unavailable")
        })?;
    Ok(job_id)
}

/// Undo a partially accepted upload. Jobs a worker already claimed are left
/// to finish along with their files.
async fn roll_back(state: &AppState, staged: &[(Uuid, PathBuf)]) {
    for (job_id, path) in staged {
        match state.registry.discard(*job_id).await {
            Ok(true) => {
                if let Err(e) = state.staging.remove(path).await {
                    tracing::error!(job_id = %job_id, path = %path.display(), error = %e, "Failed to remove staged upload");
                }
            }
            Ok(false) => {
                tracing::warn!(job_id = %job_id, "Job already claimed; keeping it despite failed upload");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to discard job during rollback");
            }
        }
    }
}

async fn load_job(state: &AppState, job_id: Uuid) -> Result<AnalysisJob, ApiError> {
    match state.registry.get(job_id).await {
        Ok(Some(job)) => Ok(job),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("Job {job_id} not found"))),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Registry lookup failed");
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "Job registry unavailable"))
        }
    }
}

/// GET /api/status/{job_id}: Current state with coarse progress.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = load_job(&state, job_id).await?;

    Ok(Json(JobStatusResponse {
        job_id,
        state: job.state,
        progress: job.state.progress(),
        stage: if job.state == JobState::Started { job.stage } else { None },
        result: if job.state == JobState::Success { job.result } else { None },
        error: if job.state == JobState::Failure { job.error } else { None },
    }))
}

/// GET /api/result/{job_id}: Final payload once the job is terminal.
pub async fn get_job_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobResultResponse>), ApiError> {
    let job = load_job(&state, job_id).await?;

    let response = match job.state {
        JobState::Pending | JobState::Started => (
            StatusCode::OK,
            JobResultResponse {
                job_id,
                ready: false,
                state: Some(job.state),
                result: None,
                error: None,
            },
        ),
        JobState::Success => (
            StatusCode::OK,
            JobResultResponse {
                job_id,
                ready: true,
                state: None,
                result: job.result,
                error: None,
            },
        ),
        JobState::Failure => (
            StatusCode::INTERNAL_SERVER_ERROR,
            JobResultResponse {
                job_id,
                ready: true,
                state: None,
                result: None,
                error: job.error,
            },
        ),
    };

    Ok((response.0, Json(response.1)))
}
