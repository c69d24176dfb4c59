//! Job API Handlers
//!
//! Submission and lookup of jobs. Submitting never waits for the job to run.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use darkroom_core::domain::job::{Job, JobPayload};
use darkroom_core::dto::job::{EnqueueJob, EnqueuedJob};
use darkroom_worker::Engine;
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};

/// Rejects submissions the handlers could never complete
fn validate(req: &EnqueueJob) -> Result<(), String> {
    if req.owner_id <= 0 {
        return Err("owner_id must be positive".to_string());
    }

    match &req.payload {
        JobPayload::Training(training) if training.images.is_empty() => {
            Err("training requires at least one image".to_string())
        }
        JobPayload::SingleGeneration(single) if single.prompt.trim().is_empty() => {
            Err("prompt cannot be empty".to_string())
        }
        JobPayload::BatchGeneration(batch) if batch.prompts.is_empty() => {
            Err("batch generation requires at least one prompt".to_string())
        }
        _ => Ok(()),
    }
}

/// POST /jobs
pub async fn enqueue_job(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<EnqueueJob>,
) -> ApiResult<(StatusCode, Json<EnqueuedJob>)> {
    validate(&req).map_err(ApiError::BadRequest)?;

    let job_type = req.payload.job_type();
    let job_id = engine.enqueue_job(req.owner_id, req.payload).await?;
    tracing::info!(job_id = %job_id, owner_id = req.owner_id, "Enqueued {} job", job_type.as_str());

    Ok((StatusCode::ACCEPTED, Json(EnqueuedJob { job_id })))
}

/// GET /jobs
pub async fn list_jobs(State(engine): State<Arc<Engine>>) -> ApiResult<Json<Vec<Job>>> {
    tracing::debug!("Listing all jobs");
    Ok(Json(engine.list_jobs().await?))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    engine
        .get_job_status(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))
}

/// GET /jobs/owner/{owner_id}
pub async fn list_owner_jobs(
    State(engine): State<Arc<Engine>>,
    Path(owner_id): Path<i64>,
) -> ApiResult<Json<Vec<Job>>> {
    tracing::debug!("Listing jobs for owner: {}", owner_id);
    Ok(Json(engine.list_owner_jobs(owner_id).await?))
}
