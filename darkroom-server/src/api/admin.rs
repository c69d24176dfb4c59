//! Administrative API Handlers

use axum::{Json, extract::State};
use darkroom_core::dto::job::ResetSummary;
use darkroom_worker::Engine;
use std::sync::Arc;

use crate::api::error::ApiResult;

/// POST /admin/reset
/// Remove every job record and empty every queue
pub async fn reset_all(State(engine): State<Arc<Engine>>) -> ApiResult<Json<ResetSummary>> {
    let jobs_removed = engine.reset_all().await?;
    tracing::warn!("Administrative reset removed {} job(s)", jobs_removed);

    Ok(Json(ResetSummary { jobs_removed }))
}
