//! Metrics API Handlers
//!
//! Queue metrics, worker pool status and model cache occupancy.

use axum::{
    Json,
    extract::{Path, State},
};
use darkroom_core::domain::metrics::{CacheStats, OwnerMetrics, QueueMetrics};
use darkroom_core::domain::worker::PoolStatus;
use darkroom_worker::Engine;
use std::sync::Arc;

use crate::api::error::ApiResult;

/// GET /metrics
pub async fn get_metrics(State(engine): State<Arc<Engine>>) -> ApiResult<Json<QueueMetrics>> {
    tracing::debug!("Computing queue metrics");
    Ok(Json(engine.get_queue_metrics().await?))
}

/// GET /metrics/owner/{owner_id}
pub async fn get_owner_metrics(
    State(engine): State<Arc<Engine>>,
    Path(owner_id): Path<i64>,
) -> ApiResult<Json<OwnerMetrics>> {
    tracing::debug!("Computing metrics for owner: {}", owner_id);
    Ok(Json(engine.get_owner_metrics(owner_id).await?))
}

/// GET /pool
pub async fn get_pool_status(State(engine): State<Arc<Engine>>) -> ApiResult<Json<PoolStatus>> {
    Ok(Json(engine.get_worker_pool_status().await?))
}

/// GET /cache
pub async fn get_cache_stats(State(engine): State<Arc<Engine>>) -> Json<CacheStats> {
    Json(engine.cache_stats().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_engine;
    use darkroom_core::domain::job::{JobPayload, SubjectProfile, TrainingPayload};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_metrics_reflect_pending_jobs() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir).await;
        let payload = JobPayload::Training(TrainingPayload {
            model_id: 1,
            images: vec!["/a.jpg".to_string()],
            subject: SubjectProfile::default(),
        });
        engine.enqueue_job(1, payload.clone()).await.unwrap();
        engine.enqueue_job(2, payload).await.unwrap();

        let Json(metrics) = get_metrics(State(engine.clone())).await.unwrap();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.pending, 2);

        let Json(owner) = get_owner_metrics(State(engine.clone()), Path(2)).await.unwrap();
        assert_eq!(owner.metrics.total, 1);

        let Json(pool) = get_pool_status(State(engine.clone())).await.unwrap();
        assert_eq!(pool.active_workers, 0);
        assert_eq!(pool.queue_size, 2);

        let Json(cache) = get_cache_stats(State(engine)).await;
        assert_eq!(cache.entries, 0);
    }
}
