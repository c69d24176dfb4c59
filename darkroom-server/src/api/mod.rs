//! API Module
//!
//! HTTP API layer over the job engine.
//! Each submodule handles endpoints for a specific domain.

pub mod admin;
pub mod error;
pub mod health;
pub mod jobs;
pub mod metrics;

use axum::{
    Router,
    routing::{get, post},
};
use darkroom_worker::Engine;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the main API router with all endpoints
pub fn create_router(engine: Arc<Engine>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Job endpoints
        .route("/jobs", post(jobs::enqueue_job))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/owner/{owner_id}", get(jobs::list_owner_jobs))
        // Monitoring endpoints
        .route("/metrics", get(metrics::get_metrics))
        .route("/metrics/owner/{owner_id}", get(metrics::get_owner_metrics))
        .route("/pool", get(metrics::get_pool_status))
        .route("/cache", get(metrics::get_cache_stats))
        // Administration
        .route("/admin/reset", post(admin::reset_all))
        // Add state and middleware
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
}

/// Engine over the in-memory store whose pool is never started
#[cfg(test)]
pub(crate) async fn test_engine(dir: &tempfile::TempDir) -> Arc<Engine> {
    use async_trait::async_trait;
    use darkroom_core::domain::job::Job;
    use darkroom_worker::Config;
    use darkroom_worker::cache::ModelCache;
    use darkroom_worker::collaborators::LocalStorage;
    use darkroom_worker::pool::JobHandler;
    use darkroom_worker::store::MemoryStore;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn handle(&self, _job: &Job) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn on_terminal_failure(&self, _job: &Job, _error: &str) {}
    }

    let storage = Arc::new(LocalStorage::new(dir.path().join("storage")));
    let cache = ModelCache::open(dir.path().join("cache"), 1024, storage)
        .await
        .unwrap();

    Arc::new(Engine::new(
        Config::new("memory://".to_string()),
        Arc::new(MemoryStore::new()),
        Arc::new(NoopHandler),
        Arc::new(cache),
    ))
}
