//! Monitoring endpoints

use darkroom_core::domain::metrics::{CacheStats, OwnerMetrics, QueueMetrics};
use darkroom_core::domain::worker::PoolStatus;

use crate::DarkroomClient;
use crate::error::{ClientError, Result};

impl DarkroomClient {
    pub async fn get_metrics(&self) -> Result<QueueMetrics> {
        let url = format!("{}/metrics", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    pub async fn get_owner_metrics(&self, owner_id: i64) -> Result<OwnerMetrics> {
        let url = format!("{}/metrics/owner/{}", self.base_url, owner_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    pub async fn get_pool_status(&self) -> Result<PoolStatus> {
        let url = format!("{}/pool", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    pub async fn get_cache_stats(&self) -> Result<CacheStats> {
        let url = format!("{}/cache", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Returns true when the server answers its health check
    pub async fn health(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) if e.is_connect() => Ok(false),
            Err(e) => Err(ClientError::RequestFailed(e)),
        }
    }
}
