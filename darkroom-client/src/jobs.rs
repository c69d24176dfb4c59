//! Job endpoints

use darkroom_core::domain::job::{Job, JobPayload};
use darkroom_core::dto::job::{EnqueueJob, EnqueuedJob, ResetSummary};

use crate::DarkroomClient;
use crate::error::Result;

impl DarkroomClient {
    /// Submit a job, returning its id
    ///
    /// The server only queues the job; poll [`get_job`](Self::get_job) for progress.
    pub async fn enqueue_job(&self, owner_id: i64, payload: JobPayload) -> Result<String> {
        let url = format!("{}/jobs", self.base_url);
        let req = EnqueueJob { owner_id, payload };
        let response = self.client.post(&url).json(&req).send().await?;

        let enqueued: EnqueuedJob = self.handle_response(response).await?;
        Ok(enqueued.job_id)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let url = format!("{}/jobs", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    pub async fn list_owner_jobs(&self, owner_id: i64) -> Result<Vec<Job>> {
        let url = format!("{}/jobs/owner/{}", self.base_url, owner_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Remove every job and empty every queue
    pub async fn reset_all(&self) -> Result<usize> {
        let url = format!("{}/admin/reset", self.base_url);
        let response = self.client.post(&url).send().await?;

        let summary: ResetSummary = self.handle_response(response).await?;
        Ok(summary.jobs_removed)
    }
}
