//! Worker pool
//!
//! - `worker`: the pool of job-processing workers
//! - `supervisor`: scaling, stuck-job recovery and alert delivery on a fixed tick
//! - `alerts`: the in-process alert queue and its handlers

mod alerts;
mod supervisor;
mod worker;

use async_trait::async_trait;
use darkroom_core::domain::alert::{Alert, AlertKind};
use darkroom_core::domain::job::{Job, JobOutcome, JobStatus};
use serde_json::Value as JsonValue;
use tracing::{error, warn};

use crate::queue::JobQueue;

pub use alerts::{AlertHandler, AlertHub};
pub use supervisor::{ScaleDecision, Supervisor, TickReport, scaling_decision};
pub use worker::WorkerPool;

/// Runs jobs of every type
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs the job to completion, returning the result stored on the record
    async fn handle(&self, job: &Job) -> anyhow::Result<JsonValue>;

    /// Called once when a job ends FAILED with its retry budget spent
    async fn on_terminal_failure(&self, job: &Job, error: &str);
}

/// Marks `job` FAILED, then runs the failure bookkeeping and raises an alert of `kind`
///
/// Bookkeeping and the alert only happen if this call made the transition,
/// so a job is alerted at most once.
pub(crate) async fn fail_job(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    alerts: &AlertHub,
    job: &Job,
    error: &str,
    kind: AlertKind,
) -> bool {
    match queue
        .update_status(
            &job.job_id,
            JobStatus::Failed,
            Some(JobOutcome::Error(error.to_string())),
        )
        .await
    {
        Ok(true) => {
            error!(
                job_id = %job.job_id,
                retries = job.retries,
                "Job failed permanently: {}", error
            );
            handler.on_terminal_failure(job, error).await;
            alerts.raise(match kind {
                AlertKind::JobFailed => Alert::job_failed(job, error),
                AlertKind::StuckJobAbandoned => Alert::stuck_job_abandoned(job, error),
            });
            true
        }
        Ok(false) => {
            warn!(job_id = %job.job_id, "Job changed before it could be marked failed");
            false
        }
        Err(e) => {
            error!(job_id = %job.job_id, "Failed to mark job failed: {}", e);
            false
        }
    }
}
