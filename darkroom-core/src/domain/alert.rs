//! Alert types
//!
//! Alerts are raised when a job reaches a terminal failure and are fanned
//! out to every registered handler (webhook, log, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::Job;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub job_id: String,
    pub owner_id: i64,
    pub error: String,
    pub retries: u32,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The job handler failed and the retry budget is spent
    JobFailed,
    /// The job sat in PROCESSING past the stuck threshold with no retries left
    StuckJobAbandoned,
}

impl Alert {
    pub fn job_failed(job: &Job, error: impl Into<String>) -> Self {
        Self::new(AlertKind::JobFailed, job, error)
    }

    pub fn stuck_job_abandoned(job: &Job, error: impl Into<String>) -> Self {
        Self::new(AlertKind::StuckJobAbandoned, job, error)
    }

    fn new(kind: AlertKind, job: &Job, error: impl Into<String>) -> Self {
        Self {
            kind,
            job_id: job.job_id.clone(),
            owner_id: job.owner_id,
            error: error.into(),
            retries: job.retries,
            raised_at: Utc::now(),
        }
    }

    /// Short subject line for notification channels
    pub fn subject(&self) -> &'static str {
        match self.kind {
            AlertKind::JobFailed => "Job Failure Alert",
            AlertKind::StuckJobAbandoned => "Stuck Job Alert",
        }
    }

    /// Human-readable multi-line message
    pub fn message(&self) -> String {
        let title = match self.kind {
            AlertKind::JobFailed => "Job Failed",
            AlertKind::StuckJobAbandoned => "Job Stuck",
        };
        format!(
            "{}\nJob ID: {}\nError: {}\nRetries: {}",
            title, self.job_id, self.error, self.retries
        )
    }
}
