//! Job DTOs

use serde::{Deserialize, Serialize};

use crate::domain::job::JobPayload;

/// Request to submit a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueJob {
    pub owner_id: i64,
    pub payload: JobPayload,
}

/// Response to a successful submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueuedJob {
    pub job_id: String,
}

/// Response to an administrative reset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSummary {
    pub jobs_removed: usize,
}
