//! Worker pool status types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: u64,
    pub started_at: DateTime<Utc>,
    pub jobs_processed: u64,
    pub current_job_id: Option<String>,
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub active_workers: usize,
    pub workers: Vec<WorkerStatus>,
    /// Pending jobs across every queue
    pub queue_size: usize,
}
