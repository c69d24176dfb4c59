//! Queue metrics

use serde::{Deserialize, Serialize};

/// Aggregate counts over a set of jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean processing time of completed jobs, in seconds (0 when none)
    pub avg_processing_time_secs: f64,
}

/// Metrics restricted to one owner's jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerMetrics {
    pub owner_id: i64,
    #[serde(flatten)]
    pub metrics: QueueMetrics,
}

/// Model cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}
