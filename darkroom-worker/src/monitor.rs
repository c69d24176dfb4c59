//! Job monitor
//!
//! Periodically summarises the job store into [`QueueMetrics`] and prunes
//! terminal jobs older than the retention window.

use chrono::{DateTime, Utc};
use darkroom_core::domain::job::{Job, JobStatus};
use darkroom_core::domain::metrics::{OwnerMetrics, QueueMetrics};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MonitorConfig;
use crate::error::QueueError;
use crate::queue::JobQueue;

/// Metrics as of the last refresh
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSnapshot {
    pub metrics: QueueMetrics,
    pub pruned: usize,
    pub taken_at: DateTime<Utc>,
}

/// Counts jobs by status and averages the processing time of completed ones
pub fn summarize(jobs: &[Job]) -> QueueMetrics {
    let mut metrics = QueueMetrics {
        total: jobs.len(),
        ..QueueMetrics::default()
    };
    let mut processing_secs = Vec::new();

    for job in jobs {
        match job.status {
            JobStatus::Pending => metrics.pending += 1,
            JobStatus::Processing => metrics.processing += 1,
            JobStatus::Completed => {
                metrics.completed += 1;
                if let Some(elapsed) = job.processing_time() {
                    processing_secs.push(elapsed.num_milliseconds() as f64 / 1000.0);
                }
            }
            JobStatus::Failed => metrics.failed += 1,
        }
    }

    if !processing_secs.is_empty() {
        metrics.avg_processing_time_secs =
            processing_secs.iter().sum::<f64>() / processing_secs.len() as f64;
    }
    metrics
}

pub struct JobMonitor {
    queue: Arc<JobQueue>,
    config: MonitorConfig,
    latest: RwLock<Option<MonitorSnapshot>>,
}

impl JobMonitor {
    pub fn new(queue: Arc<JobQueue>, config: MonitorConfig) -> Self {
        Self {
            queue,
            config,
            latest: RwLock::new(None),
        }
    }

    pub async fn compute_metrics(&self) -> Result<QueueMetrics, QueueError> {
        Ok(summarize(&self.queue.list_all().await?))
    }

    pub async fn owner_metrics(&self, owner_id: i64) -> Result<OwnerMetrics, QueueError> {
        let jobs = self.queue.list_for_owner(owner_id).await?;
        Ok(OwnerMetrics {
            owner_id,
            metrics: summarize(&jobs),
        })
    }

    /// Removes terminal jobs that finished before `now - retention`
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now - retention;

        let mut removed = 0;
        for job in self.queue.list_all().await? {
            let expired = job.terminal_since().is_some_and(|since| since < cutoff);
            if expired && self.queue.remove(&job.job_id).await? {
                debug!(job_id = %job.job_id, status = %job.status, "Pruned old job");
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Pruned {} job(s) older than {:?}", removed, self.config.retention);
        }
        Ok(removed)
    }

    /// Recomputes metrics, prunes old jobs and stores the snapshot
    pub async fn refresh(&self) -> Result<MonitorSnapshot, QueueError> {
        let now = Utc::now();
        let pruned = self.prune(now).await?;
        let metrics = self.compute_metrics().await?;

        info!(
            total = metrics.total,
            pending = metrics.pending,
            processing = metrics.processing,
            completed = metrics.completed,
            failed = metrics.failed,
            avg_processing_time_secs = metrics.avg_processing_time_secs,
            "Updated job metrics"
        );

        let snapshot = MonitorSnapshot {
            metrics,
            pruned,
            taken_at: now,
        };
        *self.latest.write().unwrap() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Last stored snapshot, if a refresh has run
    pub fn latest(&self) -> Option<MonitorSnapshot> {
        self.latest.read().unwrap().clone()
    }

    /// Refreshes every `interval` until cancelled, starting immediately
    pub async fn run(&self, cancellation: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Starting job monitor"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("Job monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        error!("Monitor error: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::training_payload;
    use darkroom_core::domain::job::JobOutcome;
    use std::time::Duration;

    fn job(status: JobStatus, elapsed_secs: Option<i64>) -> Job {
        let mut job = Job::new(1, training_payload(1));
        job.status = status;
        if let Some(secs) = elapsed_secs {
            let done = Utc::now();
            job.started_at = Some(done - chrono::Duration::seconds(secs));
            job.completed_at = Some(done);
        }
        job
    }

    #[test]
    fn test_summarize_counts_and_averages_completed_only() {
        let jobs = vec![
            job(JobStatus::Pending, None),
            job(JobStatus::Processing, None),
            job(JobStatus::Completed, Some(10)),
            job(JobStatus::Completed, Some(30)),
            job(JobStatus::Completed, None),
            job(JobStatus::Failed, Some(100)),
        ];

        let metrics = summarize(&jobs);

        assert_eq!(metrics.total, 6);
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.processing, 1);
        assert_eq!(metrics.completed, 3);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.avg_processing_time_secs, 20.0);
    }

    #[test]
    fn test_summarize_empty() {
        assert_eq!(summarize(&[]), QueueMetrics::default());
    }

    async fn finished_job(queue: &JobQueue, owner_id: i64, status: JobStatus) -> String {
        let job_id = queue.enqueue(owner_id, training_payload(1)).await.unwrap();
        queue
            .update_status(&job_id, JobStatus::Processing, None)
            .await
            .unwrap();
        queue
            .update_status(&job_id, status, Some(JobOutcome::Error("done".into())))
            .await
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_terminal_jobs() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryStore::new())));
        let monitor = JobMonitor::new(
            queue.clone(),
            MonitorConfig {
                retention: Duration::from_secs(3600),
                ..MonitorConfig::default()
            },
        );

        let completed = finished_job(&queue, 1, JobStatus::Completed).await;
        let failed = finished_job(&queue, 1, JobStatus::Failed).await;
        let pending = queue.enqueue(1, training_payload(2)).await.unwrap();

        assert_eq!(monitor.prune(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(monitor.prune(later).await.unwrap(), 2);

        assert!(queue.get_status(&completed).await.unwrap().is_none());
        assert!(queue.get_status(&failed).await.unwrap().is_none());
        assert!(queue.get_status(&pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_owner_metrics_and_snapshot() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryStore::new())));
        let monitor = JobMonitor::new(queue.clone(), MonitorConfig::default());

        finished_job(&queue, 1, JobStatus::Completed).await;
        finished_job(&queue, 2, JobStatus::Failed).await;
        queue.enqueue(2, training_payload(3)).await.unwrap();

        let owner = monitor.owner_metrics(2).await.unwrap();
        assert_eq!(owner.owner_id, 2);
        assert_eq!(owner.metrics.total, 2);
        assert_eq!(owner.metrics.failed, 1);
        assert_eq!(owner.metrics.pending, 1);

        assert!(monitor.latest().is_none());
        let snapshot = monitor.refresh().await.unwrap();
        assert_eq!(snapshot.metrics.total, 3);
        assert_eq!(monitor.latest(), Some(snapshot));
    }
}
