//! Job queue
//!
//! Job lifecycle on top of a [`RecordStore`]:
//! - Enqueue stores a PENDING record and appends its id to the type's list
//! - Dequeue pops ids in FIFO order and skips ids whose record is gone or no
//!   longer PENDING
//! - Status updates and retries are compare-and-swap loops, so concurrent
//!   writers never lose an update and invalid transitions are refused

use chrono::Utc;
use darkroom_core::domain::job::{Job, JobOutcome, JobPayload, JobStatus, JobType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::store::{CasOutcome, RecordStore};

/// Attempts of one read-modify-write before giving up on a hot record
const CAS_ATTEMPTS: usize = 16;

/// What a mutation decided to do with the record it was shown
enum Mutation {
    Skip,
    Write,
    WriteAndRequeue,
}

/// Multi-queue job broker
pub struct JobQueue {
    store: Arc<dyn RecordStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Names of every pending list, in worker polling order
    pub fn queue_names() -> [&'static str; 3] {
        JobType::PRIORITY.map(|job_type| job_type.queue_name())
    }

    /// Creates a PENDING job and appends it to the queue of its type
    ///
    /// The job type is taken from the payload variant.
    pub async fn enqueue(&self, owner_id: i64, payload: JobPayload) -> Result<String, QueueError> {
        let job = Job::new(owner_id, payload);
        let record = serde_json::to_string(&job)?;

        self.store
            .insert_and_push(&job.job_id, &record, job.job_type.queue_name())
            .await?;

        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            owner_id,
            "Enqueued job"
        );
        Ok(job.job_id)
    }

    /// Pops the next PENDING job of `job_type`, waiting up to `timeout`
    pub async fn dequeue(
        &self,
        job_type: JobType,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let queue = job_type.queue_name();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let Some(job_id) = self.store.pop(queue, remaining).await? else {
                return Ok(None);
            };

            match self.get_status(&job_id).await? {
                Some(job) if job.status == JobStatus::Pending => return Ok(Some(job)),
                Some(job) => {
                    warn!(job_id = %job_id, status = %job.status, "Skipping non-pending job in {}", queue);
                }
                None => {
                    debug!(job_id = %job_id, "Skipping removed job in {}", queue);
                }
            }
        }
    }

    /// Moves a job to `status`, attaching the result or error
    ///
    /// Returns `false` when the job no longer exists or the transition is
    /// not allowed from its current status.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        outcome: Option<JobOutcome>,
    ) -> Result<bool, QueueError> {
        self.mutate(job_id, |job| {
            if !job.status.can_transition_to(status) {
                warn!(
                    job_id = %job.job_id,
                    "Refusing transition {} -> {}", job.status, status
                );
                return Mutation::Skip;
            }

            let now = Utc::now();
            job.status = status;
            job.updated_at = now;

            match status {
                JobStatus::Processing => job.started_at = Some(now),
                JobStatus::Completed | JobStatus::Failed => job.completed_at = Some(now),
                JobStatus::Pending => {}
            }

            match outcome.clone() {
                Some(JobOutcome::Result(result)) => job.result = Some(result),
                Some(JobOutcome::Error(error)) => job.error = Some(error),
                None => {}
            }

            Mutation::Write
        })
        .await
    }

    /// Puts a job back on its queue with `retries + 1`
    pub async fn retry(&self, job_id: &str) -> Result<bool, QueueError> {
        self.requeue(job_id, None).await
    }

    /// Like [`JobQueue::retry`], recording the error of the failed attempt
    pub async fn retry_after_failure(&self, job_id: &str, error: &str) -> Result<bool, QueueError> {
        self.requeue(job_id, Some(error)).await
    }

    async fn requeue(&self, job_id: &str, error: Option<&str>) -> Result<bool, QueueError> {
        let requeued = self
            .mutate(job_id, |job| {
                if !job.status.is_retryable() {
                    warn!(job_id = %job.job_id, status = %job.status, "Refusing retry");
                    return Mutation::Skip;
                }

                job.status = JobStatus::Pending;
                job.retries += 1;
                job.started_at = None;
                job.completed_at = None;
                job.updated_at = Utc::now();
                if let Some(error) = error {
                    job.error = Some(error.to_string());
                }

                Mutation::WriteAndRequeue
            })
            .await?;

        if requeued {
            info!(job_id = %job_id, "Job re-queued");
        }
        Ok(requeued)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        match self.store.get(job_id).await? {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    /// Every job in the store, oldest first
    ///
    /// Unreadable records are logged and skipped.
    pub async fn list_all(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs: Vec<Job> = self
            .store
            .all()
            .await?
            .into_iter()
            .filter_map(|record| match serde_json::from_str::<Job>(&record) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!("Skipping unreadable job record: {}", e);
                    None
                }
            })
            .collect();

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    pub async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Job>, QueueError> {
        let mut jobs = self.list_all().await?;
        jobs.retain(|job| job.owner_id == owner_id);
        Ok(jobs)
    }

    /// PROCESSING jobs whose `started_at` is older than `threshold`
    pub async fn find_stuck(&self, threshold: Duration) -> Result<Vec<Job>, QueueError> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut jobs = self.list_all().await?;
        jobs.retain(|job| {
            job.status == JobStatus::Processing
                && job
                    .started_at
                    .is_some_and(|started| now.signed_duration_since(started) > threshold)
        });
        Ok(jobs)
    }

    pub async fn remove(&self, job_id: &str) -> Result<bool, QueueError> {
        let removed = self.store.remove(job_id, &Self::queue_names()).await?;
        if removed {
            debug!(job_id = %job_id, "Removed job");
        }
        Ok(removed)
    }

    /// Drops every job and every pending list, returning the number of jobs removed
    pub async fn purge_all(&self) -> Result<usize, QueueError> {
        let removed = self.store.clear(&Self::queue_names()).await?;
        warn!("Purged {} job(s) from the store", removed);
        Ok(removed)
    }

    /// Pending ids across every queue
    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        for queue in Self::queue_names() {
            total += self.store.len(queue).await?;
        }
        Ok(total)
    }

    /// Read-modify-write of one record
    ///
    /// `apply` sees the freshest record on every attempt and must be
    /// idempotent across attempts.
    async fn mutate<F>(&self, job_id: &str, mut apply: F) -> Result<bool, QueueError>
    where
        F: FnMut(&mut Job) -> Mutation + Send,
    {
        for attempt in 1..=CAS_ATTEMPTS {
            let Some(current) = self.store.get(job_id).await? else {
                return Ok(false);
            };

            let mut job: Job = serde_json::from_str(&current)?;
            let requeue = match apply(&mut job) {
                Mutation::Skip => return Ok(false),
                Mutation::Write => None,
                Mutation::WriteAndRequeue => Some(job.job_type.queue_name()),
            };

            let updated = serde_json::to_string(&job)?;

            match self
                .store
                .compare_and_swap(job_id, &current, &updated, requeue)
                .await?
            {
                CasOutcome::Swapped => return Ok(true),
                CasOutcome::Missing => return Ok(false),
                CasOutcome::Conflict => {
                    debug!(job_id = %job_id, attempt, "Concurrent update, retrying");
                }
            }
        }

        Err(QueueError::Contention(job_id.to_string()))
    }
}
