//! Workers
//!
//! Each worker loops: poll the queues in priority order with a bounded wait,
//! process the first job found, sleep briefly when every queue is empty.
//! The stop flag is checked between jobs, never during one, so an in-flight
//! job always runs to completion.

use anyhow::anyhow;
use chrono::Utc;
use darkroom_core::domain::alert::AlertKind;
use darkroom_core::domain::job::{Job, JobOutcome, JobStatus, JobType};
use darkroom_core::domain::worker::{PoolStatus, WorkerStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AlertHub, JobHandler, fail_job};
use crate::config::PoolConfig;
use crate::error::QueueError;
use crate::queue::JobQueue;

/// What every worker shares
struct Shared {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    alerts: Arc<AlertHub>,
    config: PoolConfig,
}

struct WorkerHandle {
    id: u64,
    status: Arc<Mutex<WorkerStatus>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Self-scaling pool of job workers
pub struct WorkerPool {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    /// Running workers, oldest first
    workers: Mutex<Vec<WorkerHandle>>,
    /// Workers told to stop that may still be finishing a job
    retiring: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        alerts: Arc<AlertHub>,
        config: PoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                handler,
                alerts,
                config,
            }),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
            retiring: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `count` more workers, returning how many were started
    pub fn start(&self, count: usize) -> usize {
        if self.shutdown.is_cancelled() {
            warn!("Worker pool is shut down, not starting workers");
            return 0;
        }

        let mut workers = self.workers.lock().unwrap();
        for _ in 0..count {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let status = Arc::new(Mutex::new(WorkerStatus {
                id,
                started_at: Utc::now(),
                jobs_processed: 0,
                current_job_id: None,
            }));
            let cancel = self.shutdown.child_token();

            let worker = Worker {
                id,
                shared: Arc::clone(&self.shared),
                status: Arc::clone(&status),
                cancel: cancel.clone(),
            };
            let task = tokio::spawn(worker.run());

            workers.push(WorkerHandle {
                id,
                status,
                cancel,
                task,
            });
        }

        info!("Started {} worker(s), {} active", count, workers.len());
        count
    }

    /// Stops workers
    ///
    /// `Some(n)` retires the `n` most recently started workers without
    /// waiting for them; each finishes its current job first. `None` shuts
    /// the whole pool down, see [`WorkerPool::shutdown`].
    pub async fn stop(&self, count: Option<usize>) -> usize {
        match count {
            Some(count) => self.retire(count),
            None => self.shutdown(self.shared.config.shutdown_timeout).await,
        }
    }

    fn retire(&self, count: usize) -> usize {
        let mut workers = self.workers.lock().unwrap();
        let keep = workers.len().saturating_sub(count);
        let retired: Vec<WorkerHandle> = workers.drain(keep..).collect();
        let remaining = workers.len();
        drop(workers);

        let mut retiring = self.retiring.lock().unwrap();
        retiring.retain(|task| !task.is_finished());
        for worker in &retired {
            debug!(worker_id = worker.id, "Retiring worker");
            worker.cancel.cancel();
        }
        let stopped = retired.len();
        retiring.extend(retired.into_iter().map(|worker| worker.task));

        info!("Stopped {} worker(s), {} active", stopped, remaining);
        stopped
    }

    /// Flips the stop flag without waiting
    ///
    /// Workers take no new job once their current one is done, and
    /// [`WorkerPool::start`] refuses from then on.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Closing worker pool, no new jobs will be taken");
            self.shutdown.cancel();
        }
    }

    /// Cancels every worker and waits up to `timeout` for them to exit
    ///
    /// Returns the number of workers that were running. Workers still busy
    /// when the timeout expires are left to finish in the background.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.close();

        let workers: Vec<WorkerHandle> = self.workers.lock().unwrap().drain(..).collect();
        let stopped = workers.len();
        let mut tasks: Vec<JoinHandle<()>> = self.retiring.lock().unwrap().drain(..).collect();
        tasks.extend(workers.into_iter().map(|worker| worker.task));

        info!("Shutting down {} worker task(s)", tasks.len());
        let joined = tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Worker task panicked: {}", e);
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!("Workers did not stop within {:?}, leaving them to finish", timeout);
        }
        stopped
    }

    /// Workers currently running
    pub fn active_count(&self) -> usize {
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|worker| !worker.task.is_finished());
        workers.len()
    }

    pub async fn status(&self) -> Result<PoolStatus, QueueError> {
        let workers: Vec<WorkerStatus> = {
            let mut workers = self.workers.lock().unwrap();
            workers.retain(|worker| !worker.task.is_finished());
            workers
                .iter()
                .map(|worker| worker.status.lock().unwrap().clone())
                .collect()
        };

        Ok(PoolStatus {
            active_workers: workers.len(),
            workers,
            queue_size: self.shared.queue.pending_count().await?,
        })
    }
}

struct Worker {
    id: u64,
    shared: Arc<Shared>,
    status: Arc<Mutex<WorkerStatus>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = self.id, "Worker started");

        while !self.cancel.is_cancelled() {
            match self.next_job().await {
                Some(job) => self.process(job).await,
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.shared.config.idle_sleep) => {}
                    }
                }
            }
        }

        debug!(worker_id = self.id, "Worker stopped");
    }

    /// First job found across the queues in priority order
    ///
    /// A dequeue in progress is never abandoned, so a popped id cannot be lost.
    async fn next_job(&self) -> Option<Job> {
        for job_type in JobType::PRIORITY {
            if self.cancel.is_cancelled() {
                return None;
            }

            match self
                .shared
                .queue
                .dequeue(job_type, self.shared.config.dequeue_timeout)
                .await
            {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = self.id, queue = job_type.queue_name(), "Dequeue failed: {}", e);
                }
            }
        }
        None
    }

    async fn process(&self, job: Job) {
        let job_id = job.job_id.clone();
        let queue = &self.shared.queue;

        match queue.update_status(&job_id, JobStatus::Processing, None).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(worker_id = self.id, job_id = %job_id, "Job was claimed elsewhere, skipping");
                return;
            }
            Err(e) => {
                error!(worker_id = self.id, job_id = %job_id, "Failed to mark job processing: {}", e);
                return;
            }
        }

        self.status.lock().unwrap().current_job_id = Some(job_id.clone());
        info!(
            worker_id = self.id,
            job_id = %job_id,
            job_type = %job.job_type,
            retries = job.retries,
            "Processing job"
        );

        let handler = Arc::clone(&self.shared.handler);
        let running = job.clone();
        let outcome = match tokio::spawn(async move { handler.handle(&running).await }).await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(anyhow!("Job handler panicked: {}", join_error)),
        };

        match outcome {
            Ok(result) => {
                match queue
                    .update_status(&job_id, JobStatus::Completed, Some(JobOutcome::Result(result)))
                    .await
                {
                    Ok(true) => info!(worker_id = self.id, job_id = %job_id, "Job completed"),
                    Ok(false) => warn!(
                        worker_id = self.id,
                        job_id = %job_id,
                        "Job finished but its record had moved on"
                    ),
                    Err(e) => error!(job_id = %job_id, "Failed to mark job completed: {}", e),
                }
            }
            Err(e) => self.handle_failure(&job, &format!("{:#}", e)).await,
        }

        let mut status = self.status.lock().unwrap();
        status.current_job_id = None;
        status.jobs_processed += 1;
    }

    async fn handle_failure(&self, job: &Job, error: &str) {
        let shared = &self.shared;

        if job.retries < shared.config.max_retries {
            warn!(
                worker_id = self.id,
                job_id = %job.job_id,
                attempt = job.retries + 1,
                max_retries = shared.config.max_retries,
                "Job failed, retrying: {}", error
            );
            if let Err(e) = shared.queue.retry_after_failure(&job.job_id, error).await {
                error!(job_id = %job.job_id, "Failed to re-queue job: {}", e);
            }
            return;
        }

        fail_job(
            &shared.queue,
            shared.handler.as_ref(),
            &shared.alerts,
            job,
            error,
            AlertKind::JobFailed,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{RecordingAlertHandler, ScriptedHandler, training_payload};

    fn config(max_retries: u32) -> PoolConfig {
        PoolConfig {
            max_retries,
            dequeue_timeout: Duration::from_millis(20),
            idle_sleep: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        }
    }

    struct Fixture {
        queue: Arc<JobQueue>,
        handler: Arc<ScriptedHandler>,
        recorder: Arc<RecordingAlertHandler>,
        alerts: Arc<AlertHub>,
        pool: WorkerPool,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryStore::new())));
        let handler = Arc::new(ScriptedHandler::new());
        let recorder = Arc::new(RecordingAlertHandler::new());
        let alerts = Arc::new(AlertHub::new());
        alerts.register(recorder.clone());
        let pool = WorkerPool::new(queue.clone(), handler.clone(), alerts.clone(), config(max_retries));
        Fixture {
            queue,
            handler,
            recorder,
            alerts,
            pool,
        }
    }

    async fn wait_terminal(queue: &JobQueue, job_ids: &[String]) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let mut done = true;
                for job_id in job_ids {
                    let job = queue.get_status(job_id).await.unwrap().unwrap();
                    done &= job.status.is_terminal();
                }
                if done {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_three_jobs_one_failing_twice() {
        let f = fixture(1);
        let ids = vec![
            f.queue.enqueue(7, training_payload(1)).await.unwrap(),
            f.queue.enqueue(7, training_payload(2)).await.unwrap(),
            f.queue.enqueue(7, training_payload(3)).await.unwrap(),
        ];
        f.handler.fail_times(&ids[1], 2);

        f.pool.start(1);
        wait_terminal(&f.queue, &ids).await;
        f.pool.shutdown(Duration::from_secs(5)).await;
        f.alerts.deliver_pending().await;

        let first = f.queue.get_status(&ids[0]).await.unwrap().unwrap();
        let second = f.queue.get_status(&ids[1]).await.unwrap().unwrap();
        let third = f.queue.get_status(&ids[2]).await.unwrap().unwrap();

        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(third.status, JobStatus::Completed);
        assert_eq!(second.status, JobStatus::Failed);
        assert_eq!(second.retries, 1);

        let alerts = f.recorder.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].job_id, ids[1]);
        assert_eq!(f.handler.terminal_failures(), vec![ids[1].clone()]);
    }

    #[tokio::test]
    async fn test_retry_bound_is_respected() {
        let f = fixture(3);
        let job_id = f.queue.enqueue(1, training_payload(1)).await.unwrap();
        f.handler.fail_times(&job_id, usize::MAX);

        f.pool.start(2);
        wait_terminal(&f.queue, std::slice::from_ref(&job_id)).await;
        f.pool.shutdown(Duration::from_secs(5)).await;
        f.alerts.deliver_pending().await;

        let job = f.queue.get_status(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 3);
        assert_eq!(f.handler.attempts(&job_id), 4);
        assert_eq!(f.queue.pending_count().await.unwrap(), 0);
        assert_eq!(f.recorder.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_counts_as_failure() {
        let f = fixture(0);
        let job_id = f.queue.enqueue(1, training_payload(1)).await.unwrap();
        f.handler.panic_on(&job_id);

        f.pool.start(1);
        wait_terminal(&f.queue, std::slice::from_ref(&job_id)).await;
        f.pool.shutdown(Duration::from_secs(5)).await;

        let job = f.queue.get_status(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("panicked"));
        assert_eq!(f.pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_retires_most_recent_workers() {
        let f = fixture(0);
        f.pool.start(3);

        assert_eq!(f.pool.stop(Some(2)).await, 2);
        let status = f.pool.status().await.unwrap();
        assert_eq!(status.active_workers, 1);
        assert_eq!(status.workers[0].id, 1);

        assert_eq!(f.pool.stop(None).await, 1);
        assert_eq!(f.pool.active_count(), 0);
        assert_eq!(f.pool.start(1), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_takes_no_new_jobs() {
        let f = fixture(0);
        f.pool.start(2);
        f.pool.close();
        assert_eq!(f.pool.start(1), 0);

        let job_id = f.queue.enqueue(1, training_payload(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let job = f.queue.get_status(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(f.handler.attempts(&job_id), 0);
        assert_eq!(f.pool.shutdown(Duration::from_secs(5)).await, 2);
    }

    #[tokio::test]
    async fn test_in_flight_job_finishes_on_shutdown() {
        let f = fixture(0);
        let job_id = f.queue.enqueue(1, training_payload(1)).await.unwrap();
        f.handler.delay(Duration::from_millis(200));

        f.pool.start(1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.handler.attempts(&job_id) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        f.pool.shutdown(Duration::from_secs(5)).await;

        let job = f.queue.get_status(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}
