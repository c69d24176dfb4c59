//! Engine context
//!
//! Built once at startup and shared by reference. Owns the queue, the worker
//! pool and its supervisor, the monitor, the alert hub and the model cache,
//! and exposes the operations request handlers need.

use anyhow::{Context, Result};
use darkroom_core::domain::job::{Job, JobPayload};
use darkroom_core::domain::metrics::{CacheStats, OwnerMetrics, QueueMetrics};
use darkroom_core::domain::worker::PoolStatus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{ModelCache, run_sweep_daemon};
use crate::collaborators::{LocalStorage, LogNotifier, Persistence, Storage, WebhookNotifier};
use crate::config::Config;
use crate::error::QueueError;
use crate::handlers::GpuJobHandler;
use crate::monitor::JobMonitor;
use crate::pool::{AlertHandler, AlertHub, JobHandler, Supervisor, WorkerPool};
use crate::queue::JobQueue;
use crate::remote::{GpuBackend, HttpComputeProvider, SshShell, Workflow};
use crate::store::{MemoryStore, RecordStore, RedisStore};
use crate::themes::ThemeCatalog;

/// Store URL scheme selecting the in-process store
const MEMORY_STORE_URL: &str = "memory://";

pub struct Engine {
    config: Config,
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    supervisor: Arc<Supervisor>,
    monitor: Arc<JobMonitor>,
    alerts: Arc<AlertHub>,
    cache: Arc<ModelCache>,
}

impl Engine {
    /// Wires the production engine from configuration
    ///
    /// Connects the record store, opens the model cache, loads the theme
    /// catalog and registers the log and webhook alert handlers.
    pub async fn build(config: Config, persistence: Arc<dyn Persistence>) -> Result<Self> {
        let store: Arc<dyn RecordStore> = if config.redis_url.starts_with(MEMORY_STORE_URL) {
            warn!("Using in-memory job store, jobs will not survive a restart");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(
                RedisStore::connect(&config.redis_url)
                    .await
                    .context("Failed to connect to Redis")?,
            )
        };

        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(&config.storage_root));
        let cache = Arc::new(
            ModelCache::open(&config.cache.dir, config.cache.max_bytes, Arc::clone(&storage))
                .await
                .context("Failed to open model cache")?,
        );

        let themes = match &config.themes_file {
            Some(path) => ThemeCatalog::load(path).await?,
            None => {
                warn!("No theme catalog configured, training will not render photobooks");
                ThemeCatalog::empty()
            }
        };

        let provider = HttpComputeProvider::new(&config.provider)
            .context("Failed to create GPU provider client")?;
        let shell = SshShell::new(&config.provider.ssh_user, &config.provider.ssh_key_path);
        let backend = Arc::new(GpuBackend::new(
            Arc::new(provider),
            Arc::new(shell),
            config.provider.clone(),
        ));
        let workflow = Arc::new(Workflow::new(backend, config.remote.clone()));

        let handler = Arc::new(GpuJobHandler::new(
            workflow,
            Arc::clone(&cache),
            storage,
            persistence,
            Arc::new(themes),
        ));

        let webhook_url = config.alerts.webhook_url.clone();
        let engine = Self::new(config, store, handler, cache);

        engine.register_alert_handler(Arc::new(LogNotifier));
        if let Some(url) = webhook_url {
            engine.register_alert_handler(Arc::new(WebhookNotifier::new(url)?));
        }

        Ok(engine)
    }

    /// Assembles an engine around an existing store, handler and cache
    pub fn new(
        config: Config,
        store: Arc<dyn RecordStore>,
        handler: Arc<dyn JobHandler>,
        cache: Arc<ModelCache>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(store));
        let alerts = Arc::new(AlertHub::new());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&handler),
            Arc::clone(&alerts),
            config.pool.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            handler,
            Arc::clone(&alerts),
            config.pool.clone(),
        ));
        let monitor = Arc::new(JobMonitor::new(Arc::clone(&queue), config.monitor.clone()));

        Self {
            config,
            queue,
            pool,
            supervisor,
            monitor,
            alerts,
            cache,
        }
    }

    pub fn register_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.alerts.register(handler);
    }

    /// Starts the supervisor, the monitor and the cache sweep
    ///
    /// The supervisor's first tick brings the pool up to its minimum size.
    /// Cancelling `cancellation` also closes the pool, so no worker takes a
    /// new job once it fires.
    pub fn spawn_background(&self, cancellation: &CancellationToken) -> Vec<JoinHandle<()>> {
        let supervisor = Arc::clone(&self.supervisor);
        let supervisor_token = cancellation.clone();
        let monitor = Arc::clone(&self.monitor);
        let monitor_token = cancellation.clone();
        let pool = Arc::clone(&self.pool);
        let pool_token = cancellation.clone();

        vec![
            tokio::spawn(async move {
                pool_token.cancelled().await;
                pool.close();
            }),
            tokio::spawn(async move { supervisor.run(supervisor_token).await }),
            tokio::spawn(async move { monitor.run(monitor_token).await }),
            tokio::spawn(run_sweep_daemon(
                Arc::clone(&self.cache),
                self.config.cache.sweep_interval,
                cancellation.clone(),
            )),
        ]
    }

    /// Stops every worker, letting in-flight jobs finish within the shutdown timeout
    ///
    /// Alerts raised by jobs that failed while draining are delivered before
    /// returning.
    pub async fn shutdown(&self) {
        let stopped = self.pool.shutdown(self.config.pool.shutdown_timeout).await;
        let delivered = self.alerts.deliver_pending().await;
        info!(
            "Engine stopped with {} worker(s) shut down, {} alert(s) delivered",
            stopped, delivered
        );
    }

    // ========================================================================
    // Outward interface
    // ========================================================================

    /// Submits a job; never waits for it to run
    pub async fn enqueue_job(&self, owner_id: i64, payload: JobPayload) -> Result<String, QueueError> {
        self.queue.enqueue(owner_id, payload).await
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.queue.get_status(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.queue.list_all().await
    }

    pub async fn list_owner_jobs(&self, owner_id: i64) -> Result<Vec<Job>, QueueError> {
        self.queue.list_for_owner(owner_id).await
    }

    pub async fn get_queue_metrics(&self) -> Result<QueueMetrics, QueueError> {
        self.monitor.compute_metrics().await
    }

    pub async fn get_owner_metrics(&self, owner_id: i64) -> Result<OwnerMetrics, QueueError> {
        self.monitor.owner_metrics(owner_id).await
    }

    pub async fn get_worker_pool_status(&self) -> Result<PoolStatus, QueueError> {
        self.pool.status().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Clears every queue and job record, returning the number of jobs removed
    pub async fn reset_all(&self) -> Result<usize, QueueError> {
        self.queue.purge_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LocalStorage;
    use crate::config::PoolConfig;
    use crate::testing::{RecordingAlertHandler, ScriptedHandler, training_payload};
    use darkroom_core::domain::job::JobStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir, handler: Arc<ScriptedHandler>) -> Engine {
        let mut config = Config::new(MEMORY_STORE_URL.to_string());
        config.pool = PoolConfig {
            min_workers: 2,
            max_retries: 0,
            supervisor_interval: Duration::from_millis(20),
            dequeue_timeout: Duration::from_millis(20),
            idle_sleep: Duration::from_millis(5),
            ..PoolConfig::default()
        };

        let storage = Arc::new(LocalStorage::new(dir.path().join("storage")));
        let cache = Arc::new(
            ModelCache::open(dir.path().join("cache"), 1024, storage)
                .await
                .unwrap(),
        );
        Engine::new(config, Arc::new(MemoryStore::new()), handler, cache)
    }

    #[tokio::test]
    async fn test_jobs_run_in_the_background_and_alerts_are_delivered() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::new());
        let engine = engine(&dir, handler.clone()).await;
        let recorder = Arc::new(RecordingAlertHandler::new());
        engine.register_alert_handler(recorder.clone());

        let ok = engine.enqueue_job(1, training_payload(1)).await.unwrap();
        let bad = engine.enqueue_job(2, training_payload(2)).await.unwrap();
        handler.fail_times(&bad, 1);

        let cancellation = CancellationToken::new();
        let tasks = engine.spawn_background(&cancellation);

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let metrics = engine.get_queue_metrics().await.unwrap();
                if metrics.completed == 1 && metrics.failed == 1 && !recorder.alerts().is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(engine.get_worker_pool_status().await.unwrap().active_workers, 2);
        cancellation.cancel();
        for task in tasks {
            task.await.unwrap();
        }
        engine.shutdown().await;

        let job = engine.get_job_status(&ok).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(recorder.alerts()[0].job_id, bad);
        assert_eq!(engine.get_owner_metrics(2).await.unwrap().metrics.failed, 1);
        assert_eq!(engine.get_worker_pool_status().await.unwrap().active_workers, 0);
    }

    #[tokio::test]
    async fn test_no_job_starts_after_the_stop_signal() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::new());
        let engine = engine(&dir, handler.clone()).await;
        let recorder = Arc::new(RecordingAlertHandler::new());
        engine.register_alert_handler(recorder.clone());

        let cancellation = CancellationToken::new();
        let tasks = engine.spawn_background(&cancellation);
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.get_worker_pool_status().await.unwrap().active_workers < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancellation.cancel();
        for task in tasks {
            task.await.unwrap();
        }

        let late = engine.enqueue_job(1, training_payload(1)).await.unwrap();
        let late_bad = engine.enqueue_job(2, training_payload(2)).await.unwrap();
        handler.fail_times(&late_bad, 1);
        tokio::time::sleep(Duration::from_millis(300)).await;

        for job_id in [&late, &late_bad] {
            let job = engine.get_job_status(job_id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(handler.attempts(job_id), 0);
        }

        engine.shutdown().await;
        assert!(recorder.alerts().is_empty());
        assert_eq!(engine.get_worker_pool_status().await.unwrap().queue_size, 2);
    }

    #[tokio::test]
    async fn test_in_flight_failure_is_alerted_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(ScriptedHandler::new());
        let engine = engine(&dir, handler.clone()).await;
        let recorder = Arc::new(RecordingAlertHandler::new());
        engine.register_alert_handler(recorder.clone());

        let slow = engine.enqueue_job(1, training_payload(1)).await.unwrap();
        handler.fail_times(&slow, 1);
        handler.delay(Duration::from_millis(300));

        let cancellation = CancellationToken::new();
        let tasks = engine.spawn_background(&cancellation);
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.attempts(&slow) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The supervisor exits while the job is still running
        cancellation.cancel();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(recorder.alerts().is_empty());

        engine.shutdown().await;

        let job = engine.get_job_status(&slow).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let alerts = recorder.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].job_id, slow);
        assert_eq!(engine.get_worker_pool_status().await.unwrap().active_workers, 0);
    }

    #[tokio::test]
    async fn test_reset_all_clears_jobs() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Arc::new(ScriptedHandler::new())).await;

        engine.enqueue_job(1, training_payload(1)).await.unwrap();
        engine.enqueue_job(1, training_payload(2)).await.unwrap();

        assert_eq!(engine.reset_all().await.unwrap(), 2);
        assert!(engine.list_jobs().await.unwrap().is_empty());
        assert!(engine.list_owner_jobs(1).await.unwrap().is_empty());
        assert_eq!(engine.get_worker_pool_status().await.unwrap().queue_size, 0);
    }
}
