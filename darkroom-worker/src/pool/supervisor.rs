//! Supervisor
//!
//! A single long-lived loop that, on every tick:
//! 1. Scales the worker pool to the queue size
//! 2. Re-queues jobs stuck in PROCESSING, or fails them once their retries are spent
//! 3. Delivers queued alerts to every handler

use darkroom_core::domain::alert::AlertKind;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AlertHub, JobHandler, WorkerPool, fail_job};
use crate::config::PoolConfig;
use crate::queue::JobQueue;

/// Change to the worker count decided for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(usize),
    Down(usize),
    #[default]
    Hold,
}

/// Proportional scaling with half-threshold hysteresis
///
/// Scales up when jobs per worker exceed the threshold, toward
/// `ceil(queue / threshold)` workers capped at the maximum. Scales down when
/// jobs per worker fall below half the threshold, toward the same target
/// floored at the minimum. Either way by at most `scale_step` per tick.
/// Below the minimum, the floor is restored first.
pub fn scaling_decision(queue_size: usize, active: usize, config: &PoolConfig) -> ScaleDecision {
    if active < config.min_workers {
        return ScaleDecision::Up(config.min_workers - active);
    }

    let threshold = config.jobs_per_worker_threshold;
    let jobs_per_worker = queue_size as f64 / active.max(1) as f64;
    let target = ((queue_size as f64 / threshold).ceil() as usize)
        .clamp(config.min_workers, config.max_workers);

    if jobs_per_worker > threshold && active < config.max_workers {
        let step = target.saturating_sub(active).min(config.scale_step);
        if step > 0 {
            return ScaleDecision::Up(step);
        }
    } else if jobs_per_worker < threshold / 2.0 && active > config.min_workers {
        let step = active.saturating_sub(target).min(config.scale_step);
        if step > 0 {
            return ScaleDecision::Down(step);
        }
    }

    ScaleDecision::Hold
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scaling: ScaleDecision,
    pub stuck_retried: usize,
    pub stuck_failed: usize,
    pub alerts_delivered: usize,
}

pub struct Supervisor {
    queue: Arc<JobQueue>,
    pool: Arc<WorkerPool>,
    handler: Arc<dyn JobHandler>,
    alerts: Arc<AlertHub>,
    config: PoolConfig,
}

impl Supervisor {
    pub fn new(
        queue: Arc<JobQueue>,
        pool: Arc<WorkerPool>,
        handler: Arc<dyn JobHandler>,
        alerts: Arc<AlertHub>,
        config: PoolConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            handler,
            alerts,
            config,
        }
    }

    /// Ticks every `supervisor_interval` until cancelled, starting immediately
    pub async fn run(&self, cancellation: CancellationToken) {
        info!(
            interval_secs = self.config.supervisor_interval.as_secs(),
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "Starting supervisor"
        );

        let mut interval = tokio::time::interval(self.config.supervisor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("Supervisor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "Supervisor tick");
                }
            }
        }

        // Alerts raised by the last jobs still deserve delivery
        self.alerts.deliver_pending().await;
    }

    pub async fn tick(&self) -> TickReport {
        let scaling = self.scale().await;
        let (stuck_retried, stuck_failed) = self.recover_stuck().await;
        let alerts_delivered = self.alerts.deliver_pending().await;

        TickReport {
            scaling,
            stuck_retried,
            stuck_failed,
            alerts_delivered,
        }
    }

    async fn scale(&self) -> ScaleDecision {
        let queue_size = match self.queue.pending_count().await {
            Ok(size) => size,
            Err(e) => {
                warn!("Skipping scaling, queue size unavailable: {}", e);
                return ScaleDecision::Hold;
            }
        };
        let active = self.pool.active_count();

        let decision = scaling_decision(queue_size, active, &self.config);
        match decision {
            ScaleDecision::Up(count) => {
                info!(queue_size, active, "Scaling up by {}", count);
                self.pool.start(count);
            }
            ScaleDecision::Down(count) => {
                info!(queue_size, active, "Scaling down by {}", count);
                self.pool.stop(Some(count)).await;
            }
            ScaleDecision::Hold => {}
        }
        decision
    }

    async fn recover_stuck(&self) -> (usize, usize) {
        let stuck = match self.queue.find_stuck(self.config.stuck_threshold).await {
            Ok(stuck) => stuck,
            Err(e) => {
                error!("Failed to scan for stuck jobs: {}", e);
                return (0, 0);
            }
        };

        let mut retried = 0;
        let mut failed = 0;
        for job in stuck {
            if job.retries < self.config.max_retries {
                warn!(job_id = %job.job_id, retries = job.retries, "Re-queueing stuck job");
                match self.queue.retry(&job.job_id).await {
                    Ok(true) => retried += 1,
                    Ok(false) => {}
                    Err(e) => error!(job_id = %job.job_id, "Failed to re-queue stuck job: {}", e),
                }
                continue;
            }

            let error = format!(
                "Job stuck in PROCESSING for more than {}s",
                self.config.stuck_threshold.as_secs()
            );
            let marked = fail_job(
                &self.queue,
                self.handler.as_ref(),
                &self.alerts,
                &job,
                &error,
                AlertKind::StuckJobAbandoned,
            )
            .await;
            if marked {
                failed += 1;
            }
        }

        (retried, failed)
    }
}
