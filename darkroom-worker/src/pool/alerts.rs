//! Alert fan-out

use async_trait::async_trait;
use darkroom_core::domain::alert::Alert;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Receives every alert raised by the pool
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn handle(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// In-process alert queue with registered handlers
///
/// Workers and the supervisor raise alerts without waiting; the supervisor
/// drains the queue on each tick.
pub struct AlertHub {
    sender: mpsc::UnboundedSender<Alert>,
    receiver: Mutex<mpsc::UnboundedReceiver<Alert>>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
}

impl AlertHub {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, handler: Arc<dyn AlertHandler>) {
        debug!("Registered alert handler {}", handler.name());
        self.handlers.write().unwrap().push(handler);
    }

    /// Queues an alert for the next delivery
    pub fn raise(&self, alert: Alert) {
        warn!(job_id = %alert.job_id, "{}", alert.subject());
        // The receiver lives as long as the hub, so sending cannot fail
        let _ = self.sender.send(alert);
    }

    /// Hands every queued alert to every handler, returning how many alerts were drained
    ///
    /// A failing handler is logged and skipped; it never blocks the others.
    pub async fn deliver_pending(&self) -> usize {
        let mut receiver = self.receiver.lock().await;
        let handlers = self.handlers.read().unwrap().clone();

        let mut delivered = 0;
        while let Ok(alert) = receiver.try_recv() {
            for handler in &handlers {
                if let Err(e) = handler.handle(&alert).await {
                    warn!(
                        job_id = %alert.job_id,
                        handler = handler.name(),
                        "Alert handler failed: {:#}", e
                    );
                }
            }
            delivered += 1;
        }
        delivered
    }
}

impl Default for AlertHub {
    fn default() -> Self {
        Self::new()
    }
}
