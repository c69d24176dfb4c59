//! Remote execution backend
//!
//! Provisions GPU instances through the provider's control API and drives
//! them over a remote shell:
//! - `provider`: the control API (launch, status, terminate)
//! - `shell`: command execution and file transfer on a host
//! - `backend`: launch loop, readiness wait, checked execution
//! - `workflow`: dataset preparation, environment setup, training, generation
//!
//! Every instance obtained from a successful launch is terminated exactly
//! once. [`with_instance`] and [`run_on_instance`] are the only places that
//! hand an instance to job code, and both terminate it afterwards whatever
//! the job code did.

mod backend;
mod provider;
mod shell;
mod workflow;

use anyhow::anyhow;
use darkroom_core::domain::instance::Instance;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

pub use backend::{GpuBackend, RemoteBackend};
pub use provider::{ComputeProvider, HttpComputeProvider, classify_launch_error};
pub use shell::{CommandOutput, RemoteShell, SshShell};
pub use workflow::{GenerationRequest, Workflow, has_failure_marker, shell_quote};

/// Launches an instance, runs `work` on it, then terminates it
pub async fn run_on_instance<T, F, Fut>(backend: Arc<dyn RemoteBackend>, work: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(Instance) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let instance = backend.launch().await?;
    with_instance(backend, instance, work).await
}

/// Runs `work` on an already launched instance, then terminates it
///
/// `work` runs on its own task so that a panic inside it surfaces here as an
/// error instead of skipping the termination.
pub async fn with_instance<T, F, Fut>(
    backend: Arc<dyn RemoteBackend>,
    instance: Instance,
    work: F,
) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(Instance) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let outcome = tokio::spawn(work(instance.clone())).await;

    info!(instance_id = %instance.instance_id, "Terminating instance");
    if let Err(e) = backend.terminate(&instance).await {
        error!(
            instance_id = %instance.instance_id,
            "Failed to terminate instance: {}", e
        );
    }

    match outcome {
        Ok(result) => result,
        Err(join_error) => Err(anyhow!("Remote work panicked: {}", join_error)),
    }
}
