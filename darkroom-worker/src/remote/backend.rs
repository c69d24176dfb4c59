//! Remote backend
//!
//! Combines the provider and the shell into the operations job code uses:
//! - `launch` walks instance types and regions in preference order and waits
//!   for the instance to become reachable
//! - `execute` runs a command and fails on a non-zero exit status
//! - `upload` / `download` move files
//! - `terminate` releases the instance

use async_trait::async_trait;
use darkroom_core::domain::instance::{Instance, InstanceStatus};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::provider::ComputeProvider;
use super::shell::RemoteShell;
use crate::config::ProviderConfig;
use crate::error::{ProviderError, RemoteError};

/// Attempts of one status query before the readiness wait gives up
const STATUS_ATTEMPTS: u32 = 3;

/// Remote GPU execution
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Provisions an instance and waits until it is reachable
    async fn launch(&self) -> Result<Instance, RemoteError>;

    /// Runs a command, returning its stdout
    async fn execute(&self, instance: &Instance, command: &str) -> Result<String, RemoteError>;

    async fn upload(&self, instance: &Instance, local: &Path, remote: &str)
    -> Result<(), RemoteError>;

    async fn download(
        &self,
        instance: &Instance,
        remote: &str,
        local: &Path,
    ) -> Result<(), RemoteError>;

    async fn terminate(&self, instance: &Instance) -> Result<(), RemoteError>;
}

/// Standard implementation of RemoteBackend
pub struct GpuBackend {
    provider: Arc<dyn ComputeProvider>,
    shell: Arc<dyn RemoteShell>,
    config: ProviderConfig,
}

impl GpuBackend {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        shell: Arc<dyn RemoteShell>,
        config: ProviderConfig,
    ) -> Self {
        Self {
            provider,
            shell,
            config,
        }
    }

    /// Polls the provider until the instance is active with an address
    async fn wait_until_active(&self, instance_id: &str) -> Result<Instance, RemoteError> {
        info!(instance_id, "Waiting for instance to become active");
        let deadline = Instant::now() + self.config.launch_timeout;

        loop {
            let instance = self.instance_with_retry(instance_id).await?;

            match instance.status {
                InstanceStatus::Active => {
                    if instance.ip.is_none() {
                        return Err(RemoteError::MissingAddress(instance_id.to_string()));
                    }
                    info!(
                        instance_id,
                        ip = instance.address().unwrap_or_default(),
                        "Instance is active"
                    );
                    return Ok(instance);
                }
                status if status.is_dead() => {
                    return Err(RemoteError::InstanceFailed {
                        instance_id: instance_id.to_string(),
                        status: status.to_string(),
                    });
                }
                status => debug!(instance_id, %status, "Instance not ready yet"),
            }

            if Instant::now() + self.config.status_poll_interval > deadline {
                return Err(RemoteError::StartupTimeout(instance_id.to_string()));
            }
            tokio::time::sleep(self.config.status_poll_interval).await;
        }
    }

    /// Status query with exponential backoff between failed attempts
    async fn instance_with_retry(&self, instance_id: &str) -> Result<Instance, RemoteError> {
        let mut delay = self.config.status_retry_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.provider.instance(instance_id).await {
                Ok(instance) => return Ok(instance),
                Err(e) if attempt < STATUS_ATTEMPTS => {
                    warn!(
                        instance_id,
                        "Status query failed (attempt {}/{}): {}", attempt, STATUS_ATTEMPTS, e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn host<'a>(&self, instance: &'a Instance) -> Result<&'a str, RemoteError> {
        instance
            .address()
            .ok_or_else(|| RemoteError::MissingAddress(instance.instance_id.clone()))
    }
}

#[async_trait]
impl RemoteBackend for GpuBackend {
    async fn launch(&self) -> Result<Instance, RemoteError> {
        let mut errors = Vec::new();

        'types: for instance_type in &self.config.instance_types {
            for region in &self.config.regions {
                info!("Attempting to launch {} in {}", instance_type, region);

                let instance_id = match self.provider.launch(instance_type, region).await {
                    Ok(id) => id,
                    Err(ProviderError::InsufficientCapacity(_)) => {
                        warn!("No capacity in {} for {}", region, instance_type);
                        errors.push(format!("No capacity for {} in {}", instance_type, region));
                        continue;
                    }
                    Err(ProviderError::InvalidRegion(_)) => {
                        error!("Invalid region {}", region);
                        errors.push(format!("Invalid region {}", region));
                        continue;
                    }
                    Err(ProviderError::Timeout(_)) => {
                        warn!("Request timed out for {} in {}", instance_type, region);
                        errors.push(format!("Timeout in {}", region));
                        continue;
                    }
                    Err(ProviderError::InvalidInstanceType(_)) => {
                        error!("Invalid instance type {}", instance_type);
                        errors.push(format!("Invalid instance type {}", instance_type));
                        continue 'types;
                    }
                    Err(e) => {
                        error!("API error with {}: {}", instance_type, e);
                        errors.push(format!("{} in {}: {}", instance_type, region, e));
                        continue 'types;
                    }
                };

                // From here on the instance exists and must be released on failure
                match self.wait_until_active(&instance_id).await {
                    Ok(mut instance) => {
                        if instance.region.is_empty() {
                            instance.region = region.clone();
                        }
                        if instance.instance_type.is_empty() {
                            instance.instance_type = instance_type.clone();
                        }
                        info!("Successfully launched {} in {}", instance_type, region);
                        return Ok(instance);
                    }
                    Err(e) => {
                        error!(instance_id = %instance_id, "Instance never became ready: {}", e);
                        if let Err(term) = self.provider.terminate(&instance_id).await {
                            error!(instance_id = %instance_id, "Failed to terminate instance: {}", term);
                        }
                        return Err(e);
                    }
                }
            }
        }

        let message = errors.join("; ");
        error!("Failed to launch instance with any configuration: {}", message);
        Err(RemoteError::LaunchExhausted(message))
    }

    async fn execute(&self, instance: &Instance, command: &str) -> Result<String, RemoteError> {
        let host = self.host(instance)?;
        let output = self.shell.exec(host, command).await?;

        if !output.stderr.trim().is_empty() {
            warn!(instance_id = %instance.instance_id, "Command stderr: {}", output.stderr.trim());
        }

        if !output.success() {
            error!(
                instance_id = %instance.instance_id,
                "Command failed with {:?}", output.exit_code
            );
            return Err(RemoteError::CommandFailed {
                code: output.exit_code,
                stderr: output.stderr,
            });
        }

        Ok(output.stdout)
    }

    async fn upload(
        &self,
        instance: &Instance,
        local: &Path,
        remote: &str,
    ) -> Result<(), RemoteError> {
        let host = self.host(instance)?;
        self.shell.upload(host, local, remote).await
    }

    async fn download(
        &self,
        instance: &Instance,
        remote: &str,
        local: &Path,
    ) -> Result<(), RemoteError> {
        let host = self.host(instance)?;
        self.shell.download(host, remote, local).await
    }

    async fn terminate(&self, instance: &Instance) -> Result<(), RemoteError> {
        self.provider.terminate(&instance.instance_id).await?;
        info!(instance_id = %instance.instance_id, "Instance terminated");
        Ok(())
    }
}
