//! Remote shell
//!
//! Runs commands on an instance and moves files to and from it by driving
//! the system `ssh` and `scp` binaries.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::RemoteError;

/// Raw output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Command execution and file transfer on a remote host
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` on `host`; a non-zero exit status is not an error here
    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError>;

    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<(), RemoteError>;

    async fn download(&self, host: &str, remote: &str, local: &Path) -> Result<(), RemoteError>;
}

/// OpenSSH implementation of RemoteShell
pub struct SshShell {
    user: String,
    key_path: PathBuf,
    connect_timeout: Duration,
}

impl SshShell {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Options shared by ssh and scp
    fn common_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }

    fn target(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<CommandOutput, RemoteError> {
        let output = Command::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    async fn copy(&self, from: String, to: String) -> Result<(), RemoteError> {
        let mut args = self.common_args();
        args.push("-q".to_string());
        args.push(from.clone());
        args.push(to.clone());

        let output = self.run("scp", args).await?;
        if !output.success() {
            warn!("scp {} -> {} failed: {}", from, to, output.stderr.trim());
            return Err(RemoteError::TransferFailed {
                path: from,
                stderr: output.stderr,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        let mut args = self.common_args();
        args.push(self.target(host));
        args.push(command.to_string());

        debug!(host, "Executing remote command: {}", command);
        self.run("ssh", args).await
    }

    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<(), RemoteError> {
        info!("Uploading {} to {}:{}", local.display(), host, remote);
        self.copy(
            local.display().to_string(),
            format!("{}:{}", self.target(host), remote),
        )
        .await
    }

    async fn download(&self, host: &str, remote: &str, local: &Path) -> Result<(), RemoteError> {
        info!("Downloading {}:{} to {}", host, remote, local.display());
        self.copy(
            format!("{}:{}", self.target(host), remote),
            local.display().to_string(),
        )
        .await
    }
}
