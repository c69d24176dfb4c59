//! Test doubles shared by the unit tests

use anyhow::Result;
use async_trait::async_trait;
use darkroom_core::domain::alert::Alert;
use darkroom_core::domain::artifact::ArtifactRef;
use darkroom_core::domain::instance::{Instance, InstanceStatus};
use darkroom_core::domain::job::{Job, JobPayload, SubjectProfile, TrainingPayload};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::collaborators::{Persistence, PhotobookOutput, TrainingCommit};
use crate::config::ProviderConfig;
use crate::error::{ProviderError, RemoteError};
use crate::pool::{AlertHandler, JobHandler};
use crate::remote::{CommandOutput, ComputeProvider, RemoteShell};

pub fn training_payload(model_id: i64) -> JobPayload {
    JobPayload::Training(TrainingPayload {
        model_id,
        images: vec![format!("/uploads/{}.jpg", model_id)],
        subject: SubjectProfile::default(),
    })
}

pub fn test_provider_config() -> ProviderConfig {
    ProviderConfig {
        instance_types: vec!["gpu_a100".to_string(), "gpu_a10".to_string()],
        regions: vec!["west".to_string(), "east".to_string()],
        launch_timeout: Duration::from_secs(5),
        status_poll_interval: Duration::from_millis(1),
        status_retry_backoff: Duration::from_millis(1),
        ..ProviderConfig::default()
    }
}

// ============================================================================
// Compute provider
// ============================================================================

/// Provider answering from scripted queues
///
/// Launches with nothing scripted fail with an API error; status queries
/// with nothing scripted report the instance active.
#[derive(Default)]
pub struct ScriptedProvider {
    launches: Mutex<VecDeque<Result<String, ProviderError>>>,
    statuses: Mutex<VecDeque<Result<InstanceStatus, ProviderError>>>,
    attempts: Mutex<Vec<(String, String)>>,
    terminated: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_launch(&self, outcome: Result<String, ProviderError>) {
        self.launches.lock().unwrap().push_back(outcome);
    }

    pub fn push_status(&self, outcome: Result<InstanceStatus, ProviderError>) {
        self.statuses.lock().unwrap().push_back(outcome);
    }

    /// `(instance_type, region)` of every launch call
    pub fn launch_attempts(&self) -> Vec<(String, String)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeProvider for ScriptedProvider {
    async fn launch(&self, instance_type: &str, region: &str) -> Result<String, ProviderError> {
        self.attempts
            .lock()
            .unwrap()
            .push((instance_type.to_string(), region.to_string()));

        self.launches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::Api {
                    status: 500,
                    message: "no launch scripted".to_string(),
                })
            })
    }

    async fn instance(&self, instance_id: &str) -> Result<Instance, ProviderError> {
        let status = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(InstanceStatus::Active))?;

        Ok(Instance {
            instance_id: instance_id.to_string(),
            ip: (status == InstanceStatus::Active).then(|| "10.0.0.1".to_string()),
            status,
            region: "west".to_string(),
            instance_type: "gpu_a10".to_string(),
        })
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.terminated.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Remote shell
// ============================================================================

struct Rule {
    pattern: String,
    output: CommandOutput,
}

/// Shell answering commands from pattern rules
///
/// The first rule whose pattern the command contains wins; unmatched
/// commands succeed with empty output. Uploads check the local file
/// exists; downloads write a small file.
#[derive(Default)]
pub struct ScriptedShell {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, stdout: &str, stderr: &str, code: i32) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            output: CommandOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code: Some(code),
            },
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn exec(&self, _host: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        self.commands.lock().unwrap().push(command.to_string());

        let rules = self.rules.lock().unwrap();
        let output = rules
            .iter()
            .find(|rule| command.contains(&rule.pattern))
            .map(|rule| rule.output.clone())
            .unwrap_or(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
            });
        Ok(output)
    }

    async fn upload(&self, _host: &str, local: &Path, _remote: &str) -> Result<(), RemoteError> {
        if !local.exists() {
            return Err(RemoteError::TransferFailed {
                path: local.display().to_string(),
                stderr: "No such file".to_string(),
            });
        }
        Ok(())
    }

    async fn download(&self, _host: &str, remote: &str, local: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RemoteError::TransferFailed {
                path: remote.to_string(),
                stderr: e.to_string(),
            })?;
        }
        std::fs::write(local, remote.as_bytes()).map_err(|e| RemoteError::TransferFailed {
            path: remote.to_string(),
            stderr: e.to_string(),
        })
    }
}

// ============================================================================
// Pool collaborators
// ============================================================================

/// Alert handler that keeps every alert
#[derive(Default)]
pub struct RecordingAlertHandler {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.alerts().into_iter().map(|alert| alert.error).collect()
    }
}

#[async_trait]
impl AlertHandler for RecordingAlertHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Job handler with scripted failures
///
/// Succeeds by default. Attempts are counted when a run starts.
#[derive(Default)]
pub struct ScriptedHandler {
    failures: Mutex<HashMap<String, usize>>,
    panics: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, usize>>,
    terminal: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` runs of `job_id` fail
    pub fn fail_times(&self, job_id: &str, times: usize) {
        self.failures.lock().unwrap().insert(job_id.to_string(), times);
    }

    pub fn panic_on(&self, job_id: &str) {
        self.panics.lock().unwrap().push(job_id.to_string());
    }

    /// Makes every run take `delay`
    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn attempts(&self, job_id: &str) -> usize {
        self.attempts.lock().unwrap().get(job_id).copied().unwrap_or(0)
    }

    /// Jobs passed to `on_terminal_failure`, in order
    pub fn terminal_failures(&self) -> Vec<String> {
        self.terminal.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, job: &Job) -> Result<JsonValue> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(job.job_id.clone())
            .or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.panics.lock().unwrap().contains(&job.job_id) {
            panic!("scripted panic for {}", job.job_id);
        }

        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&job.job_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            anyhow::bail!("scripted failure for {}", job.job_id);
        }

        Ok(json!({ "job_id": job.job_id }))
    }

    async fn on_terminal_failure(&self, job: &Job, _error: &str) {
        self.terminal.lock().unwrap().push(job.job_id.clone());
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Persistence that logs every call as a line of text
#[derive(Default)]
pub struct MemoryPersistence {
    events: Mutex<Vec<String>>,
    photobooks: Mutex<Vec<PhotobookOutput>>,
    next_image_id: Mutex<i64>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Photobooks passed to the last training commit
    pub fn photobooks(&self) -> Vec<PhotobookOutput> {
        self.photobooks.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn start_training(&self, model_id: i64) -> Result<()> {
        self.record(format!("start_training {}", model_id));
        Ok(())
    }

    async fn complete_training(
        &self,
        model_id: i64,
        _owner_id: i64,
        weights: &ArtifactRef,
        photobooks: &[PhotobookOutput],
    ) -> Result<TrainingCommit> {
        self.record(format!("complete_training {}: {}", model_id, weights));
        *self.photobooks.lock().unwrap() = photobooks.to_vec();

        Ok(TrainingCommit {
            photobook_ids: (1..=photobooks.len() as i64).collect(),
            failed_themes: Vec::new(),
        })
    }

    async fn fail_training(&self, model_id: i64, error: &str) -> Result<()> {
        self.record(format!("fail_training {}: {}", model_id, error));
        Ok(())
    }

    async fn record_generated_image(
        &self,
        _owner_id: i64,
        model_id: i64,
        prompt: &str,
        _image: &ArtifactRef,
    ) -> Result<i64> {
        let mut next = self.next_image_id.lock().unwrap();
        *next += 1;
        let image_id = *next;
        drop(next);

        self.record(format!("record_generated_image {}: {}", model_id, prompt));
        Ok(image_id)
    }

    async fn complete_photobook(&self, photobook_id: i64, images: &[ArtifactRef]) -> Result<()> {
        self.record(format!("complete_photobook {}: {} image(s)", photobook_id, images.len()));
        Ok(())
    }

    async fn fail_photobook(&self, photobook_id: i64, error: &str) -> Result<()> {
        self.record(format!("fail_photobook {}: {}", photobook_id, error));
        Ok(())
    }
}
