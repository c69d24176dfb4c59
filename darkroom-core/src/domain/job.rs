//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::domain::artifact::ArtifactRef;

/// Job record
///
/// Stored once per job-id by the engine. Only the worker that dequeued the
/// job, or the supervisor during stuck-job recovery, mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub owner_id: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub retries: u32,
    pub payload: JobPayload,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl Job {
    /// Creates a new PENDING job for `owner_id`
    ///
    /// The job type is taken from the payload variant so the two can never disagree.
    pub fn new(owner_id: i64, payload: JobPayload) -> Self {
        let now = Utc::now();
        let job_type = payload.job_type();

        Self {
            job_id: Self::generate_id(job_type, owner_id, now),
            job_type,
            owner_id,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            retries: 0,
            payload,
            result: None,
            error: None,
        }
    }

    /// Builds a job id from type, owner and timestamp
    ///
    /// A short random suffix keeps ids unique when the same owner submits
    /// twice within one clock tick.
    pub fn generate_id(job_type: JobType, owner_id: i64, now: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{}_{}",
            job_type.as_str(),
            owner_id,
            now.timestamp_micros(),
            &suffix[..8]
        )
    }

    /// Wall-clock time between start and completion, if both are known
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// When the job became terminal, or `None` if it is still live
    pub fn terminal_since(&self) -> Option<DateTime<Utc>> {
        if !self.status.is_terminal() {
            return None;
        }
        Some(self.completed_at.unwrap_or(self.updated_at))
    }
}

/// Kind of work a job represents
///
/// Each kind has its own FIFO list of pending job-ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Training,
    SingleGeneration,
    BatchGeneration,
}

impl JobType {
    /// Order in which workers poll the queues
    pub const PRIORITY: [JobType; 3] = [
        JobType::Training,
        JobType::SingleGeneration,
        JobType::BatchGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Training => "training",
            JobType::SingleGeneration => "single_generation",
            JobType::BatchGeneration => "batch_generation",
        }
    }

    /// Name of the pending list holding jobs of this type
    pub fn queue_name(&self) -> &'static str {
        match self {
            JobType::Training => "training_jobs",
            JobType::SingleGeneration => "single_generation_jobs",
            JobType::BatchGeneration => "batch_generation_jobs",
        }
    }

    pub fn from_queue_name(name: &str) -> Option<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|job_type| job_type.queue_name() == name)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward transitions a worker may apply through a status update
    ///
    /// Going back to PENDING is not a status update, it is a retry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (*self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Whether a job in this status may be put back on its queue
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// What a status update carries besides the new status
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Result(JsonValue),
    Error(String),
}

/// Job payload, one variant per job type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Training(TrainingPayload),
    SingleGeneration(SingleGenerationPayload),
    BatchGeneration(BatchGenerationPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Training(_) => JobType::Training,
            JobPayload::SingleGeneration(_) => JobType::SingleGeneration,
            JobPayload::BatchGeneration(_) => JobType::BatchGeneration,
        }
    }
}

/// Train a personal model from uploaded images, then render its initial photobooks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPayload {
    pub model_id: i64,
    /// Local paths of the uploaded training images
    pub images: Vec<String>,
    #[serde(default)]
    pub subject: SubjectProfile,
}

/// Render one image from a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleGenerationPayload {
    pub model_id: i64,
    pub weights: ArtifactRef,
    pub prompt: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, JsonValue>,
}

/// Render a themed photobook from a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchGenerationPayload {
    pub photobook_id: i64,
    pub model_id: i64,
    pub theme_name: String,
    pub prompts: Vec<String>,
    pub weights: ArtifactRef,
}

/// Who the model depicts; drives theme selection and prompt wording
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectProfile {
    #[serde(default)]
    pub sex: Sex,
    #[serde(default)]
    pub age_years: Option<u32>,
    #[serde(default)]
    pub age_months: Option<u32>,
}

impl SubjectProfile {
    const DEFAULT_AGE_YEARS: u32 = 4;

    /// Age in fractional years, defaulting missing parts
    pub fn age_in_years(&self) -> f64 {
        let years = self.age_years.unwrap_or(Self::DEFAULT_AGE_YEARS) as f64;
        let months = self.age_months.unwrap_or(0) as f64;
        years + months / 12.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[default]
    #[serde(rename = "U")]
    Unspecified,
}
