//! Error types for the job engine

use thiserror::Error;

/// Record store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// Job queue failures
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Corrupt job record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job {0} kept changing under concurrent updates")]
    Contention(String),
}

/// GPU provider control API failures
///
/// The first four variants drive the launch loop's choice between trying
/// the next region and the next instance type.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("Invalid instance type: {0}")]
    InvalidInstanceType(String),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else {
            ProviderError::Request(err.to_string())
        }
    }
}

/// Remote execution failures
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Failed to launch instance with any configuration. Errors: {0}")]
    LaunchExhausted(String),

    #[error("Instance {instance_id} failed with status: {status}")]
    InstanceFailed { instance_id: String, status: String },

    #[error("Instance {0} is active but has no IP address")]
    MissingAddress(String),

    #[error("Instance {0} startup timeout")]
    StartupTimeout(String),

    #[error("Remote command exited with {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("Transfer of {path} failed: {stderr}")]
    TransferFailed { path: String, stderr: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Model cache failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to fetch {artifact}: {message}")]
    Fetch { artifact: String, message: String },
}
