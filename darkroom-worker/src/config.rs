//! Engine configuration
//!
//! Defines all tunable parameters of the job engine:
//! - Worker pool sizing, retry budget and supervisor cadence
//! - GPU provider access and launch preferences
//! - Remote environment layout (toolkit repository, container image)
//! - Model cache location and bound
//! - Monitor cadence and retention
//! - Alert delivery

use anyhow::anyhow;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Record store used when `REDIS_URL` is not set
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Record store URL; `memory://` selects the in-process store
    pub redis_url: String,

    /// Root directory of the local storage collaborator
    pub storage_root: PathBuf,

    /// JSON theme catalog used for initial photobooks
    pub themes_file: Option<PathBuf>,

    pub pool: PoolConfig,
    pub provider: ProviderConfig,
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    pub alerts: AlertConfig,
}

/// Worker pool and supervisor settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,

    /// Pending jobs per worker above which the pool grows
    pub jobs_per_worker_threshold: f64,

    /// Largest change in worker count per supervisor tick
    pub scale_step: usize,

    pub max_retries: u32,
    pub supervisor_interval: Duration,

    /// PROCESSING jobs older than this are considered orphaned
    pub stuck_threshold: Duration,

    /// Bounded wait of one dequeue attempt
    pub dequeue_timeout: Duration,

    /// Pause after a full pass over the queues found nothing
    pub idle_sleep: Duration,

    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            jobs_per_worker_threshold: 2.0,
            scale_step: 1,
            max_retries: 3,
            supervisor_interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(3600),
            dequeue_timeout: Duration::from_secs(1),
            idle_sleep: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// GPU cloud control API settings
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_url: String,
    pub api_key: String,

    /// Name of the SSH key registered with the provider
    pub ssh_key_name: String,

    /// Local private key matching `ssh_key_name`
    pub ssh_key_path: PathBuf,
    pub ssh_user: String,

    /// Instance types in preference order
    pub instance_types: Vec<String>,

    /// Regions in preference order
    pub regions: Vec<String>,

    pub request_timeout: Duration,
    pub launch_timeout: Duration,
    pub status_poll_interval: Duration,

    /// Base delay between retries of a failed status query (doubles per attempt)
    pub status_retry_backoff: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: "https://cloud.lambdalabs.com/api/v1".to_string(),
            api_key: String::new(),
            ssh_key_name: "darkroom".to_string(),
            ssh_key_path: PathBuf::from("~/.ssh/id_ed25519"),
            ssh_user: "ubuntu".to_string(),
            instance_types: vec![
                "gpu_1x_a100_sxm4".to_string(),
                "gpu_1x_a100".to_string(),
                "gpu_1x_a10".to_string(),
            ],
            regions: vec![
                "us-west-1".to_string(),
                "us-east-1".to_string(),
                "us-south-1".to_string(),
            ],
            request_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(3600),
            status_poll_interval: Duration::from_secs(5),
            status_retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Layout of the remote execution environment
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Home directory on the instance
    pub base_dir: String,

    /// Git repository holding the training and generation toolkit
    pub toolkit_repo: String,

    /// Directory name of the toolkit checkout under `base_dir`
    pub toolkit_dir: String,

    /// Container image with the toolkit's runtime
    pub container_image: String,

    /// Training config file inside the toolkit checkout
    pub training_config: String,

    /// Access token handed to the toolkit for model downloads
    pub access_token: String,

    /// Local scratch space for datasets and downloaded outputs
    pub work_dir: PathBuf,
}

impl RemoteConfig {
    /// Absolute path of the toolkit checkout on the instance
    pub fn workspace(&self) -> String {
        format!("{}/{}", self.base_dir, self.toolkit_dir)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_dir: "/home/ubuntu".to_string(),
            toolkit_repo: "https://github.com/amanzoni1/ai-toolkit.git".to_string(),
            toolkit_dir: "ai-toolkit".to_string(),
            container_image: "amanzoni1/aitoolkit:stable-env".to_string(),
            training_config: "base_training_short.yaml".to_string(),
            access_token: String::new(),
            work_dir: std::env::temp_dir().join("darkroom"),
        }
    }
}

/// Model cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("darkroom-model-cache"),
            max_bytes: 50 * 1024 * 1024 * 1024,
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Job monitor settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,

    /// Terminal jobs older than this are pruned
    pub retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Alert delivery settings
#[derive(Debug, Clone, Default)]
pub struct AlertConfig {
    /// Chat webhook receiving `{"text": ...}` posts
    pub webhook_url: Option<String>,
}

impl Config {
    /// Creates a configuration with defaults for the given store URL
    pub fn new(redis_url: String) -> Self {
        Self {
            redis_url,
            storage_root: std::env::temp_dir().join("darkroom-storage"),
            themes_file: None,
            pool: PoolConfig::default(),
            provider: ProviderConfig::default(),
            remote: RemoteConfig::default(),
            cache: CacheConfig::default(),
            monitor: MonitorConfig::default(),
            alerts: AlertConfig::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Unset variables keep their defaults; a set but malformed one is an
    /// error rather than a silent fallback.
    ///
    /// Expected environment variables:
    /// - REDIS_URL (optional, defaults to a local Redis)
    /// - STORAGE_ROOT, THEMES_FILE (optional paths)
    /// - MIN_WORKERS, MAX_WORKERS, JOBS_PER_WORKER, SCALE_STEP, MAX_RETRIES (optional)
    /// - SUPERVISOR_INTERVAL, STUCK_THRESHOLD, DEQUEUE_TIMEOUT, IDLE_SLEEP,
    ///   SHUTDOWN_TIMEOUT (optional, seconds)
    /// - GPU_API_URL, GPU_API_KEY, SSH_KEY_NAME, SSH_KEY_PATH, SSH_USER (optional)
    /// - INSTANCE_TYPES, REGIONS (optional, comma separated, preferred first)
    /// - GPU_REQUEST_TIMEOUT, LAUNCH_TIMEOUT, STATUS_POLL_INTERVAL (optional, seconds)
    /// - REMOTE_BASE_DIR, TOOLKIT_REPO, CONTAINER_IMAGE, TRAINING_CONFIG,
    ///   TOOLKIT_ACCESS_TOKEN, WORK_DIR (optional)
    /// - CACHE_DIR, CACHE_MAX_BYTES, CACHE_SWEEP_INTERVAL (optional)
    /// - MONITOR_INTERVAL, JOB_RETENTION (optional, seconds)
    /// - ALERT_WEBHOOK_URL (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        let redis_url = match std::env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => {
                info!("REDIS_URL not set, using {}", DEFAULT_REDIS_URL);
                DEFAULT_REDIS_URL.to_string()
            }
        };

        let mut config = Self::new(redis_url);

        if let Some(root) = env_path("STORAGE_ROOT") {
            config.storage_root = root;
        }
        config.themes_file = env_path("THEMES_FILE");

        let pool = &mut config.pool;
        pool.min_workers = env_or("MIN_WORKERS", pool.min_workers)?;
        pool.max_workers = env_or("MAX_WORKERS", pool.max_workers)?;
        pool.jobs_per_worker_threshold = env_or("JOBS_PER_WORKER", pool.jobs_per_worker_threshold)?;
        pool.scale_step = env_or("SCALE_STEP", pool.scale_step)?;
        pool.max_retries = env_or("MAX_RETRIES", pool.max_retries)?;
        pool.supervisor_interval = env_secs("SUPERVISOR_INTERVAL", pool.supervisor_interval)?;
        pool.stuck_threshold = env_secs("STUCK_THRESHOLD", pool.stuck_threshold)?;
        pool.dequeue_timeout = env_secs("DEQUEUE_TIMEOUT", pool.dequeue_timeout)?;
        pool.idle_sleep = env_secs("IDLE_SLEEP", pool.idle_sleep)?;
        pool.shutdown_timeout = env_secs("SHUTDOWN_TIMEOUT", pool.shutdown_timeout)?;

        let provider = &mut config.provider;
        provider.api_url = env_or("GPU_API_URL", provider.api_url.clone())?;
        provider.api_key = env_or("GPU_API_KEY", provider.api_key.clone())?;
        provider.ssh_key_name = env_or("SSH_KEY_NAME", provider.ssh_key_name.clone())?;
        if let Some(path) = env_path("SSH_KEY_PATH") {
            provider.ssh_key_path = path;
        }
        provider.ssh_user = env_or("SSH_USER", provider.ssh_user.clone())?;
        if let Some(types) = env_list("INSTANCE_TYPES") {
            provider.instance_types = types;
        }
        if let Some(regions) = env_list("REGIONS") {
            provider.regions = regions;
        }
        provider.request_timeout = env_secs("GPU_REQUEST_TIMEOUT", provider.request_timeout)?;
        provider.launch_timeout = env_secs("LAUNCH_TIMEOUT", provider.launch_timeout)?;
        provider.status_poll_interval =
            env_secs("STATUS_POLL_INTERVAL", provider.status_poll_interval)?;

        let remote = &mut config.remote;
        remote.base_dir = env_or("REMOTE_BASE_DIR", remote.base_dir.clone())?;
        remote.toolkit_repo = env_or("TOOLKIT_REPO", remote.toolkit_repo.clone())?;
        remote.container_image = env_or("CONTAINER_IMAGE", remote.container_image.clone())?;
        remote.training_config = env_or("TRAINING_CONFIG", remote.training_config.clone())?;
        remote.access_token = env_or("TOOLKIT_ACCESS_TOKEN", remote.access_token.clone())?;
        if let Some(dir) = env_path("WORK_DIR") {
            remote.work_dir = dir;
        }

        if let Some(dir) = env_path("CACHE_DIR") {
            config.cache.dir = dir;
        }
        config.cache.max_bytes = env_or("CACHE_MAX_BYTES", config.cache.max_bytes)?;
        config.cache.sweep_interval = env_secs("CACHE_SWEEP_INTERVAL", config.cache.sweep_interval)?;

        config.monitor.interval = env_secs("MONITOR_INTERVAL", config.monitor.interval)?;
        config.monitor.retention = env_secs("JOB_RETENTION", config.monitor.retention)?;

        config.alerts.webhook_url = std::env::var("ALERT_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.is_empty());

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.redis_url.is_empty() {
            anyhow::bail!("redis_url cannot be empty");
        }

        let pool = &self.pool;
        if pool.max_workers == 0 {
            anyhow::bail!("max_workers must be greater than 0");
        }
        if pool.min_workers > pool.max_workers {
            anyhow::bail!("min_workers cannot exceed max_workers");
        }
        if pool.jobs_per_worker_threshold <= 0.0 {
            anyhow::bail!("jobs_per_worker_threshold must be greater than 0");
        }
        if pool.scale_step == 0 {
            anyhow::bail!("scale_step must be greater than 0");
        }
        if pool.supervisor_interval.is_zero() {
            anyhow::bail!("supervisor_interval must be greater than 0");
        }
        if pool.dequeue_timeout.is_zero() {
            anyhow::bail!("dequeue_timeout must be greater than 0");
        }

        let provider = &self.provider;
        if !provider.api_url.starts_with("http://") && !provider.api_url.starts_with("https://") {
            anyhow::bail!("provider api_url must start with http:// or https://");
        }
        if provider.instance_types.is_empty() {
            anyhow::bail!("at least one instance type is required");
        }
        if provider.regions.is_empty() {
            anyhow::bail!("at least one region is required");
        }
        if provider.request_timeout.is_zero() {
            anyhow::bail!("provider request_timeout must be greater than 0");
        }

        if self.cache.max_bytes == 0 {
            anyhow::bail!("cache max_bytes must be greater than 0");
        }
        if self.cache.sweep_interval.is_zero() || self.monitor.interval.is_zero() {
            anyhow::bail!("background intervals must be greater than 0");
        }

        if let Some(url) = &self.alerts.webhook_url
            && !url.starts_with("http://")
            && !url.starts_with("https://")
        {
            anyhow::bail!("alert webhook_url must start with http:// or https://");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_URL.to_string())
    }
}

/// Parses one variable's raw value
fn parse_value<T>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow!("Invalid value for {}: `{}` ({})", name, raw, e))
}

/// Value of `name`, or `default` when unset or empty; a malformed value is an error
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => parse_value(name, &raw),
        _ => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => parse_value::<u64>(name, &raw).map(Duration::from_secs),
        _ => Ok(default),
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn env_list(name: &str) -> Option<Vec<String>> {
    let items: Vec<String> = std::env::var(name)
        .ok()?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if items.is_empty() { None } else { Some(items) }
}
