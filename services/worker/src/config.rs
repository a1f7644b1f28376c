use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Worker configuration, layered from files and `WORKER__*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub kafka: KafkaConfig,
    pub s3: S3Config,
    pub database: DatabaseConfig,
    /// Frame extraction and admission settings
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Status API served next to the consumer
    #[serde(default)]
    pub api: ApiConfig,
}

/// Identity and observability of the process
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Name reported in logs and by `/info`
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port of the Prometheus scrape endpoint
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Upload notification consumer
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Comma separated broker list
    pub bootstrap_servers: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying uploaded video notifications
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Connect over SASL_SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    pub ssl_ca_location: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Where a new consumer group starts reading (`earliest` or `latest`)
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Must exceed the time the gate can block the loop
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

/// Object storage for videos and archives
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploaded videos and generated archives
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// S3-compatible endpoint such as MinIO
    pub endpoint_url: Option<String>,
    /// Address objects as `endpoint/bucket/key`
    #[serde(default)]
    pub force_path_style: bool,
    /// Static access key; the default AWS credential chain is used when unset
    pub access_key_id: Option<String>,
    /// Static secret key, paired with `access_key_id`
    pub secret_access_key: Option<String>,
    /// Archives at least this large are uploaded in parts
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// S3 rejects parts under 5 MiB except the last one
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// PostgreSQL pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Apply `migrations/` before consuming
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Frame extraction and admission settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum number of videos processed at once
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
    /// Frames sampled per second of video
    #[serde(default = "default_sampling_rate_hz")]
    pub sampling_rate_hz: f64,
    /// Transcoder executable
    #[serde(default = "default_transcoder_path")]
    pub transcoder_path: String,
    /// Wall-clock limit for one transcoder run
    #[serde(default = "default_transcoder_timeout_secs")]
    pub transcoder_timeout_secs: u64,
    /// Quality passed to the transcoder's MJPEG encoder (lower is better)
    #[serde(default = "default_transcoder_quality")]
    pub transcoder_quality: u8,
    /// JPEG quality of archive entries (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Non-zero exit codes accepted when at least one frame was decoded
    #[serde(default = "default_tolerated_exit_codes")]
    pub tolerated_exit_codes: Vec<i32>,
    /// Upper bound on a single encoded frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// How long shutdown waits for in-flight videos
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

/// API configuration for the status and download endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Empty allows any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("processing.worker_limit must be at least 1")]
    ZeroWorkerLimit,

    #[error("processing.sampling_rate_hz must be positive, got {0}")]
    InvalidSamplingRate(f64),

    #[error("processing.jpeg_quality must be between 1 and 100, got {0}")]
    InvalidJpegQuality(u8),

    #[error("processing.max_frame_bytes must be positive")]
    ZeroMaxFrameBytes,

    #[error("{0} must not be empty")]
    Missing(&'static str),
}

fn default_service_name() -> String {
    "vidframe-worker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "vidframe-worker".to_string()
}

fn default_topic() -> String {
    "vidframe.videos.uploaded".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_worker_limit() -> usize {
    2
}

fn default_sampling_rate_hz() -> f64 {
    1.0
}

fn default_transcoder_path() -> String {
    "ffmpeg".to_string()
}

fn default_transcoder_timeout_secs() -> u64 {
    30
}

fn default_transcoder_quality() -> u8 {
    2
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_tolerated_exit_codes() -> Vec<i32> {
    vec![1, 183]
}

fn default_max_frame_bytes() -> usize {
    32 * 1024 * 1024 // 32MB
}

fn default_drain_timeout_secs() -> u64 {
    60
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/worker").required(false))
            .add_source(config::File::with_name("/etc/vidframe/worker").required(false))
            // WORKER__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("WORKER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("processing.tolerated_exit_codes")
                    .with_list_parse_key("api.cors_origins"),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::Missing("kafka.bootstrap_servers"));
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(ConfigError::Missing("kafka.topic"));
        }
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::Missing("s3.bucket"));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Missing("database.url"));
        }
        self.processing.validate()
    }

    /// Shutdown grace period for in-flight videos
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.drain_timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ProcessingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_limit == 0 {
            return Err(ConfigError::ZeroWorkerLimit);
        }
        if !(self.sampling_rate_hz.is_finite() && self.sampling_rate_hz > 0.0) {
            return Err(ConfigError::InvalidSamplingRate(self.sampling_rate_hz));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::InvalidJpegQuality(self.jpeg_quality));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ZeroMaxFrameBytes);
        }
        if self.transcoder_path.trim().is_empty() {
            return Err(ConfigError::Missing("processing.transcoder_path"));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_limit: default_worker_limit(),
            sampling_rate_hz: default_sampling_rate_hz(),
            transcoder_path: default_transcoder_path(),
            transcoder_timeout_secs: default_transcoder_timeout_secs(),
            transcoder_quality: default_transcoder_quality(),
            jpeg_quality: default_jpeg_quality(),
            tolerated_exit_codes: default_tolerated_exit_codes(),
            max_frame_bytes: default_max_frame_bytes(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}
