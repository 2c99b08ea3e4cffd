use crate::error::SinkError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the sink service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Local buffering configuration
    #[serde(default)]
    pub local: LocalConfig,
    /// Time partitioning configuration
    #[serde(default)]
    pub partitioning: PartitioningConfig,
    /// File rotation configuration
    #[serde(default)]
    pub rotation: RotationConfig,
    /// Upload worker pool configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Remote object storage backend
    #[serde(default)]
    pub storage: StorageConfig,
    /// Kafka consumer configuration (only needed by the binary)
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// On-disk encoding of buffered records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// Record values written verbatim, back to back
    Raw,
    /// One JSON document per line
    #[default]
    JsonLines,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Raw => "bin",
            FileFormat::JsonLines => "jsonl",
        }
    }
}

/// Local buffering configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Directory under which partition files are buffered
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Encoding of buffered files
    #[serde(default)]
    pub file_format: FileFormat,
    /// Add broker metadata (topic, partition, offset, ...) to JSON lines
    #[serde(default)]
    pub include_metadata: bool,
    /// Nest broker metadata under this column; empty means top-level fields
    #[serde(default)]
    pub metadata_column: String,
    /// Upload files left behind by a previous process before ingesting
    #[serde(default = "default_true")]
    pub recover_on_start: bool,
    /// Prefix of every file name, keeping names unique across restarts and
    /// replicas. Empty means bare sequence numbers.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

/// Size of the time bucket a partition covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// No time segments; only the fixed prefix segments
    None,
    Day,
    #[default]
    Hour,
}

/// Where the partitioning instant of a record comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// Broker-assigned record timestamp
    #[default]
    Broker,
    /// A field of the JSON payload (see `timestamp_field`)
    Payload,
}

/// Time partitioning configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PartitioningConfig {
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub timestamp_source: TimestampSource,
    /// Payload field holding the event time (RFC 3339 or epoch seconds/millis)
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// strftime pattern for the date segment
    #[serde(default = "default_date_pattern")]
    pub date_pattern: String,
    #[serde(default = "default_date_prefix")]
    pub date_prefix: String,
    #[serde(default = "default_hour_prefix")]
    pub hour_prefix: String,
    /// IANA time zone the buckets are computed in
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Use the record topic as the first path segment
    #[serde(default = "default_true")]
    pub include_topic: bool,
    /// Fixed segments placed before everything else
    #[serde(default)]
    pub prefix: Vec<String>,
}

/// File rotation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    /// Rotate once a file holds at least this many bytes
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    /// Rotate once a file has been open this long
    #[serde(default = "default_max_file_age_secs")]
    pub max_file_age_secs: u64,
    /// Rotate once a file holds this many records (disabled when unset)
    #[serde(default)]
    pub max_records: Option<u64>,
    /// Period of the background age sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Upload worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Maximum number of concurrent uploads
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    /// Attempts per file before giving up (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Timeout of a single upload attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// How long shutdown waits for queued and in-flight uploads
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Key prefix in the remote store
    #[serde(default)]
    pub remote_prefix: String,
}

/// Remote object storage backend
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    S3(S3Config),
    /// Directory tree standing in for a bucket
    Local(LocalStoreConfig),
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStoreConfig {
    pub root: PathBuf,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topics to drain
    pub topics: Vec<String>,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// How often offsets of uploaded records are committed
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "objectstore-sink".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/tmp/objectstore-sink")
}

fn default_instance_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        std::process::id()
    )
}

fn default_timestamp_field() -> String {
    "event_timestamp".to_string()
}

fn default_date_pattern() -> String {
    "%Y-%m-%d".to_string()
}

fn default_date_prefix() -> String {
    "dt=".to_string()
}

fn default_hour_prefix() -> String {
    "hr=".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_max_file_size_bytes() -> u64 {
    256 * 1024 * 1024 // 256MB
}

fn default_max_file_age_secs() -> u64 {
    3600
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

fn default_shutdown_grace_secs() -> u64 {
    30
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

fn default_consumer_group() -> String {
    "objectstore-sink".to_string()
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

fn default_commit_interval_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            // Add config file if present
            .add_source(config::File::with_name("config/sink").required(false))
            .add_source(config::File::with_name("/etc/objectstore-sink/sink").required(false))
            // Override with environment variables
            // SINK__UPLOAD__CONCURRENCY -> upload.concurrency
            .add_source(
                config::Environment::with_prefix("SINK")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.topics")
                    .with_list_parse_key("partitioning.prefix")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.upload.concurrency == 0 {
            return Err(SinkError::Config("upload.concurrency must be > 0".into()));
        }
        if self.upload.max_attempts == 0 {
            return Err(SinkError::Config("upload.max_attempts must be > 0".into()));
        }
        if self.upload.attempt_timeout_secs == 0 {
            return Err(SinkError::Config(
                "upload.attempt_timeout_secs must be > 0".into(),
            ));
        }
        if self.rotation.max_file_size_bytes == 0 {
            return Err(SinkError::Config(
                "rotation.max_file_size_bytes must be > 0".into(),
            ));
        }
        if self.rotation.max_file_age_secs == 0 {
            return Err(SinkError::Config("rotation.max_file_age_secs must be > 0".into()));
        }
        if self.rotation.max_records == Some(0) {
            return Err(SinkError::Config("rotation.max_records must be > 0".into()));
        }
        if self.rotation.sweep_interval_ms == 0 {
            return Err(SinkError::Config("rotation.sweep_interval_ms must be > 0".into()));
        }
        if self.upload.backoff_multiplier < 1.0 {
            return Err(SinkError::Config(
                "upload.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        self.partitioning.time_zone()?;
        Ok(())
    }
}

impl PartitioningConfig {
    /// Parse the configured time zone
    pub fn time_zone(&self) -> Result<chrono_tz::Tz, SinkError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| SinkError::Config(format!("unknown timezone {:?}: {}", self.timezone, e)))
    }
}

impl RotationConfig {
    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl KafkaConfig {
    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }
}

impl UploadConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            file_format: FileFormat::default(),
            include_metadata: false,
            metadata_column: String::new(),
            recover_on_start: true,
            instance_id: default_instance_id(),
        }
    }
}

impl Default for PartitioningConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::default(),
            timestamp_source: TimestampSource::default(),
            timestamp_field: default_timestamp_field(),
            date_pattern: default_date_pattern(),
            date_prefix: default_date_prefix(),
            hour_prefix: default_hour_prefix(),
            timezone: default_timezone(),
            include_topic: true,
            prefix: Vec::new(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size_bytes(),
            max_file_age_secs: default_max_file_age_secs(),
            max_records: None,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_upload_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            remote_prefix: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local(LocalStoreConfig {
            root: PathBuf::from("/tmp/objectstore-sink-remote"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_upload_concurrency(), 4);
        assert_eq!(default_max_attempts(), 5);
        assert_eq!(default_date_prefix(), "dt=");
        assert_eq!(FileFormat::default().extension(), "jsonl");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_timezone() {
        let mut config = Config::default();
        config.partitioning.timezone = "Mars/Olympus_Mons".to_string();
        assert!(matches!(config.validate(), Err(SinkError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.upload.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempt_timeout() {
        let mut config = Config::default();
        config.upload.attempt_timeout_secs = 0;
        match config.validate() {
            Err(SinkError::Config(message)) => assert!(message.contains("attempt_timeout_secs")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_tagged_storage() {
        let json = r#"{
            "storage": { "type": "s3", "bucket": "sink-bucket" },
            "partitioning": { "granularity": "day", "timestamp_source": "payload" },
            "local": { "file_format": "raw" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        match config.storage {
            StorageConfig::S3(s3) => {
                assert_eq!(s3.bucket, "sink-bucket");
                assert_eq!(s3.region, "us-east-1");
            }
            other => panic!("unexpected storage config: {:?}", other),
        }
        assert_eq!(config.partitioning.granularity, Granularity::Day);
        assert_eq!(config.partitioning.timestamp_source, TimestampSource::Payload);
        assert_eq!(config.local.file_format, FileFormat::Raw);
        assert!(config.kafka.is_none());
    }

    #[test]
    fn test_deserialize_kafka_defaults() {
        let json = r#"{
            "kafka": { "bootstrap_servers": "localhost:9092", "topics": ["orders", "payments"] }
        }"#;
        let kafka = serde_json::from_str::<Config>(json).unwrap().kafka.unwrap();

        assert_eq!(kafka.topics, vec!["orders", "payments"]);
        assert_eq!(kafka.consumer_group, "objectstore-sink");
        assert_eq!(kafka.auto_offset_reset, "earliest");
        assert_eq!(kafka.commit_interval(), Duration::from_secs(5));
        assert!(!kafka.ssl_enabled);
    }
}
