//! Configuration loading and types for bleepload.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: the upload engine itself, the object storage client, logging,
//! and metrics.  Unknown keys are rejected at load time.
//!
//! Upload options may also be overridden from the environment with
//! `BLEEPLOAD_<OPTION>` variables (see [`apply_env_overrides`]).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::errors::UploadError;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "BLEEPLOAD_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Upload engine settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Object storage client settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Upload engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    /// Sources larger than this many bytes use multipart upload.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    /// Requested part size in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Number of concurrent part uploads for a typical file.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Administrator ceiling for concurrency on very large files.
    #[serde(default = "default_max_concurrency_ceiling")]
    pub max_concurrency_ceiling: usize,

    /// Total attempts allowed per part (first try included).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Server-imposed maximum number of parts per session.
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,

    /// Timeout applied to every individual network call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Optional whole-transfer deadline in seconds.  Reaching it stops
    /// dispatch and lets in-flight parts finish.
    #[serde(default)]
    pub session_deadline_secs: Option<u64>,

    /// Stop dispatching new parts as soon as one part fails.
    #[serde(default)]
    pub fail_fast: bool,

    /// Directory holding local session records for resume.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_multipart_threshold(),
            part_size: default_part_size(),
            max_concurrency: default_max_concurrency(),
            max_concurrency_ceiling: default_max_concurrency_ceiling(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_parts: default_max_parts(),
            call_timeout_secs: default_call_timeout_secs(),
            session_deadline_secs: None,
            fail_fast: false,
            state_dir: default_state_dir(),
        }
    }
}

impl UploadConfig {
    /// Check option values that serde cannot express.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.part_size == 0 {
            return Err(UploadError::InvalidConfig("part_size must be > 0".into()));
        }
        if self.max_concurrency == 0 {
            return Err(UploadError::InvalidConfig(
                "max_concurrency must be > 0".into(),
            ));
        }
        if self.max_concurrency_ceiling < self.max_concurrency {
            return Err(UploadError::InvalidConfig(format!(
                "max_concurrency_ceiling ({}) is below max_concurrency ({})",
                self.max_concurrency_ceiling, self.max_concurrency
            )));
        }
        if self.max_retries == 0 {
            return Err(UploadError::InvalidConfig("max_retries must be > 0".into()));
        }
        if self.max_parts == 0 {
            return Err(UploadError::InvalidConfig("max_parts must be > 0".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(UploadError::InvalidConfig(
                "call_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Per-call network timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Optional session-level deadline.
    pub fn session_deadline(&self) -> Option<Duration> {
        self.session_deadline_secs.map(Duration::from_secs)
    }
}

/// Object storage client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Backend type: `aws` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// S3 client configuration.
    #[serde(default)]
    pub aws: AwsStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            aws: AwsStorageConfig::default(),
        }
    }
}

/// S3 client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsStorageConfig {
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

impl Default for AwsStorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: String::new(),
            use_path_style: false,
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Address for the Prometheus scrape listener (e.g. `127.0.0.1:9464`).
    /// Metrics are not exported when unset.
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

// -- Defaults ----------------------------------------------------------------

fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_concurrency_ceiling() -> usize {
    32
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    20_000
}

fn default_max_parts() -> u32 {
    10_000
}

fn default_call_timeout_secs() -> u64 {
    300
}

fn default_state_dir() -> String {
    "./.bleepload".to_string()
}

fn default_storage_backend() -> String {
    "aws".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text and validate it.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    // An empty document deserializes to `null`; treat it as all defaults.
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    config.upload.validate()?;
    Ok(config)
}

/// Apply `BLEEPLOAD_<OPTION>` overrides from `vars` onto `upload`.
///
/// Variables without the prefix are ignored.  A prefixed variable that
/// names no known option, or whose value does not parse, is an error.
pub fn apply_env_overrides<I, K, V>(upload: &mut UploadConfig, vars: I) -> Result<(), UploadError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    for (key, value) in vars {
        let Some(option) = key.as_ref().strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let value = value.as_ref().trim();
        match option {
            "MULTIPART_THRESHOLD" => upload.multipart_threshold = parse_env(option, value)?,
            "PART_SIZE" => upload.part_size = parse_env(option, value)?,
            "MAX_CONCURRENCY" => upload.max_concurrency = parse_env(option, value)?,
            "MAX_CONCURRENCY_CEILING" => {
                upload.max_concurrency_ceiling = parse_env(option, value)?
            }
            "MAX_RETRIES" => upload.max_retries = parse_env(option, value)?,
            "RETRY_BASE_DELAY_MS" => upload.retry_base_delay_ms = parse_env(option, value)?,
            "RETRY_MAX_DELAY_MS" => upload.retry_max_delay_ms = parse_env(option, value)?,
            "MAX_PARTS" => upload.max_parts = parse_env(option, value)?,
            "CALL_TIMEOUT_SECS" => upload.call_timeout_secs = parse_env(option, value)?,
            "SESSION_DEADLINE_SECS" => {
                upload.session_deadline_secs = Some(parse_env(option, value)?)
            }
            "FAIL_FAST" => upload.fail_fast = parse_env(option, value)?,
            "STATE_DIR" => upload.state_dir = value.to_string(),
            other => {
                return Err(UploadError::InvalidConfig(format!(
                    "unknown environment option {ENV_PREFIX}{other}"
                )))
            }
        }
    }
    upload.validate()
}

fn parse_env<T: std::str::FromStr>(option: &str, value: &str) -> Result<T, UploadError> {
    value.parse().map_err(|_| {
        UploadError::InvalidConfig(format!(
            "{ENV_PREFIX}{option} has an unparsable value '{value}'"
        ))
    })
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.upload.multipart_threshold, 64 * 1024 * 1024);
        assert_eq!(config.upload.part_size, 8 * 1024 * 1024);
        assert_eq!(config.upload.max_concurrency, 8);
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.upload.max_parts, 10_000);
        assert!(!config.upload.fail_fast);
        assert_eq!(config.storage.backend, "aws");
        assert_eq!(config.logging.level, "info");
        assert!(config.observability.metrics_listen.is_none());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
upload:
  multipart_threshold: 1048576
  part_size: 524288
  max_concurrency: 4
  max_retries: 3
  fail_fast: true
  session_deadline_secs: 600
storage:
  backend: memory
logging:
  format: json
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.upload.multipart_threshold, 1_048_576);
        assert_eq!(config.upload.part_size, 524_288);
        assert_eq!(config.upload.max_concurrency, 4);
        assert_eq!(config.upload.max_retries, 3);
        assert!(config.upload.fail_fast);
        assert_eq!(
            config.upload.session_deadline(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = "upload:\n  part_size: 10\n  chunk_size: 10\n";
        assert!(parse_config(yaml).is_err());

        let yaml = "uploads:\n  part_size: 10\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_zero_part_size_rejected() {
        assert!(parse_config("upload:\n  part_size: 0\n").is_err());
    }

    #[test]
    fn test_ceiling_below_concurrency_rejected() {
        let yaml = "upload:\n  max_concurrency: 10\n  max_concurrency_ceiling: 4\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut upload = UploadConfig::default();
        apply_env_overrides(
            &mut upload,
            vec![
                ("BLEEPLOAD_PART_SIZE", "1024"),
                ("BLEEPLOAD_MAX_CONCURRENCY", "2"),
                ("BLEEPLOAD_FAIL_FAST", "true"),
                ("BLEEPLOAD_STATE_DIR", "/tmp/state"),
                ("HOME", "/root"),
            ],
        )
        .unwrap();
        assert_eq!(upload.part_size, 1024);
        assert_eq!(upload.max_concurrency, 2);
        assert!(upload.fail_fast);
        assert_eq!(upload.state_dir, "/tmp/state");
    }

    #[test]
    fn test_env_unknown_key_rejected() {
        let mut upload = UploadConfig::default();
        let err = apply_env_overrides(&mut upload, vec![("BLEEPLOAD_CHUNKSIZE", "1")]).unwrap_err();
        assert!(err.to_string().contains("BLEEPLOAD_CHUNKSIZE"));
    }

    #[test]
    fn test_env_bad_value_rejected() {
        let mut upload = UploadConfig::default();
        assert!(apply_env_overrides(&mut upload, vec![("BLEEPLOAD_MAX_RETRIES", "many")]).is_err());
    }
}
