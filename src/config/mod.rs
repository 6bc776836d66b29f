//! Configuration loading.
//!
//! Configuration lives in a JSON5 file, by default
//! `~/.config/babycare-predict/config.json5`. A missing file is not an
//! error: every field has a default, and deployment-specific values usually
//! arrive through environment variables instead.
//!
//! Environment overrides (applied after the file):
//!
//! | variable | field |
//! |---|---|
//! | `AWS_REGION` | `aws.region` |
//! | `AWS_ACCESS_KEY_ID` | `aws.accessKeyId` |
//! | `AWS_SECRET_ACCESS_KEY` | `aws.secretAccessKey` |
//! | `AWS_SESSION_TOKEN` | `aws.sessionToken` |
//! | `BABYCARE_S3_BUCKET` | `storage.bucket` |
//! | `BABYCARE_SAGEMAKER_ENDPOINT` | `inference.endpointName` |
//! | `BABYCARE_REDIS_URL` | `redis.url` |

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::aws::{AwsCredentials, AwsError};
use crate::distribution::{redact_url, DEFAULT_CACHE_KEY_PREFIX, DEFAULT_STREAM_NAME};
use crate::logging::LoggingConfig;
use crate::pipeline::PipelineSettings;
use crate::result::ResultShape;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "BABYCARE_PREDICT_CONFIG";

/// Keys whose values are replaced by `config show`.
const SECRET_KEYS: &[&str] = &["secretAccessKey", "sessionToken", "password"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {}", format_issues(.0))]
    Invalid(Vec<ValidationError>),

    #[error("AWS credentials: {0}")]
    Credentials(#[from] AwsError),
}

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn format_issues(issues: &[ValidationError]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub aws: AwsConfig,
    pub storage: StorageConfig,
    pub inference: InferenceConfig,
    pub redis: RedisConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsConfig {
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "ap-northeast-2".to_string(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Bucket holding uploaded images.
    pub bucket: String,
    /// S3-compatible endpoint; requests become path-style when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InferenceConfig {
    /// Name of the deployed SageMaker endpoint.
    pub endpoint_name: String,
    /// Runtime base URL override (VPC endpoint, local mock).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    pub timeout_secs: u64,
    /// Upper bound on concurrent endpoint calls; absent means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint_name: String::new(),
            endpoint_url: None,
            timeout_secs: 60,
            max_in_flight: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    pub url: String,
    pub stream_name: String,
    pub cache_key_prefix: String,
    pub cache_ttl_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
            cache_ttl_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Reply shape of the model behind the stream variant.
    pub stream_shape: ResultShape,
    /// Reply shape of the model behind the cache variant.
    pub cache_shape: ResultShape,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream_shape: ResultShape::Classes,
            cache_shape: ResultShape::Ranked,
        }
    }
}

impl Config {
    /// Validate the configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, path: &str, message: &str| {
            if !ok {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: message.to_string(),
                });
            }
        };

        check(!self.aws.region.trim().is_empty(), "aws.region", "must not be empty");
        check(!self.storage.bucket.trim().is_empty(), "storage.bucket", "must not be empty");
        check(self.storage.timeout_secs > 0, "storage.timeoutSecs", "must be positive");
        check(
            !self.inference.endpoint_name.trim().is_empty(),
            "inference.endpointName",
            "must not be empty",
        );
        check(self.inference.timeout_secs > 0, "inference.timeoutSecs", "must be positive");
        check(
            self.inference.max_in_flight != Some(0),
            "inference.maxInFlight",
            "must be at least 1 (omit for unbounded)",
        );
        check(!self.redis.url.trim().is_empty(), "redis.url", "must not be empty");
        check(!self.redis.stream_name.is_empty(), "redis.streamName", "must not be empty");
        check(self.redis.cache_ttl_secs > 0, "redis.cacheTtlSecs", "must be positive");

        for (path, url) in [
            ("storage.endpoint", &self.storage.endpoint),
            ("inference.endpointUrl", &self.inference.endpoint_url),
        ] {
            if let Some(url) = url {
                if let Err(e) = url::Url::parse(url) {
                    check(false, path, &format!("invalid URL: {e}"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, var: &str| {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                *target = value;
            }
        };
        set(&mut self.aws.region, "AWS_REGION");
        set(&mut self.storage.bucket, "BABYCARE_S3_BUCKET");
        set(&mut self.inference.endpoint_name, "BABYCARE_SAGEMAKER_ENDPOINT");
        set(&mut self.redis.url, "BABYCARE_REDIS_URL");

        for (target, var) in [
            (&mut self.aws.access_key_id, "AWS_ACCESS_KEY_ID"),
            (&mut self.aws.secret_access_key, "AWS_SECRET_ACCESS_KEY"),
            (&mut self.aws.session_token, "AWS_SESSION_TOKEN"),
        ] {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                *target = Some(value);
            }
        }
    }

    /// Build signing credentials from the `aws` section.
    pub fn credentials(&self) -> Result<AwsCredentials, ConfigError> {
        let creds = AwsCredentials::new(
            self.aws.access_key_id.clone().unwrap_or_default(),
            self.aws.secret_access_key.clone().unwrap_or_default(),
        )?;
        Ok(creds.with_session_token(self.aws.session_token.clone()))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            stream_name: self.redis.stream_name.clone(),
            stream_shape: self.pipeline.stream_shape,
            cache_shape: self.pipeline.cache_shape,
            cache_ttl: Duration::from_secs(self.redis.cache_ttl_secs),
            cache_key_prefix: self.redis.cache_key_prefix.clone(),
        }
    }

    /// JSON view with secrets replaced, for display.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        redact_secrets(&mut value);
        if let Some(url) = value.pointer_mut("/redis/url") {
            *url = Value::String(redact_url(&self.redis.url));
        }
        value
    }
}

fn redact_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if SECRET_KEYS.contains(&key.as_str()) && entry.is_string() {
                    *entry = Value::String("***".to_string());
                } else {
                    redact_secrets(entry);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_secrets),
        _ => {}
    }
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("babycare-predict")
        .join("config.json5")
}

/// Explicit path, then `BABYCARE_PREDICT_CONFIG`, then the default.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => default_config_path(),
    }
}

/// Load the file (if any) and apply overrides, without validating.
pub fn load_config_unvalidated<F>(path: &Path, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        json5::from_str::<Config>(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
    } else {
        debug!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };
    config.apply_env_overrides(lookup);
    Ok(config)
}

/// Load, apply process environment overrides, and validate.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config = load_config_unvalidated(path, |var| std::env::var(var).ok())?;
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}
