//! Result distribution.
//!
//! A finished prediction leaves the pipeline one of two ways:
//!
//! - **Stream**: appended to an append-only event stream. Best effort: a
//!   rejected or failed append never fails the invocation, but it is
//!   reported as [`DeliveryOutcome::DeliveryWarning`] instead of success.
//! - **Cache**: written under `prediction:<subjectId>` with a bounded TTL.
//!   A failed write is [`PipelineError::CacheUnavailable`] and aborts the
//!   invocation.
//!
//! Store introspection lives behind [`StoreDiagnostics`] and is never
//! called from the pipeline.

pub mod redis_store;

pub use redis_store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::result::PredictionResult;

/// Stream the stream variant publishes to unless configured otherwise.
pub const DEFAULT_STREAM_NAME: &str = "diagnosis:prediction:result:stream";

/// Prefix of cache keys; the subject identifier follows it.
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "prediction:";

/// Lifetime of a cached prediction.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Field names shared by stream entries and cache values.
pub const FIELD_IMAGE_URL: &str = "imageUrl";
pub const FIELD_PREDICTION_RESULT: &str = "predictionResult";

/// Failure reported by a backing store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store command failed: {0}")]
    Command(String),
}

/// Append-only stream boundary: `append(streamKey, fieldMap) -> entryId`.
///
/// `Ok(None)` means the store accepted the command but assigned no entry.
#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
    ) -> Result<Option<String>, StoreError>;
}

/// Key-value boundary with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Consumer group summary returned by [`StoreDiagnostics::consumer_groups`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerGroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: Option<String>,
}

/// Operational introspection. Not part of the prediction path.
#[async_trait]
pub trait StoreDiagnostics: Send + Sync {
    async fn consumer_groups(&self, stream: &str) -> Result<Vec<ConsumerGroupInfo>, StoreError>;

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// Identifier the stream store assigned to an appended entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEntryId(pub String);

impl std::fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a best-effort stream publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered { entry_id: StreamEntryId },
    DeliveryWarning { reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// What gets handed to the distributor for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionRecord {
    /// Externally supplied diagnosis id; absent for stream publishes.
    pub subject_id: Option<String>,
    pub image_reference: String,
    pub prediction: PredictionResult,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheValue<'a> {
    image_url: &'a str,
    prediction_result: &'a PredictionResult,
}

/// A cache entry as read back by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPrediction {
    pub image_url: String,
    pub prediction_result: Value,
}

/// Cache key for a subject.
pub fn cache_key(prefix: &str, subject_id: &str) -> String {
    format!("{prefix}{subject_id}")
}

/// Hide the password component of a store URL (`redis://:pw@host`).
pub(crate) fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Publishes predictions to the stream and cache stores.
#[derive(Clone)]
pub struct ResultDistributor {
    stream: Arc<dyn StreamStore>,
    cache: Arc<dyn CacheStore>,
    cache_key_prefix: String,
}

impl std::fmt::Debug for ResultDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultDistributor")
            .field("cache_key_prefix", &self.cache_key_prefix)
            .finish_non_exhaustive()
    }
}

impl ResultDistributor {
    pub fn new(stream: Arc<dyn StreamStore>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            stream,
            cache,
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_cache_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_key_prefix = prefix.into();
        self
    }

    /// Append the record to `stream_name` as a flat field set.
    ///
    /// Never fails the caller. A store error, a missing entry id, or an
    /// unserializable result all come back as a delivery warning.
    pub async fn publish_to_stream(
        &self,
        stream_name: &str,
        record: &DistributionRecord,
    ) -> DeliveryOutcome {
        let payload = match record.prediction.to_json_string() {
            Ok(payload) => payload,
            Err(e) => return warning(stream_name, e.to_string()),
        };
        let fields = [
            (FIELD_IMAGE_URL, record.image_reference.clone()),
            (FIELD_PREDICTION_RESULT, payload),
        ];

        match self.stream.append(stream_name, &fields).await {
            Ok(Some(id)) => {
                info!(stream = stream_name, entry_id = %id, "published prediction");
                DeliveryOutcome::Delivered {
                    entry_id: StreamEntryId(id),
                }
            }
            Ok(None) => warning(stream_name, "store assigned no entry id".to_string()),
            Err(e) => warning(stream_name, e.to_string()),
        }
    }

    /// Write `{imageUrl, predictionResult}` under the subject's key.
    pub async fn write_cache(
        &self,
        subject_id: &str,
        image_reference: &str,
        prediction: &PredictionResult,
        ttl: Duration,
    ) -> Result<(), PipelineError> {
        let key = cache_key(&self.cache_key_prefix, subject_id);
        let value = serde_json::to_string(&CacheValue {
            image_url: image_reference,
            prediction_result: prediction,
        })
        .map_err(|e| PipelineError::MalformedResult(format!("failed to serialize result: {e}")))?;

        self.cache
            .set(&key, &value, ttl)
            .await
            .map_err(|e| PipelineError::CacheUnavailable(e.to_string()))?;
        info!(key = %key, ttl_secs = ttl.as_secs(), "cached prediction");
        Ok(())
    }

    /// Read a previously cached prediction. `None` once it has expired.
    pub async fn read_cache(&self, subject_id: &str) -> Result<Option<CachedPrediction>, PipelineError> {
        let key = cache_key(&self.cache_key_prefix, subject_id);
        let raw = self
            .cache
            .get(&key)
            .await
            .map_err(|e| PipelineError::CacheUnavailable(e.to_string()))?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| {
                PipelineError::MalformedResult(format!("cache entry {key} is not valid: {e}"))
            })
        })
        .transpose()
    }
}

fn warning(stream: &str, reason: String) -> DeliveryOutcome {
    warn!(stream, reason = %reason, "prediction not published to stream");
    DeliveryOutcome::DeliveryWarning { reason }
}
