//! End-to-end pipeline tests against in-memory stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use babycare_predict::distribution::{
    CacheStore, DeliveryOutcome, ResultDistributor, StoreError, StreamStore,
};
use babycare_predict::inference::{InferenceEndpoint, InferenceInvoker};
use babycare_predict::pipeline::{
    DistributionStrategy, PipelineOutcome, PipelineSettings, PredictionPipeline,
    PredictionRequest,
};
use babycare_predict::result::{PredictionResult, ResultShape};
use babycare_predict::storage::{BlobStore, ImageFetcher};
use babycare_predict::PipelineError;

const REFERENCE: &str = "https://bucket.example/images/cat1.jpg";
const BUCKET: &str = "uploads";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeBlobStore {
    objects: HashMap<String, Bytes>,
    requests: Mutex<Vec<(String, String)>>,
}

impl FakeBlobStore {
    fn with_object(key: &str, size: usize) -> Self {
        let mut objects = HashMap::new();
        objects.insert(key.to_string(), Bytes::from(vec![0xAB; size]));
        Self {
            objects,
            ..Default::default()
        }
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, PipelineError> {
        self.requests
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string()));
        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

struct FakeEndpoint {
    reply: Result<String, PipelineError>,
    calls: AtomicUsize,
    received: Mutex<Vec<(usize, String)>>,
    delay: Option<Duration>,
}

impl FakeEndpoint {
    fn replying(body: &str) -> Self {
        Self {
            reply: Ok(body.to_string()),
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEndpoint for FakeEndpoint {
    fn name(&self) -> &str {
        "fake-endpoint"
    }

    async fn invoke(&self, body: Bytes, content_type: &str) -> Result<String, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received
            .lock()
            .unwrap()
            .push((body.len(), content_type.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone()
    }
}

#[derive(Default)]
struct FakeRedis {
    entries: Mutex<Vec<(String, Vec<(String, String)>)>>,
    cache: Mutex<HashMap<String, (String, Duration)>>,
    fail_stream: bool,
    fail_cache: bool,
}

#[async_trait]
impl StreamStore for FakeRedis {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
    ) -> Result<Option<String>, StoreError> {
        if self.fail_stream {
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        let mut entries = self.entries.lock().unwrap();
        entries.push((
            stream.to_string(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        ));
        Ok(Some(format!("1700000000000-{}", entries.len() - 1)))
    }
}

#[async_trait]
impl CacheStore for FakeRedis {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        if self.fail_cache {
            return Err(StoreError::Command("READONLY replica".to_string()));
        }
        self.cache
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .cache
            .lock()
            .unwrap()
            .get(key)
            .map(|(value, _)| value.clone()))
    }
}

struct Harness {
    blobs: Arc<FakeBlobStore>,
    endpoint: Arc<FakeEndpoint>,
    redis: Arc<FakeRedis>,
    pipeline: PredictionPipeline,
}

fn harness(blobs: FakeBlobStore, endpoint: FakeEndpoint, redis: FakeRedis) -> Harness {
    let blobs = Arc::new(blobs);
    let endpoint = Arc::new(endpoint);
    let redis = Arc::new(redis);
    let pipeline = PredictionPipeline::new(
        ImageFetcher::new(blobs.clone(), BUCKET),
        InferenceInvoker::new(endpoint.clone()),
        ResultDistributor::new(redis.clone(), redis.clone()),
        PipelineSettings::default(),
    );
    Harness {
        blobs,
        endpoint,
        redis,
        pipeline,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stream_variant_returns_result_and_appends_entry() {
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 500),
        FakeEndpoint::replying(r#"{"predicted_classes":["healthy"],"probabilities":[0.97]}"#),
        FakeRedis::default(),
    );

    let prediction = h
        .pipeline
        .predict(REFERENCE, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        prediction.result.to_value(),
        json!({"predictionResult": ["healthy"], "probabilities": [0.97]})
    );
    assert!(prediction.delivery.is_delivered(), "{:?}", prediction.delivery);

    assert_eq!(
        *h.blobs.requests.lock().unwrap(),
        vec![(BUCKET.to_string(), "cat1.jpg".to_string())]
    );
    assert_eq!(
        *h.endpoint.received.lock().unwrap(),
        vec![(500, "application/x-image".to_string())]
    );

    let entries = h.redis.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    let (stream, fields) = &entries[0];
    assert_eq!(stream, "diagnosis:prediction:result:stream");
    assert_eq!(fields[0], ("imageUrl".to_string(), REFERENCE.to_string()));
    assert_eq!(fields[1].0, "predictionResult");
    let published: Value = serde_json::from_str(&fields[1].1).unwrap();
    assert_eq!(
        published,
        json!({"predictionResult": ["healthy"], "probabilities": [0.97]})
    );
}

#[tokio::test]
async fn test_cache_variant_writes_subject_key() {
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 500),
        FakeEndpoint::replying(r#"[{"label":"eczema","score":0.8}]"#),
        FakeRedis::default(),
    );

    h.pipeline
        .predict_for_subject(REFERENCE, "d-42", &CancellationToken::new())
        .await
        .unwrap();

    {
        let cache = h.redis.cache.lock().unwrap();
        let (value, ttl) = cache.get("prediction:d-42").expect("cache entry");
        assert_eq!(*ttl, Duration::from_secs(30 * 60));
        let value: Value = serde_json::from_str(value).unwrap();
        assert_eq!(
            value,
            json!({
                "imageUrl": REFERENCE,
                "predictionResult": [{"label": "eczema", "score": 0.8}]
            })
        );
    }
    assert!(h.redis.entries.lock().unwrap().is_empty());

    let cached = h.pipeline.cached_prediction("d-42").await.unwrap().unwrap();
    assert_eq!(cached.image_url, REFERENCE);
    assert_eq!(cached.prediction_result, json!([{"label": "eczema", "score": 0.8}]));
}

#[tokio::test]
async fn test_missing_object_aborts_before_inference() {
    let h = harness(
        FakeBlobStore::default(),
        FakeEndpoint::replying("[]"),
        FakeRedis::default(),
    );

    let err = h
        .pipeline
        .predict(REFERENCE, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PipelineError::NotFound {
            bucket: BUCKET.to_string(),
            key: "cat1.jpg".to_string(),
        }
    );
    assert_eq!(h.endpoint.calls(), 0);
    assert!(h.redis.entries.lock().unwrap().is_empty());
    assert!(h.redis.cache.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_reply_aborts_before_distribution() {
    for (body, variant_is_stream) in [
        (r#"{"predicted_classes": ["healthy""#, true),
        (r#"{"probabilities":[0.5]}"#, true),
        (r#"{"label":"eczema"}"#, false),
    ] {
        let h = harness(
            FakeBlobStore::with_object("cat1.jpg", 10),
            FakeEndpoint::replying(body),
            FakeRedis::default(),
        );
        let cancel = CancellationToken::new();
        let err = if variant_is_stream {
            h.pipeline.predict(REFERENCE, &cancel).await.map(|_| ())
        } else {
            h.pipeline.predict_for_subject(REFERENCE, "d-1", &cancel).await
        }
        .unwrap_err();

        assert!(matches!(err, PipelineError::MalformedResult(_)), "{body}: {err:?}");
        assert_eq!(h.endpoint.calls(), 1);
        assert!(h.redis.entries.lock().unwrap().is_empty(), "{body}");
        assert!(h.redis.cache.lock().unwrap().is_empty(), "{body}");
    }
}

// ---------------------------------------------------------------------------
// Failure policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stream_failure_is_reported_as_warning() {
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 10),
        FakeEndpoint::replying(r#"{"predicted_classes":["acne"],"probabilities":[0.6]}"#),
        FakeRedis {
            fail_stream: true,
            ..Default::default()
        },
    );

    let prediction = h
        .pipeline
        .predict(REFERENCE, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(prediction.result.shape(), ResultShape::Classes);
    match prediction.delivery {
        DeliveryOutcome::DeliveryWarning { ref reason } => {
            assert!(reason.contains("connection refused"), "{reason}")
        }
        other => panic!("Expected DeliveryWarning, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cache_failure_is_fatal() {
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 10),
        FakeEndpoint::replying("[]"),
        FakeRedis {
            fail_cache: true,
            ..Default::default()
        },
    );

    let err = h
        .pipeline
        .predict_for_subject(REFERENCE, "d-42", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CacheUnavailable(_)), "{err:?}");
}

#[tokio::test]
async fn test_inference_failure_surfaces_unchanged() {
    let mut endpoint = FakeEndpoint::replying("");
    endpoint.reply = Err(PipelineError::InferenceUnavailable("HTTP 503".to_string()));
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 10),
        endpoint,
        FakeRedis::default(),
    );

    let err = h
        .pipeline
        .predict(REFERENCE, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, PipelineError::InferenceUnavailable("HTTP 503".to_string()));
    assert!(h.redis.entries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_reference_without_key_is_rejected() {
    let h = harness(
        FakeBlobStore::default(),
        FakeEndpoint::replying("[]"),
        FakeRedis::default(),
    );

    let err = h
        .pipeline
        .predict("https://bucket.example/images/", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidReference(_)), "{err:?}");
    assert!(h.blobs.requests.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Cancellation and strategies
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_inference_stops_pipeline() {
    let mut endpoint = FakeEndpoint::replying("[]");
    endpoint.delay = Some(Duration::from_secs(60));
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 10),
        endpoint,
        FakeRedis::default(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = h
        .pipeline
        .predict_for_subject(REFERENCE, "d-42", &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, PipelineError::Cancelled);
    assert_eq!(h.endpoint.calls(), 1);
    assert!(h.redis.cache.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_already_cancelled_token_skips_fetch() {
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 10),
        FakeEndpoint::replying("[]"),
        FakeRedis::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.pipeline.predict(REFERENCE, &cancel).await.unwrap_err();
    assert_eq!(err, PipelineError::Cancelled);
    assert!(h.blobs.requests.lock().unwrap().is_empty());
    assert_eq!(h.endpoint.calls(), 0);
}

#[tokio::test]
async fn test_run_with_explicit_shape_and_strategy() {
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 10),
        FakeEndpoint::replying(r#"{"predicted_classes":["healthy"],"probabilities":[0.9]}"#),
        FakeRedis::default(),
    );

    let outcome = h
        .pipeline
        .run(
            PredictionRequest {
                image_reference: REFERENCE.to_string(),
                shape: ResultShape::Classes,
                strategy: DistributionStrategy::Cache {
                    subject_id: "d-7".to_string(),
                    ttl: Duration::from_secs(60),
                },
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        PipelineOutcome::Cached {
            key: "prediction:d-7".to_string()
        }
    );
    let cached = h.pipeline.cached_prediction("d-7").await.unwrap().unwrap();
    assert_eq!(
        cached.prediction_result,
        json!({"predictionResult": ["healthy"], "probabilities": [0.9]})
    );
}

#[tokio::test]
async fn test_run_with_stream_strategy_returns_streamed_outcome() {
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 10),
        FakeEndpoint::replying(r#"[{"label":"acne","score":0.55}]"#),
        FakeRedis::default(),
    );

    let outcome = h
        .pipeline
        .run(
            PredictionRequest {
                image_reference: REFERENCE.to_string(),
                shape: ResultShape::Ranked,
                strategy: DistributionStrategy::Stream {
                    stream_name: "custom:stream".to_string(),
                },
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match outcome {
        PipelineOutcome::Streamed(prediction) => {
            assert_eq!(prediction.result.shape(), ResultShape::Ranked);
            assert!(prediction.delivery.is_delivered());
        }
        other => panic!("Expected Streamed, got {:?}", other),
    }
    assert_eq!(h.redis.entries.lock().unwrap()[0].0, "custom:stream");
}

#[tokio::test]
async fn test_cached_numbers_match_endpoint_text() {
    let reply = r#"[{"id":123456789012345678901234567890,"score":0.8},{"score":1}]"#;
    let h = harness(
        FakeBlobStore::with_object("cat1.jpg", 10),
        FakeEndpoint::replying(reply),
        FakeRedis::default(),
    );

    h.pipeline
        .predict_for_subject(REFERENCE, "d-9", &CancellationToken::new())
        .await
        .unwrap();

    let cache = h.redis.cache.lock().unwrap();
    let (value, _) = &cache["prediction:d-9"];
    assert_eq!(
        *value,
        format!(r#"{{"imageUrl":"{REFERENCE}","predictionResult":{reply}}}"#)
    );
}

#[tokio::test]
async fn test_concurrent_invocations_are_independent() {
    let mut blobs = FakeBlobStore::with_object("a.jpg", 1);
    blobs.objects.insert("b.jpg".to_string(), Bytes::from_static(b"bb"));
    let h = harness(
        blobs,
        FakeEndpoint::replying(r#"[{"label":"healthy","score":0.99}]"#),
        FakeRedis::default(),
    );
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        h.pipeline
            .predict_for_subject("https://h/a.jpg", "d-a", &cancel),
        h.pipeline
            .predict_for_subject("https://h/b.jpg", "d-b", &cancel),
    );
    a.unwrap();
    b.unwrap();

    let cache = h.redis.cache.lock().unwrap();
    assert!(cache["prediction:d-a"].0.contains("https://h/a.jpg"));
    assert!(cache["prediction:d-b"].0.contains("https://h/b.jpg"));
    assert_eq!(h.endpoint.calls(), 2);
}

#[test]
fn test_ranked_results_pass_through() {
    let ranked = PredictionResult::Ranked(vec![json!({"z": 1, "a": 2})]);
    assert_eq!(ranked.to_json_string().unwrap(), r#"[{"z":1,"a":2}]"#);
}
