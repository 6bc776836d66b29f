//! Prediction pipeline.
//!
//! One invocation runs fetch → invoke → parse → distribute, strictly in
//! order. Any stage error moves the invocation to [`PipelineStage::Aborted`]
//! and is returned unchanged; nothing is distributed after a failure and
//! nothing is retried.
//!
//! The two caller-facing operations differ only in their parameters:
//!
//! | operation | result shape | distribution | returns |
//! |---|---|---|---|
//! | [`PredictionPipeline::predict`] | configured stream shape | stream (best effort) | result + delivery outcome |
//! | [`PredictionPipeline::predict_for_subject`] | configured cache shape | cache (fatal on failure) | nothing |
//!
//! Every remote call races the caller's [`CancellationToken`]. Dropping the
//! losing future aborts the in-flight HTTP request or store command.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::distribution::{
    cache_key, CachedPrediction, DeliveryOutcome, DistributionRecord, ResultDistributor,
    DEFAULT_CACHE_KEY_PREFIX, DEFAULT_CACHE_TTL, DEFAULT_STREAM_NAME,
};
use crate::error::PipelineError;
use crate::inference::InferenceInvoker;
use crate::result::{self, PredictionResult, ResultShape};
use crate::storage::ImageFetcher;

/// Per-invocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Fetching,
    Invoking,
    Parsing,
    Distributing,
    Done,
    Aborted,
}

impl PipelineStage {
    /// The stage that follows on success; `None` for terminal stages.
    pub fn next(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Fetching => Some(PipelineStage::Invoking),
            PipelineStage::Invoking => Some(PipelineStage::Parsing),
            PipelineStage::Parsing => Some(PipelineStage::Distributing),
            PipelineStage::Distributing => Some(PipelineStage::Done),
            PipelineStage::Done | PipelineStage::Aborted => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Aborted)
    }

    /// Whether `to` is reachable from `self` in one step.
    pub fn can_transition_to(self, to: PipelineStage) -> bool {
        match to {
            PipelineStage::Aborted => !self.is_terminal(),
            _ => self.next() == Some(to),
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Fetching => "fetching",
            PipelineStage::Invoking => "invoking",
            PipelineStage::Parsing => "parsing",
            PipelineStage::Distributing => "distributing",
            PipelineStage::Done => "done",
            PipelineStage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Where a finished prediction goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionStrategy {
    /// Append to an event stream; failures become delivery warnings.
    Stream { stream_name: String },
    /// Cache under the subject's key; failures abort the invocation.
    Cache { subject_id: String, ttl: Duration },
}

/// Fully parametrized invocation.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub image_reference: String,
    pub shape: ResultShape,
    pub strategy: DistributionStrategy,
}

/// What a completed invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Streamed(StreamedPrediction),
    Cached { key: String },
}

/// Result of the stream variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamedPrediction {
    pub result: PredictionResult,
    pub delivery: DeliveryOutcome,
}

/// Deployment-level knobs for the two variants.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stream_name: String,
    pub stream_shape: ResultShape,
    pub cache_shape: ResultShape,
    pub cache_ttl: Duration,
    pub cache_key_prefix: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            stream_shape: ResultShape::Classes,
            cache_shape: ResultShape::Ranked,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
        }
    }
}

/// Composes fetcher, invoker, parser, and distributor.
///
/// Holds no per-invocation state, so one instance serves any number of
/// concurrent invocations.
#[derive(Debug, Clone)]
pub struct PredictionPipeline {
    fetcher: ImageFetcher,
    invoker: InferenceInvoker,
    distributor: ResultDistributor,
    settings: PipelineSettings,
}

impl PredictionPipeline {
    pub fn new(
        fetcher: ImageFetcher,
        invoker: InferenceInvoker,
        distributor: ResultDistributor,
        settings: PipelineSettings,
    ) -> Self {
        let distributor = distributor.with_cache_key_prefix(settings.cache_key_prefix.clone());
        Self {
            fetcher,
            invoker,
            distributor,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Stream variant: return the result and publish it to the stream.
    pub async fn predict(
        &self,
        image_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamedPrediction, PipelineError> {
        self.stream(
            image_reference,
            self.settings.stream_shape,
            &self.settings.stream_name,
            cancel,
        )
        .await
    }

    /// Cache variant: store the result under the subject's key. Consumers
    /// read it later with [`PredictionPipeline::cached_prediction`].
    pub async fn predict_for_subject(
        &self,
        image_reference: &str,
        subject_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.cache(
            image_reference,
            self.settings.cache_shape,
            subject_id,
            self.settings.cache_ttl,
            cancel,
        )
        .await
        .map(|_| ())
    }

    /// Read back what [`PredictionPipeline::predict_for_subject`] cached.
    pub async fn cached_prediction(
        &self,
        subject_id: &str,
    ) -> Result<Option<CachedPrediction>, PipelineError> {
        self.distributor.read_cache(subject_id).await
    }

    /// Run one invocation with explicit shape and strategy.
    pub async fn run(
        &self,
        request: PredictionRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        match &request.strategy {
            DistributionStrategy::Stream { stream_name } => self
                .stream(&request.image_reference, request.shape, stream_name, cancel)
                .await
                .map(PipelineOutcome::Streamed),
            DistributionStrategy::Cache { subject_id, ttl } => self
                .cache(&request.image_reference, request.shape, subject_id, *ttl, cancel)
                .await
                .map(|key| PipelineOutcome::Cached { key }),
        }
    }

    async fn stream(
        &self,
        image_reference: &str,
        shape: ResultShape,
        stream_name: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamedPrediction, PipelineError> {
        let span = invocation_span(image_reference, "stream");
        async {
            let started = Instant::now();
            let mut stage = PipelineStage::Fetching;
            let outcome = self
                .stream_stages(image_reference, shape, stream_name, cancel, &mut stage)
                .await;
            conclude(&mut stage, started, &outcome);
            outcome
        }
        .instrument(span)
        .await
    }

    /// Returns the cache key written.
    async fn cache(
        &self,
        image_reference: &str,
        shape: ResultShape,
        subject_id: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let span = invocation_span(image_reference, "cache");
        async {
            let started = Instant::now();
            let mut stage = PipelineStage::Fetching;
            let outcome = self
                .cache_stages(image_reference, shape, subject_id, ttl, cancel, &mut stage)
                .await;
            conclude(&mut stage, started, &outcome);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn stream_stages(
        &self,
        image_reference: &str,
        shape: ResultShape,
        stream_name: &str,
        cancel: &CancellationToken,
        stage: &mut PipelineStage,
    ) -> Result<StreamedPrediction, PipelineError> {
        let prediction = self.produce(image_reference, shape, cancel, stage).await?;
        let record = DistributionRecord {
            subject_id: None,
            image_reference: image_reference.to_string(),
            prediction,
        };
        let delivery = cancellable(cancel, async {
            Ok(self.distributor.publish_to_stream(stream_name, &record).await)
        })
        .await?;
        Ok(StreamedPrediction {
            result: record.prediction,
            delivery,
        })
    }

    async fn cache_stages(
        &self,
        image_reference: &str,
        shape: ResultShape,
        subject_id: &str,
        ttl: Duration,
        cancel: &CancellationToken,
        stage: &mut PipelineStage,
    ) -> Result<String, PipelineError> {
        let prediction = self.produce(image_reference, shape, cancel, stage).await?;
        cancellable(
            cancel,
            self.distributor
                .write_cache(subject_id, image_reference, &prediction, ttl),
        )
        .await?;
        Ok(cache_key(&self.settings.cache_key_prefix, subject_id))
    }

    /// Fetch, invoke and parse. Leaves `stage` at `Distributing` on success.
    async fn produce(
        &self,
        image_reference: &str,
        shape: ResultShape,
        cancel: &CancellationToken,
        stage: &mut PipelineStage,
    ) -> Result<PredictionResult, PipelineError> {
        let image = cancellable(cancel, self.fetcher.fetch(image_reference)).await?;

        advance(stage, PipelineStage::Invoking);
        let raw = cancellable(cancel, self.invoker.invoke(image)).await?;

        advance(stage, PipelineStage::Parsing);
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let prediction = result::parse(&raw, shape)?;

        advance(stage, PipelineStage::Distributing);
        Ok(prediction)
    }
}

fn invocation_span(image_reference: &str, variant: &'static str) -> tracing::Span {
    info_span!(
        "prediction",
        invocation_id = %Uuid::new_v4(),
        reference = %image_reference,
        variant,
    )
}

/// Move to the terminal stage matching `outcome` and log it.
fn conclude<T>(stage: &mut PipelineStage, started: Instant, outcome: &Result<T, PipelineError>) {
    match outcome {
        Ok(_) => {
            advance(stage, PipelineStage::Done);
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "prediction complete");
        }
        Err(e) => {
            warn!(stage = %stage, kind = e.kind(), error = %e, "prediction aborted");
            advance(stage, PipelineStage::Aborted);
        }
    }
}

fn advance(stage: &mut PipelineStage, to: PipelineStage) {
    debug_assert!(stage.can_transition_to(to), "{stage} -> {to}");
    debug!(from = %stage, to = %to, "stage transition");
    *stage = to;
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = fut => result,
    }
}
