//! Inference invocation.
//!
//! The image bytes are sent as the entire request body with content type
//! `application/x-image`: no base64, no chunking, no compression. The
//! endpoint's reply is returned verbatim; interpreting it is the job of
//! [`crate::result`].
//!
//! Admission control is an explicit policy here. Without a limit, every
//! concurrent pipeline invocation calls the endpoint immediately. With
//! [`InferenceInvoker::with_max_in_flight`], a semaphore bounds the number
//! of outstanding endpoint calls and further callers wait for a slot.

pub mod sagemaker;

pub use sagemaker::SageMakerEndpoint;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::PipelineError;
use crate::storage::RawImage;

/// Remote model-serving boundary.
///
/// Any transport, authentication, or endpoint-side failure is reported as
/// [`PipelineError::InferenceUnavailable`].
#[async_trait]
pub trait InferenceEndpoint: Send + Sync {
    /// Identifier of the deployed endpoint, for logs.
    fn name(&self) -> &str;

    async fn invoke(&self, body: Bytes, content_type: &str) -> Result<String, PipelineError>;
}

/// Raw textual payload returned by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResponse(String);

impl InferenceResponse {
    pub fn new(body: impl Into<String>) -> Self {
        Self(body.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Sends images to one inference endpoint.
#[derive(Clone)]
pub struct InferenceInvoker {
    endpoint: Arc<dyn InferenceEndpoint>,
    admission: Option<(Arc<Semaphore>, usize)>,
}

impl std::fmt::Debug for InferenceInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceInvoker")
            .field("endpoint", &self.endpoint.name())
            .field("max_in_flight", &self.max_in_flight())
            .finish()
    }
}

impl InferenceInvoker {
    /// Unbounded invoker: concurrent calls go straight to the endpoint.
    pub fn new(endpoint: Arc<dyn InferenceEndpoint>) -> Self {
        Self {
            endpoint,
            admission: None,
        }
    }

    /// Bound the number of concurrent endpoint calls. A limit of zero is
    /// treated as one.
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        let limit = limit.max(1);
        self.admission = Some((Arc::new(Semaphore::new(limit)), limit));
        self
    }

    /// `None` means unbounded.
    pub fn max_in_flight(&self) -> Option<usize> {
        self.admission.as_ref().map(|(_, limit)| *limit)
    }

    pub fn endpoint_name(&self) -> &str {
        self.endpoint.name()
    }

    /// Send the image and return the endpoint's raw reply.
    ///
    /// Consumes the image: its bytes are not retained once the call returns.
    pub async fn invoke(&self, image: RawImage) -> Result<InferenceResponse, PipelineError> {
        let _permit = match &self.admission {
            Some((semaphore, _)) => Some(semaphore.clone().acquire_owned().await.map_err(|_| {
                PipelineError::InferenceUnavailable("admission semaphore closed".to_string())
            })?),
            None => None,
        };

        let content_type = image.content_type();
        let size = image.len();
        let body = self.endpoint.invoke(image.into_bytes(), content_type).await?;
        debug!(endpoint = self.endpoint.name(), size, response = %body, "inference response");
        Ok(InferenceResponse::new(body))
    }
}
