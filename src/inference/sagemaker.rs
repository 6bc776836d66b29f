//! SageMaker runtime `InvokeEndpoint` over plain HTTPS with SigV4 signing.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;
use url::Url;

use super::InferenceEndpoint;
use crate::aws::{amz_datetime, host_of, percent_encode_path_segment, SigV4Signer};
use crate::error::PipelineError;

/// A deployed SageMaker real-time endpoint.
pub struct SageMakerEndpoint {
    client: reqwest::Client,
    signer: SigV4Signer,
    endpoint_name: String,
    base_url: Url,
}

impl std::fmt::Debug for SageMakerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SageMakerEndpoint")
            .field("endpoint_name", &self.endpoint_name)
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl SageMakerEndpoint {
    /// `timeout` is the transport timeout; the pipeline adds none of its own.
    pub fn new(
        signer: SigV4Signer,
        endpoint_name: String,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        if endpoint_name.trim().is_empty() {
            return Err(PipelineError::InferenceUnavailable(
                "endpoint name must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                PipelineError::InferenceUnavailable(format!("failed to build HTTP client: {e}"))
            })?;
        let base_url = Url::parse(&format!(
            "https://runtime.sagemaker.{}.amazonaws.com",
            signer.region()
        ))
        .map_err(|e| PipelineError::InferenceUnavailable(format!("invalid runtime URL: {e}")))?;
        Ok(Self {
            client,
            signer,
            endpoint_name,
            base_url,
        })
    }

    /// Set a custom base URL (e.g., for a VPC endpoint or testing).
    pub fn with_base_url(mut self, url: Url) -> Self {
        self.base_url = url;
        self
    }

    fn invocation_url(&self) -> Url {
        let mut url = self.base_url.clone();
        let path = format!(
            "{}/endpoints/{}/invocations",
            self.base_url.path().trim_end_matches('/'),
            percent_encode_path_segment(&self.endpoint_name)
        );
        url.set_path(&path);
        url
    }
}

#[async_trait]
impl InferenceEndpoint for SageMakerEndpoint {
    fn name(&self) -> &str {
        &self.endpoint_name
    }

    async fn invoke(&self, body: Bytes, content_type: &str) -> Result<String, PipelineError> {
        let url = self.invocation_url();
        let host = host_of(&url);
        let datetime = amz_datetime(chrono::Utc::now());
        let sig_headers = self.signer.sign("POST", &host, url.path(), &body, &datetime);

        let mut request = self
            .client
            .post(url)
            .header("content-type", content_type);
        for (name, value) in &sig_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(body).send().await.map_err(|e| {
            PipelineError::InferenceUnavailable(format!("HTTP request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            warn!(endpoint = %self.endpoint_name, %status, "InvokeEndpoint failed");
            return Err(PipelineError::InferenceUnavailable(format!(
                "SageMaker returned {status}: {body}"
            )));
        }

        let bytes = response.bytes().await.map_err(|e| {
            PipelineError::InferenceUnavailable(format!("failed to read response body: {e}"))
        })?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| PipelineError::MalformedResult(format!("response is not UTF-8: {e}")))
    }
}
