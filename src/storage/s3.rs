//! S3 `GetObject` over plain HTTPS with SigV4 signing.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use super::BlobStore;
use crate::aws::{amz_datetime, host_of, percent_encode_path_segment, SigV4Signer};
use crate::error::PipelineError;

/// Blob store backed by S3 or an S3-compatible server.
pub struct S3BlobStore {
    client: reqwest::Client,
    signer: SigV4Signer,
    /// Path-style endpoint override (MinIO, LocalStack). `None` means
    /// virtual-hosted AWS URLs.
    endpoint: Option<Url>,
}

impl std::fmt::Debug for S3BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobStore")
            .field("region", &self.signer.region())
            .field("endpoint", &self.endpoint.as_ref().map(|u| u.as_str()))
            .finish()
    }
}

impl S3BlobStore {
    pub fn new(signer: SigV4Signer, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                PipelineError::StorageUnavailable(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            signer,
            endpoint: None,
        })
    }

    /// Send requests path-style to a custom endpoint.
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, PipelineError> {
        let encoded_key = percent_encode_path_segment(key);
        let url = match &self.endpoint {
            Some(endpoint) => {
                let mut url = endpoint.clone();
                let path = format!(
                    "{}/{}/{}",
                    endpoint.path().trim_end_matches('/'),
                    percent_encode_path_segment(bucket),
                    encoded_key
                );
                url.set_path(&path);
                url
            }
            None => Url::parse(&format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                bucket,
                self.signer.region(),
                encoded_key
            ))
            .map_err(|e| PipelineError::StorageUnavailable(format!("invalid object URL: {e}")))?,
        };
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, PipelineError> {
        let url = self.object_url(bucket, key)?;
        let host = host_of(&url);
        let datetime = amz_datetime(chrono::Utc::now());
        let sig_headers = self.signer.sign("GET", &host, url.path(), b"", &datetime);

        let mut request = self.client.get(url.clone());
        for (name, value) in &sig_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        debug!(%url, "GET object");
        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::StorageUnavailable(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            if status == StatusCode::NOT_FOUND || body.contains("<Code>NoSuchKey</Code>") {
                return Err(PipelineError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            warn!(%status, bucket, key, "S3 GetObject failed");
            return Err(PipelineError::StorageUnavailable(format!(
                "S3 returned {status}: {body}"
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| PipelineError::StorageUnavailable(format!("failed to read object body: {e}")))
    }
}
