//! Image retrieval from blob storage.
//!
//! An image reference is the URL the upload service handed out. Only its
//! trailing path segment matters: it is the object key inside the
//! configured bucket. No query or fragment stripping is performed.

pub mod s3;

pub use s3::S3BlobStore;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::PipelineError;

/// Content type the inference endpoint expects for raw image bodies.
pub const IMAGE_CONTENT_TYPE: &str = "application/x-image";

/// Raw image bytes owned by a single pipeline invocation.
#[derive(Debug, Clone)]
pub struct RawImage {
    bytes: Bytes,
    content_type: &'static str,
}

impl RawImage {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            content_type: IMAGE_CONTENT_TYPE,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Object storage boundary: `get(bucket, key) -> bytes | NotFound`.
///
/// Implementations return [`PipelineError::NotFound`] for a missing key and
/// [`PipelineError::StorageUnavailable`] for every other failure.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, PipelineError>;
}

/// Derive the object key from an image reference.
///
/// Everything after the last `/`; the whole reference when there is none.
pub fn object_key(reference: &str) -> &str {
    match reference.rfind('/') {
        Some(idx) => &reference[idx + 1..],
        None => reference,
    }
}

/// Resolves image references to bytes in one bucket.
#[derive(Clone)]
pub struct ImageFetcher {
    store: Arc<dyn BlobStore>,
    bucket: String,
}

impl std::fmt::Debug for ImageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFetcher")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl ImageFetcher {
    pub fn new(store: Arc<dyn BlobStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Fetch the image a reference points at. Errors from the store are
    /// returned unchanged; nothing is retried or cached.
    pub async fn fetch(&self, reference: &str) -> Result<RawImage, PipelineError> {
        let key = object_key(reference);
        if key.is_empty() {
            return Err(PipelineError::InvalidReference(reference.to_string()));
        }

        let bytes = self.store.get(&self.bucket, key).await?;
        debug!(bucket = %self.bucket, key, size = bytes.len(), "fetched image");
        Ok(RawImage::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapStore {
        objects: HashMap<(String, String), Bytes>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BlobStore for MapStore {
        async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, PipelineError> {
            self.requested.lock().unwrap().push(key.to_string());
            self.objects
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| PipelineError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
        }
    }

    #[test]
    fn test_object_key_from_url() {
        assert_eq!(
            object_key("https://bucket.example/images/cat1.jpg"),
            "cat1.jpg"
        );
        assert_eq!(object_key("s3://host/path/to/object-key"), "object-key");
    }

    #[test]
    fn test_object_key_without_slash_is_whole_reference() {
        assert_eq!(object_key("cat1.jpg"), "cat1.jpg");
    }

    #[test]
    fn test_object_key_keeps_query_and_fragment() {
        assert_eq!(object_key("https://h/a/b.jpg?v=2#top"), "b.jpg?v=2#top");
    }

    #[test]
    fn test_object_key_trailing_slash_is_empty() {
        assert_eq!(object_key("https://h/images/"), "");
    }

    #[tokio::test]
    async fn test_fetch_uses_derived_key() {
        let mut store = MapStore::default();
        store.objects.insert(
            ("uploads".to_string(), "cat1.jpg".to_string()),
            Bytes::from_static(&[1, 2, 3]),
        );
        let store = Arc::new(store);
        let fetcher = ImageFetcher::new(store.clone(), "uploads");

        let image = fetcher
            .fetch("https://bucket.example/images/cat1.jpg")
            .await
            .unwrap();
        assert_eq!(image.bytes().as_ref(), &[1, 2, 3]);
        assert_eq!(image.content_type(), IMAGE_CONTENT_TYPE);
        assert_eq!(*store.requested.lock().unwrap(), vec!["cat1.jpg"]);
    }

    #[tokio::test]
    async fn test_fetch_surfaces_not_found() {
        let fetcher = ImageFetcher::new(Arc::new(MapStore::default()), "uploads");
        let err = fetcher.fetch("https://h/missing.jpg").await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::NotFound {
                bucket: "uploads".to_string(),
                key: "missing.jpg".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_rejects_empty_key_without_store_call() {
        let store = Arc::new(MapStore::default());
        let fetcher = ImageFetcher::new(store.clone(), "uploads");
        let err = fetcher.fetch("https://h/images/").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidReference(_)));
        assert!(store.requested.lock().unwrap().is_empty());

        let err = fetcher.fetch("").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidReference(_)));
    }
}
