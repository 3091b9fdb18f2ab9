//! Blob storage: one put/get/delete contract over interchangeable backends.
//!
//! Keys are backend-relative locators such as `3f2a...c1.png` or
//! `thumbnails/<id>/small.png`. The local backend maps them to paths under a
//! root directory; the S3 backend maps them to object names in one bucket.

pub mod local;
pub mod s3;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};
use std::{io, sync::Arc};
use thiserror::Error;

use crate::config::{AppConfig, StorageBackend};

/// Chunked blob content.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

const MAX_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Uniform contract implemented by every physical backend.
///
/// `save` either stores the whole stream under `key` or leaves nothing
/// readable there; `delete` of a missing key succeeds.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the stream under `key`, returning the number of bytes written.
    async fn save(&self, key: &str, content: ByteStream) -> BlobResult<u64>;

    async fn get(&self, key: &str) -> BlobResult<ByteStream>;

    async fn delete(&self, key: &str) -> BlobResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Reject keys that could escape the backend namespace.
pub fn ensure_key_safe(key: &str) -> BlobResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if invalid {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Wrap an in-memory buffer as a single-chunk stream.
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    futures::stream::once(async move { Ok(data) }).boxed()
}

/// Drain a stream into one contiguous buffer.
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Select and initialize the configured backend.
pub async fn build_blob_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    match &cfg.storage {
        StorageBackend::Local { root } => {
            tokio::fs::create_dir_all(root).await?;
            tracing::info!("Using local blob storage at {}", root.display());
            Ok(Arc::new(local::LocalBlobStore::new(root.clone())))
        }
        StorageBackend::S3(s3_cfg) => {
            let store = s3::S3BlobStore::connect(s3_cfg).await?;
            tracing::info!("Using S3 blob storage in bucket `{}`", s3_cfg.bucket);
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_control_characters() {
        assert!(ensure_key_safe("abc.png").is_ok());
        assert!(ensure_key_safe("thumbnails/id/small.png").is_ok());
        for key in ["", "/etc/passwd", "../x", "a/../b", "a\\b", "a\nb"] {
            assert!(
                matches!(ensure_key_safe(key), Err(BlobError::InvalidKey(_))),
                "{key:?} should be rejected"
            );
        }
        assert!(ensure_key_safe(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn collect_concatenates_chunks() {
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"he")),
            Ok(Bytes::from_static(b"llo")),
        ])
        .boxed();
        assert_eq!(collect_stream(stream).await.unwrap(), Bytes::from("hello"));
    }
}
