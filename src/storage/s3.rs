//! S3-compatible object storage backend.
//!
//! Works against AWS S3 and against self-hosted services (MinIO, Ceph, R2)
//! through a custom endpoint with path-style or virtual-host addressing.

use async_trait::async_trait;
use aws_sdk_s3::{
    Client as S3Client,
    config::{Credentials, Region},
    primitives::ByteStream as S3Body,
    types::{CompletedMultipartUpload, CompletedPart},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::{BlobError, BlobResult, BlobStore, ByteStream, ensure_key_safe};
use crate::config::S3Settings;

/// Bodies up to this size go out as one `PutObject`; larger ones use a
/// multipart upload with parts of this size. S3 requires at least 5 MiB per
/// non-final part.
const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    /// Build a client from the configured region, endpoint, addressing
    /// style and credentials. Without static keys the default AWS provider
    /// chain is used.
    pub async fn connect(settings: &S3Settings) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let (Some(access_key), Some(secret_key)) =
            (settings.access_key.as_ref(), settings.secret_key.as_ref())
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "file-ingest-static",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(settings.use_path_style);
        if let Some(endpoint) = settings.endpoint.as_ref() {
            builder = builder.endpoint_url(endpoint.clone());
        }

        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
        })
    }

    async fn put_single(&self, key: &str, body: Bytes) -> BlobResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|err| backend_error("put_object", key, err))?;
        Ok(())
    }

    /// Stream the remainder of `content` as a multipart upload whose first
    /// part is `first`. The upload is aborted on any failure so no object
    /// becomes visible under `key`.
    async fn put_multipart(
        &self,
        key: &str,
        first: BytesMut,
        content: ByteStream,
    ) -> BlobResult<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| backend_error("create_multipart_upload", key, err))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BlobError::Backend("missing upload id".into()))?
            .to_string();

        match self.upload_parts(key, &upload_id, first, content).await {
            Ok(total) => Ok(total),
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, upload_id, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut buffer: BytesMut,
        mut content: ByteStream,
    ) -> BlobResult<u64> {
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut total = buffer.len() as u64;

        loop {
            let next = content.next().await.transpose()?;
            let finished = next.is_none();
            if let Some(chunk) = next {
                total += chunk.len() as u64;
                buffer.extend_from_slice(&chunk);
            }
            if buffer.len() >= PART_SIZE || (finished && !buffer.is_empty()) {
                let part = buffer.split().freeze();
                let resp = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(S3Body::from(part))
                    .send()
                    .await
                    .map_err(|err| backend_error("upload_part", key, err))?;
                parts.push(
                    CompletedPart::builder()
                        .e_tag(resp.e_tag().unwrap_or_default())
                        .part_number(part_number)
                        .build(),
                );
                part_number += 1;
            }
            if finished {
                break;
            }
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|err| backend_error("complete_multipart_upload", key, err))?;

        debug!(bucket = %self.bucket, key, upload_id, "completed multipart upload");
        Ok(total)
    }
}

fn backend_error(operation: &str, key: &str, err: impl std::error::Error) -> BlobError {
    BlobError::Backend(format!("{} `{}` failed: {}", operation, key, err))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn save(&self, key: &str, mut content: ByteStream) -> BlobResult<u64> {
        ensure_key_safe(key)?;

        // Buffer up to one part; small blobs never pay for a multipart round trip.
        let mut buffer = BytesMut::new();
        while buffer.len() < PART_SIZE {
            match content.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => {
                    let total = buffer.len() as u64;
                    self.put_single(key, buffer.freeze()).await?;
                    return Ok(total);
                }
            }
        }
        self.put_multipart(key, buffer, content).await
    }

    async fn get(&self, key: &str) -> BlobResult<ByteStream> {
        ensure_key_safe(key)?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    BlobError::NotFound(key.to_string())
                } else {
                    backend_error("get_object", key, service_err)
                }
            })?;
        let reader = resp.body.into_async_read();
        Ok(ReaderStream::new(reader).boxed())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        ensure_key_safe(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| backend_error("delete_object", key, err))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
