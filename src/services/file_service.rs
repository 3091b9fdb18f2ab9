//! FileService: the ingestion coordinator and the authorized read path.
//!
//! An upload is a two-step saga over independently failing stores. The
//! metadata record is written first, then the blob; if the blob write fails
//! the record is deleted again. A failed compensation leaves metadata that
//! points at nothing and is escalated through the alert log target.

use chrono::Utc;
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::UploadPolicy,
    models::{
        access::Principal,
        file::{FileMetadata, base_mime_type},
        thumbnail::{ThumbnailEvent, find_variant, thumbnail_key},
    },
    queue::QueueTransport,
    repository::{FileRepository, RepoError},
    services::{
        access::AccessResolver,
        mime,
        upload::{IncomingUpload, UploadContent},
    },
    storage::{BlobError, BlobStore, ByteStream},
};

/// Process exit status used when `abort_on_inconsistency` is set.
pub const INCONSISTENCY_EXIT_CODE: i32 = 70;

/// Longest original-name extension carried into the storage key.
const MAX_EXTENSION_LEN: usize = 10;

/// Caller-fixable upload rejections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file is {size} bytes, larger than the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("file type `{0}` is not allowed")]
    TypeNotAllowed(String),
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("access to file `{file_id}` denied")]
    AccessDenied { file_id: Uuid },
    #[error("file `{0}` not found")]
    NotFound(Uuid),
    #[error("thumbnail `{variant}` of file `{file_id}` not found")]
    ThumbnailNotFound { file_id: Uuid, variant: String },
    #[error("metadata store error: {0}")]
    Metadata(RepoError),
    #[error("blob store error: {0}")]
    Storage(#[from] BlobError),
    #[error("file `{file_id}` is in an inconsistent state: {detail}")]
    InconsistentState { file_id: Uuid, detail: String },
}

impl From<RepoError> for FileError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(id) => FileError::NotFound(id),
            other => FileError::Metadata(other),
        }
    }
}

pub type FileResult<T> = Result<T, FileError>;

/// Shared handle over the stores and the queue; cheap to clone per request.
#[derive(Clone)]
pub struct FileService {
    repo: Arc<dyn FileRepository>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn QueueTransport>,
    policy: Arc<UploadPolicy>,
    access: AccessResolver,
    thumbnail_queue: String,
}

impl FileService {
    pub fn new(
        repo: Arc<dyn FileRepository>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn QueueTransport>,
        policy: UploadPolicy,
        access: AccessResolver,
        thumbnail_queue: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            blobs,
            queue,
            policy: Arc::new(policy),
            access,
            thumbnail_queue: thumbnail_queue.into(),
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn repository(&self) -> &Arc<dyn FileRepository> {
        &self.repo
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Validate, classify and durably store one upload.
    ///
    /// On success exactly one metadata record and one blob exist and, for
    /// images, a thumbnail event has been offered to the queue.
    pub async fn upload(
        &self,
        owner: Option<&str>,
        tags: BTreeSet<String>,
        upload: IncomingUpload,
    ) -> FileResult<FileMetadata> {
        let max = self.policy.max_size_bytes;
        reject_oversized(upload.declared_size, max)?;
        let size = upload
            .content
            .byte_len()
            .await
            .map_err(BlobError::from)?;
        if size != upload.declared_size {
            warn!(
                declared = upload.declared_size,
                observed = size,
                "declared upload size does not match content"
            );
        }
        reject_oversized(size, max)?;

        let head = upload
            .content
            .head(mime::SNIFF_LEN)
            .await
            .map_err(BlobError::from)?;
        let mime_type = mime::detect(&head);
        let base = base_mime_type(&mime_type).to_ascii_lowercase();
        if !self.policy.allowed_mime_types.contains(&base) {
            info!(mime_type = %mime_type, "rejecting upload with disallowed type");
            return Err(ValidationError::TypeNotAllowed(mime_type).into());
        }

        let id = Uuid::new_v4();
        let file = FileMetadata {
            id,
            storage_key: storage_key_for(id, &upload.original_name),
            original_name: upload.original_name,
            mime_type,
            size_bytes: size as i64,
            owner_id: owner.map(str::to_string),
            tags,
            created_at: Utc::now(),
        };

        if let Err(err) = self.repo.create_file(&file).await {
            error!(
                file_id = %file.id,
                operation = "create_file",
                error = %err,
                "metadata write failed"
            );
            return Err(err.into());
        }

        match self.store_content(&file, &upload.content).await {
            Ok(written) if written == size => {}
            Ok(written) => {
                // Content changed between measuring and storing.
                if let Err(err) = self.blobs.delete(&file.storage_key).await {
                    warn!(file_id = %file.id, error = %err, "could not remove mismatched blob");
                }
                let cause = BlobError::Backend(format!("wrote {written} bytes, expected {size}"));
                return Err(self.roll_back(&file, cause).await);
            }
            Err(err) => return Err(self.roll_back(&file, err).await),
        }

        if file.is_image() {
            self.publish_thumbnail_event(&file).await;
        }

        info!(
            file_id = %file.id,
            storage_key = %file.storage_key,
            mime_type = %file.mime_type,
            size = file.size_bytes,
            "file stored"
        );
        Ok(file)
    }

    async fn store_content(&self, file: &FileMetadata, content: &UploadContent) -> Result<u64, BlobError> {
        let stream = content.open().await?;
        let written = self.blobs.save(&file.storage_key, stream).await?;
        debug!(file_id = %file.id, written, backend = self.blobs.backend_name(), "blob written");
        Ok(written)
    }

    /// Compensate a failed blob write by deleting the metadata record.
    async fn roll_back(&self, file: &FileMetadata, cause: BlobError) -> FileError {
        error!(
            file_id = %file.id,
            storage_key = %file.storage_key,
            operation = "blob_save",
            error = %cause,
            "blob write failed, deleting metadata record"
        );
        match self.repo.delete_file(file.id).await {
            Ok(()) => FileError::Storage(cause),
            Err(rollback_err) => {
                error!(
                    target: "file_ingest::alert",
                    alert = "metadata_rollback_failed",
                    file_id = %file.id,
                    storage_key = %file.storage_key,
                    operation = "delete_file",
                    error = %rollback_err,
                    cause = %cause,
                    "metadata record references a blob that was never written"
                );
                if self.policy.abort_on_inconsistency {
                    std::process::exit(INCONSISTENCY_EXIT_CODE);
                }
                FileError::InconsistentState {
                    file_id: file.id,
                    detail: format!("blob write failed ({cause}); rollback failed ({rollback_err})"),
                }
            }
        }
    }

    /// Best effort: a failure here is logged and never reaches the caller.
    async fn publish_thumbnail_event(&self, file: &FileMetadata) {
        let payload = match serde_json::to_vec(&ThumbnailEvent::from(file)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(file_id = %file.id, error = %err, "could not encode thumbnail event");
                return;
            }
        };
        match self.queue.publish(&self.thumbnail_queue, payload).await {
            Ok(()) => debug!(file_id = %file.id, queue = %self.thumbnail_queue, "thumbnail event published"),
            Err(err) => warn!(
                file_id = %file.id,
                queue = %self.thumbnail_queue,
                error = %err,
                "thumbnail event not published"
            ),
        }
    }

    pub async fn get_metadata(&self, id: Uuid, principal: &Principal) -> FileResult<FileMetadata> {
        self.authorize(id, principal).await
    }

    /// Metadata plus a stream over the stored content.
    pub async fn open(&self, id: Uuid, principal: &Principal) -> FileResult<(FileMetadata, ByteStream)> {
        let file = self.authorize(id, principal).await?;
        match self.blobs.get(&file.storage_key).await {
            Ok(stream) => Ok((file, stream)),
            Err(BlobError::NotFound(key)) => {
                error!(
                    file_id = %file.id,
                    storage_key = %key,
                    operation = "get",
                    "metadata record has no blob"
                );
                Err(FileError::InconsistentState {
                    file_id: file.id,
                    detail: format!("blob `{key}` is missing"),
                })
            }
            Err(err) => {
                error!(file_id = %file.id, operation = "get", error = %err, "blob read failed");
                Err(err.into())
            }
        }
    }

    /// Stream a derived thumbnail. Gated by the parent file's access rules.
    pub async fn open_thumbnail(
        &self,
        id: Uuid,
        variant: &str,
        principal: &Principal,
    ) -> FileResult<ByteStream> {
        let not_found = || FileError::ThumbnailNotFound {
            file_id: id,
            variant: variant.to_string(),
        };
        let variant = find_variant(variant).ok_or_else(not_found)?;
        let file = self.authorize(id, principal).await?;
        match self.blobs.get(&thumbnail_key(file.id, variant.name)).await {
            Ok(stream) => Ok(stream),
            Err(BlobError::NotFound(_)) => Err(not_found()),
            Err(err) => {
                error!(file_id = %file.id, variant = variant.name, error = %err, "thumbnail read failed");
                Err(err.into())
            }
        }
    }

    /// Load the record and evaluate access; denial and absence stay distinct.
    async fn authorize(&self, id: Uuid, principal: &Principal) -> FileResult<FileMetadata> {
        let file = self.repo.get_file(id).await?;
        let decision = self.access.check(self.repo.as_ref(), &file, principal).await;
        if !decision.is_allowed() {
            info!(
                file_id = %id,
                principal = %principal.id,
                role = %principal.role,
                "read denied"
            );
            return Err(FileError::AccessDenied { file_id: id });
        }
        debug!(file_id = %id, principal = %principal.id, ?decision, "read allowed");
        Ok(file)
    }
}

fn reject_oversized(size: u64, max: u64) -> Result<(), ValidationError> {
    if size > max {
        info!(size, max, "rejecting upload over size limit");
        return Err(ValidationError::TooLarge { size, max });
    }
    Ok(())
}

/// `<id>` plus the original extension, lowercased, when it looks sane.
fn storage_key_for(id: Uuid, original_name: &str) -> String {
    match extension_of(original_name) {
        Some(ext) => format!("{}.{}", id, ext),
        None => id.to_string(),
    }
}

fn extension_of(name: &str) -> Option<String> {
    let base = name.rsplit(|c| c == '/' || c == '\\').next()?;
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
