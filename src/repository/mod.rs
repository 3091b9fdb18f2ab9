//! Durable metadata persistence: file records, their tags, and the
//! tag-to-role access rules.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::file::FileMetadata;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("file `{0}` not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Insert the record and its tags atomically.
    async fn create_file(&self, file: &FileMetadata) -> RepoResult<()>;

    async fn get_file(&self, id: Uuid) -> RepoResult<FileMetadata>;

    /// Remove the record and its tags. Deleting a missing record succeeds.
    async fn delete_file(&self, id: Uuid) -> RepoResult<()>;

    /// Whether any tag on the file is granted to `role`.
    async fn has_role_access(&self, file_id: Uuid, role: &str) -> RepoResult<bool>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> RepoResult<()> {
        Ok(())
    }
}
