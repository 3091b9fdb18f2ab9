//! SQLite-backed [`FileRepository`].
//!
//! Tables: `files` (one row per upload), `file_tags` (file → tag), and
//! `file_access_rules` (tag → role). The schema ships embedded from
//! `migrations/0001_init.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{FileRepository, RepoError, RepoResult};
use crate::models::{access::AccessRule, file::FileMetadata};

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(FromRow)]
struct FileRow {
    id: Uuid,
    original_name: String,
    storage_key: String,
    mime_type: String,
    size_bytes: i64,
    owner_id: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteFileRepository {
    db: Arc<SqlitePool>,
}

impl SqliteFileRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> Arc<SqlitePool> {
        self.db.clone()
    }

    /// Apply the embedded schema. Every statement is `IF NOT EXISTS`, so
    /// running it again is harmless.
    pub async fn migrate(&self) -> RepoResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Install a tag/role rule; existing rules are left as they are.
    pub async fn add_access_rule(&self, rule: &AccessRule) -> RepoResult<()> {
        sqlx::query("INSERT OR IGNORE INTO file_access_rules (tag_name, role_name) VALUES (?, ?)")
            .bind(&rule.tag)
            .bind(&rule.role)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FileRepository for SqliteFileRepository {
    async fn create_file(&self, file: &FileMetadata) -> RepoResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO files (id, original_name, storage_key, mime_type, size_bytes, owner_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(file.id)
        .bind(&file.original_name)
        .bind(&file.storage_key)
        .bind(&file.mime_type)
        .bind(file.size_bytes)
        .bind(file.owner_id.as_deref())
        .bind(file.created_at)
        .execute(&mut *tx)
        .await?;

        for tag in &file.tags {
            sqlx::query("INSERT INTO file_tags (file_id, tag_name) VALUES (?, ?)")
                .bind(file.id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_file(&self, id: Uuid) -> RepoResult<FileMetadata> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT id, original_name, storage_key, mime_type, size_bytes, owner_id, created_at
             FROM files WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => RepoError::NotFound(id),
            other => RepoError::Sqlx(other),
        })?;

        let tags: Vec<String> =
            sqlx::query_scalar("SELECT tag_name FROM file_tags WHERE file_id = ? ORDER BY tag_name")
                .bind(id)
                .fetch_all(&*self.db)
                .await?;

        Ok(FileMetadata {
            id: row.id,
            original_name: row.original_name,
            storage_key: row.storage_key,
            mime_type: row.mime_type,
            size_bytes: row.size_bytes,
            owner_id: row.owner_id,
            tags: tags.into_iter().collect(),
            created_at: row.created_at,
        })
    }

    async fn delete_file(&self, id: Uuid) -> RepoResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM file_tags WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            debug!("file {} already absent on delete", id);
        }
        Ok(())
    }

    async fn has_role_access(&self, file_id: Uuid, role: &str) -> RepoResult<bool> {
        let found: i64 = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1
                FROM file_tags ft
                JOIN file_access_rules far ON ft.tag_name = far.tag_name
                WHERE ft.file_id = ? AND far.role_name = ?
            )",
        )
        .bind(file_id)
        .bind(role)
        .fetch_one(&*self.db)
        .await?;
        Ok(found != 0)
    }

    async fn ping(&self) -> RepoResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::file::normalize_tags;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Fresh in-memory database with the schema applied. A single
    /// connection keeps every query on the same in-memory instance.
    pub(crate) async fn memory_repository() -> SqliteFileRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SqliteFileRepository::new(Arc::new(pool));
        repo.migrate().await.unwrap();
        repo
    }

    fn sample(tags: &[&str]) -> FileMetadata {
        let id = Uuid::new_v4();
        FileMetadata {
            id,
            original_name: "invoice.pdf".into(),
            storage_key: format!("{}.pdf", id),
            mime_type: "application/pdf".into(),
            size_bytes: 42,
            owner_id: Some("u1".into()),
            tags: normalize_tags(tags.iter().copied()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_then_get_returns_record_with_tags() {
        let repo = memory_repository().await;
        let file = sample(&["invoice", "q3"]);
        repo.create_file(&file).await.unwrap();

        let loaded = repo.get_file(file.id).await.unwrap();
        assert_eq!(loaded.storage_key, file.storage_key);
        assert_eq!(loaded.owner_id.as_deref(), Some("u1"));
        assert_eq!(loaded.tags, file.tags);
        assert_eq!(loaded.size_bytes, 42);
    }

    #[tokio::test]
    async fn system_owned_files_have_no_owner() {
        let repo = memory_repository().await;
        let mut file = sample(&[]);
        file.owner_id = None;
        repo.create_file(&file).await.unwrap();
        assert_eq!(repo.get_file(file.id).await.unwrap().owner_id, None);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let repo = memory_repository().await;
        let id = Uuid::new_v4();
        assert!(matches!(repo.get_file(id).await, Err(RepoError::NotFound(got)) if got == id));
    }

    #[tokio::test]
    async fn delete_removes_record_and_tags_and_is_idempotent() {
        let repo = memory_repository().await;
        let file = sample(&["invoice"]);
        repo.create_file(&file).await.unwrap();
        repo.add_access_rule(&"invoice:finance".parse().unwrap())
            .await
            .unwrap();

        repo.delete_file(file.id).await.unwrap();
        repo.delete_file(file.id).await.unwrap();

        assert!(matches!(
            repo.get_file(file.id).await,
            Err(RepoError::NotFound(_))
        ));
        assert!(!repo.has_role_access(file.id, "finance").await.unwrap());
    }

    #[tokio::test]
    async fn role_access_follows_tag_rules() {
        let repo = memory_repository().await;
        let file = sample(&["invoice"]);
        repo.create_file(&file).await.unwrap();
        let rule: AccessRule = "invoice:finance".parse().unwrap();
        repo.add_access_rule(&rule).await.unwrap();
        repo.add_access_rule(&rule).await.unwrap();

        assert!(repo.has_role_access(file.id, "finance").await.unwrap());
        assert!(!repo.has_role_access(file.id, "user").await.unwrap());
    }

    #[tokio::test]
    async fn failed_create_leaves_no_partial_record() {
        let repo = memory_repository().await;
        let file = sample(&["a"]);
        repo.create_file(&file).await.unwrap();

        // Same storage key violates the unique constraint.
        let mut clash = sample(&["b"]);
        clash.storage_key = file.storage_key.clone();
        assert!(repo.create_file(&clash).await.is_err());
        assert!(matches!(
            repo.get_file(clash.id).await,
            Err(RepoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_pool() {
        let repo = memory_repository().await;
        repo.ping().await.unwrap();
    }
}
