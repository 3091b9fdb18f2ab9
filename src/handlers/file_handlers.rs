//! HTTP handlers for file upload, download, metadata and thumbnails.
//! Bodies are streamed in both directions; uploads are spooled to a temp
//! file so the coordinator can read the content twice.

use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, State,
        multipart::{Field, MultipartError},
    },
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use std::{collections::BTreeSet, io};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};
use uuid::Uuid;

use super::auth::Identity;
use crate::{
    errors::AppError,
    models::file::{FileMetadata, normalize_tags},
    services::{
        file_service::{FileError, FileService, ValidationError},
        upload::{IncomingUpload, UploadContent},
    },
};

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

fn spool_error(err: io::Error) -> AppError {
    error!(error = %err, "could not spool upload");
    AppError::internal("could not buffer upload")
}

/// `POST /files/upload` with multipart fields `file` and optional `tags`
/// (comma separated).
pub async fn upload_file(
    State(service): State<FileService>,
    Identity(principal): Identity,
    mut multipart: Multipart,
) -> Result<Json<FileMetadata>, AppError> {
    let max = service.policy().max_size_bytes;
    let mut upload = None;
    let mut tags = BTreeSet::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => upload = Some(spool_field(field, max).await?),
            Some("tags") => {
                let raw = field.text().await.map_err(multipart_error)?;
                tags.extend(normalize_tags(raw.split(',')));
            }
            other => debug!(field = ?other, "ignoring multipart field"),
        }
    }
    let upload = upload.ok_or_else(|| AppError::bad_request("missing `file` field"))?;

    // Detached so a client disconnect cannot cancel the dual write halfway.
    let owner = principal.id;
    let task = tokio::spawn(async move { service.upload(Some(&owner), tags, upload).await });
    let file = task.await.map_err(|err| {
        error!(error = %err, "upload task failed");
        AppError::internal("upload failed")
    })??;
    Ok(Json(file))
}

/// Copy one multipart field into a temp file, stopping once it grows past
/// `max` bytes.
async fn spool_field(mut field: Field<'_>, max: u64) -> Result<IncomingUpload, AppError> {
    let original_name = field
        .file_name()
        .filter(|n| !n.is_empty())
        .unwrap_or("upload")
        .to_string();
    let (file, path) = NamedTempFile::new().map_err(spool_error)?.into_parts();
    let mut out = tokio::fs::File::from_std(file);

    let mut size: u64 = 0;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        size += chunk.len() as u64;
        if size > max {
            return Err(FileError::from(ValidationError::TooLarge { size, max }).into());
        }
        out.write_all(&chunk).await.map_err(spool_error)?;
    }
    out.flush().await.map_err(spool_error)?;

    Ok(IncomingUpload {
        original_name,
        declared_size: size,
        content: UploadContent::Spooled(path),
    })
}

/// `GET /files/{id}` streams the stored content.
pub async fn download_file(
    State(service): State<FileService>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (meta, stream) = service.open(id, &principal).await?;
    let mut response = Response::new(Body::from_stream(stream));
    set_file_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `GET /files/{id}/metadata`
pub async fn file_metadata(
    State(service): State<FileService>,
    Identity(principal): Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<FileMetadata>, AppError> {
    Ok(Json(service.get_metadata(id, &principal).await?))
}

/// `GET /files/{id}/thumbnails/{variant}`
pub async fn file_thumbnail(
    State(service): State<FileService>,
    Identity(principal): Identity,
    Path((id, variant)): Path<(Uuid, String)>,
) -> Result<Response, AppError> {
    let stream = service.open_thumbnail(id, &variant, &principal).await?;
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    Ok(response)
}

fn set_file_headers(headers: &mut HeaderMap, meta: &FileMetadata) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );
    let disposition = format!("attachment; filename=\"{}\"", disposition_name(&meta.original_name));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

/// Client-supplied names go into a quoted header parameter; keep printable
/// ASCII only and drop characters that would end the quoting.
fn disposition_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}
