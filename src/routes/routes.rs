//! Defines the file service routes.
//!
//! ## Structure
//! - `POST /files/upload`: multipart upload (`file`, optional `tags`)
//! - `GET  /files/{id}`: download content
//! - `GET  /files/{id}/metadata`: metadata record
//! - `GET  /files/{id}/thumbnails/{variant}`: derived PNG thumbnail
//! - `GET  /healthz`, `GET /readyz`: probes
//!
//! Every `/files` route needs the gateway identity headers.

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

use crate::{
    handlers::{
        file_handlers::{download_file, file_metadata, file_thumbnail, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};

/// Room for multipart boundaries and the `tags` field on top of the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the router; the request body limit follows the upload size limit.
pub fn routes(max_upload_bytes: u64) -> Router<FileService> {
    let body_limit = usize::try_from(max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/files/upload",
            post(upload_file).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/files/{id}", get(download_file))
        .route("/files/{id}/metadata", get(file_metadata))
        .route("/files/{id}/thumbnails/{variant}", get(file_thumbnail))
}
