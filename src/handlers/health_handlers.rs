//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and blob I/O

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    services::file_service::FileService,
    storage::{BlobStore, collect_stream, stream_from_bytes},
};

const PROBE_BODY: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Very small liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Pings the metadata store, then writes, reads back and deletes a probe
/// blob. HTTP 200 when every check passes, 503 otherwise.
pub async fn readyz(State(service): State<FileService>) -> impl IntoResponse {
    let metadata_check = match service.repository().ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    let blobs = service.blobs();
    let blob_check = probe_blob_store(blobs.as_ref()).await;

    let overall_ok = metadata_check.ok && blob_check.ok;
    let mut checks = HashMap::new();
    checks.insert("metadata", metadata_check);
    checks.insert(blobs.backend_name(), blob_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn probe_blob_store(blobs: &dyn BlobStore) -> CheckStatus {
    // Root-level key: no shared directory for concurrent probes to prune.
    let key = format!(".readyz-{}", Uuid::new_v4());
    if let Err(e) = blobs.save(&key, stream_from_bytes(PROBE_BODY)).await {
        return CheckStatus::failed(format!("could not write probe: {}", e));
    }
    let read = match blobs.get(&key).await {
        Ok(stream) => collect_stream(stream).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    let cleanup = blobs.delete(&key).await;
    match (read, cleanup) {
        (Ok(bytes), Ok(())) if bytes == PROBE_BODY => CheckStatus::ok(),
        (Ok(bytes), Err(e)) if bytes == PROBE_BODY => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe: {}", e)),
        },
        (Ok(_), _) => CheckStatus::failed("probe content mismatch".into()),
        (Err(e), _) => CheckStatus::failed(format!("could not read probe: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::local::LocalBlobStore, testing::MemoryBlobStore};

    #[tokio::test]
    async fn blob_probe_cleans_up_after_itself() {
        let blobs = MemoryBlobStore::default();
        let status = probe_blob_store(&blobs).await;
        assert!(status.ok);
        assert!(status.error.is_none());
        assert!(blobs.keys().is_empty());
    }

    #[tokio::test]
    async fn concurrent_local_probes_all_pass() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::new(dir.path());
        let statuses =
            futures::future::join_all((0..16).map(|_| probe_blob_store(&blobs))).await;
        assert!(statuses.iter().all(|s| s.ok && s.error.is_none()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn blob_probe_reports_write_failures() {
        let blobs = MemoryBlobStore::default();
        blobs.fail_saves(true);
        let status = probe_blob_store(&blobs).await;
        assert!(!status.ok);
        assert!(status.error.unwrap().contains("write"));
    }
}
