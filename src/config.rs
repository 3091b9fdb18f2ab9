use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{collections::BTreeSet, env, path::PathBuf};

use crate::models::access::AccessRule;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage: StorageBackend,
    pub upload: UploadPolicy,
    pub queue: QueueSettings,
    pub admin_role: String,
}

/// Which blob backend to use, with its backend-specific settings.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    Local { root: PathBuf },
    S3(S3Settings),
}

#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub use_path_style: bool,
}

// Keep keys out of the startup log line.
impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("use_path_style", &self.use_path_style)
            .finish()
    }
}

/// Validation limits applied to every upload.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_size_bytes: u64,
    /// Base MIME types (no parameters) accepted after content sniffing.
    pub allowed_mime_types: BTreeSet<String>,
    /// Exit the process after logging a failed metadata rollback.
    pub abort_on_inconsistency: bool,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    pub thumbnail_queue: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    /// In-process queue; the thumbnail worker must run in the same process.
    Memory,
    Redis { url: String },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File ingestion service with thumbnail pipeline")]
pub struct Args {
    /// Host to bind to (overrides FILE_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Blob backend, `local` or `s3` (overrides FILE_INGEST_STORAGE_BACKEND)
    #[arg(long)]
    pub storage_backend: Option<String>,

    /// Directory for the local blob backend (overrides FILE_INGEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILE_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Queue backend, `memory` or `redis` (overrides FILE_INGEST_QUEUE_BACKEND)
    #[arg(long)]
    pub queue_backend: Option<String>,

    /// Run migrations, apply --grant rules, and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run only the thumbnail worker
    #[arg(long, conflicts_with = "migrate")]
    pub worker: bool,

    /// Also run the thumbnail worker inside the HTTP server process
    #[arg(long, conflicts_with = "worker")]
    pub embedded_worker: bool,

    /// Access rule to install during --migrate, as TAG:ROLE (repeatable)
    #[arg(long = "grant", value_name = "TAG:ROLE")]
    pub grants: Vec<AccessRule>,
}

/// What the process was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Serve { embedded_worker: bool },
    Worker,
    Migrate { grants: Vec<AccessRule> },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        // Parse CLI once
        let args = Args::parse();
        Self::from_sources(args, |key| env::var(key).ok())
    }

    /// Merge CLI args over values produced by `lookup` (normally the process
    /// environment) over defaults.
    pub fn from_sources(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, RunMode)> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match args.port {
            Some(port) => port,
            None => parse_var(&var, "FILE_INGEST_PORT", 8080)?,
        };
        let max_size_mb: u64 = parse_var(&var, "FILE_INGEST_MAX_SIZE_MB", 10)?;
        let max_size_bytes = max_size_mb
            .checked_mul(1024 * 1024)
            .with_context(|| format!("FILE_INGEST_MAX_SIZE_MB={max_size_mb} is too large"))?;

        let storage_kind = args
            .storage_backend
            .or_else(|| var("FILE_INGEST_STORAGE_BACKEND"))
            .unwrap_or_else(|| "local".into());
        let storage = match storage_kind.to_ascii_lowercase().as_str() {
            "local" => StorageBackend::Local {
                root: args
                    .storage_dir
                    .or_else(|| var("FILE_INGEST_STORAGE_DIR"))
                    .unwrap_or_else(|| "./data/blobs".into())
                    .into(),
            },
            "s3" => StorageBackend::S3(S3Settings {
                bucket: var("FILE_INGEST_S3_BUCKET")
                    .context("FILE_INGEST_S3_BUCKET is required for the s3 backend")?,
                region: var("FILE_INGEST_S3_REGION").unwrap_or_else(|| "us-east-1".into()),
                endpoint: var("FILE_INGEST_S3_ENDPOINT"),
                access_key: var("FILE_INGEST_S3_ACCESS_KEY"),
                secret_key: var("FILE_INGEST_S3_SECRET_KEY"),
                use_path_style: parse_var(&var, "FILE_INGEST_S3_USE_PATH_STYLE", true)?,
            }),
            other => bail!("unknown storage backend `{}` (expected local or s3)", other),
        };

        let allowed_mime_types = var("FILE_INGEST_ALLOWED_MIME_TYPES")
            .unwrap_or_else(|| "image/jpeg,image/png,application/pdf".into())
            .split(',')
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let queue_kind = args
            .queue_backend
            .or_else(|| var("FILE_INGEST_QUEUE_BACKEND"))
            .unwrap_or_else(|| "memory".into());
        let queue_backend = match queue_kind.to_ascii_lowercase().as_str() {
            "memory" => QueueBackend::Memory,
            "redis" => QueueBackend::Redis {
                url: var("FILE_INGEST_REDIS_URL")
                    .unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            },
            other => bail!("unknown queue backend `{}` (expected memory or redis)", other),
        };

        let mode = if args.migrate {
            RunMode::Migrate { grants: args.grants }
        } else if args.worker {
            if queue_backend == QueueBackend::Memory {
                bail!("--worker needs a shared queue; set FILE_INGEST_QUEUE_BACKEND=redis");
            }
            RunMode::Worker
        } else {
            RunMode::Serve {
                embedded_worker: args.embedded_worker || queue_backend == QueueBackend::Memory,
            }
        };

        // --- Merge ---
        let cfg = Self {
            host: args
                .host
                .or_else(|| var("FILE_INGEST_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port,
            database_url: args
                .database_url
                .or_else(|| var("FILE_INGEST_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/files.db".into()),
            storage,
            upload: UploadPolicy {
                max_size_bytes,
                allowed_mime_types,
                abort_on_inconsistency: parse_var(
                    &var,
                    "FILE_INGEST_ABORT_ON_INCONSISTENCY",
                    false,
                )?,
            },
            queue: QueueSettings {
                backend: queue_backend,
                thumbnail_queue: var("FILE_INGEST_THUMBNAIL_QUEUE")
                    .unwrap_or_else(|| "thumbnail_generation".into()),
            },
            admin_role: var("FILE_INGEST_ADMIN_ROLE").unwrap_or_else(|| "admin".into()),
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
