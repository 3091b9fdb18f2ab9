//! Local filesystem backend.
//!
//! Blobs live at `root/<key>`. Writes stream into a hidden temp file next to
//! the destination and are renamed into place only after `fsync`, so a
//! failed save never exposes a partial blob through `get`.

use async_trait::async_trait;
use futures::StreamExt;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use super::{BlobError, BlobResult, BlobStore, ByteStream, ensure_key_safe};

#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, key: &str) -> BlobResult<PathBuf> {
        ensure_key_safe(key)?;
        Ok(self.root.join(key))
    }

    /// Remove now-empty directories between `start` and the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

async fn write_to_temp(tmp_path: &Path, mut content: ByteStream) -> io::Result<u64> {
    let mut file = File::create(tmp_path).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = content.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn save(&self, key: &str, content: ByteStream) -> BlobResult<u64> {
        let file_path = self.blob_path(key)?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let written = match write_to_temp(&tmp_path, content).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        debug!("stored blob {} ({} bytes)", file_path.display(), written);
        Ok(written)
    }

    async fn get(&self, key: &str) -> BlobResult<ByteStream> {
        let file_path = self.blob_path(key)?;
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let file_path = self.blob_path(key)?;
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
