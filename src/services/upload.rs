//! Raw upload input handed to the coordinator.
//!
//! Content must be readable more than once: the coordinator sniffs the head
//! for MIME detection and then streams the whole body from the start into
//! the blob store.

#[cfg(test)]
use bytes::Bytes;
use futures::StreamExt;
use std::io;
use tempfile::TempPath;
use tokio::{
    fs::{self, File},
    io::AsyncReadExt,
};
use tokio_util::io::ReaderStream;

#[cfg(test)]
use crate::storage::stream_from_bytes;
use crate::storage::ByteStream;

pub enum UploadContent {
    #[cfg(test)]
    Memory(Bytes),
    /// Body spooled to a temp file; removed when this value is dropped.
    Spooled(TempPath),
}

impl UploadContent {
    /// Read up to `limit` bytes from the start of the content.
    pub async fn head(&self, limit: usize) -> io::Result<Vec<u8>> {
        match self {
            #[cfg(test)]
            UploadContent::Memory(bytes) => Ok(bytes[..bytes.len().min(limit)].to_vec()),
            UploadContent::Spooled(path) => {
                let file = File::open(&**path).await?;
                let mut head = Vec::with_capacity(limit);
                file.take(limit as u64).read_to_end(&mut head).await?;
                Ok(head)
            }
        }
    }

    /// Length of the content as it exists now, without reading it.
    pub async fn byte_len(&self) -> io::Result<u64> {
        match self {
            #[cfg(test)]
            UploadContent::Memory(bytes) => Ok(bytes.len() as u64),
            UploadContent::Spooled(path) => Ok(fs::metadata(&**path).await?.len()),
        }
    }

    /// A fresh stream over the full content, starting at byte zero.
    pub async fn open(&self) -> io::Result<ByteStream> {
        match self {
            #[cfg(test)]
            UploadContent::Memory(bytes) => Ok(stream_from_bytes(bytes.clone())),
            UploadContent::Spooled(path) => {
                let file = File::open(&**path).await?;
                Ok(ReaderStream::new(file).boxed())
            }
        }
    }
}

/// One file as received from a client.
pub struct IncomingUpload {
    /// Client-supplied name; only its extension is reused, cosmetically.
    pub original_name: String,
    /// Byte length reported by the receiving layer. Checked before any
    /// content is read; the stored size is the measured length.
    pub declared_size: u64,
    pub content: UploadContent,
}

#[cfg(test)]
impl IncomingUpload {
    pub fn from_bytes(original_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            original_name: original_name.into(),
            declared_size: data.len() as u64,
            content: UploadContent::Memory(data),
        }
    }
}
