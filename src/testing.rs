//! In-memory doubles for the blob and metadata stores, with switches for
//! injecting failures.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use uuid::Uuid;

use crate::{
    models::file::FileMetadata,
    repository::{FileRepository, RepoError, RepoResult},
    storage::{BlobError, BlobResult, BlobStore, ByteStream, collect_stream, stream_from_bytes},
};

#[derive(Default)]
pub struct MemoryFileRepository {
    files: Mutex<HashMap<Uuid, FileMetadata>>,
    rules: Mutex<HashSet<(String, String)>>,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    fail_access: AtomicBool,
    creates: AtomicUsize,
    access_lookups: AtomicUsize,
}

fn injected_db_error() -> RepoError {
    RepoError::Sqlx(sqlx::Error::PoolTimedOut)
}

impl MemoryFileRepository {
    pub fn insert(&self, file: FileMetadata) {
        self.files.lock().unwrap().insert(file.id, file);
    }

    pub fn grant(&self, tag: &str, role: &str) {
        self.rules
            .lock()
            .unwrap()
            .insert((tag.to_string(), role.to_string()));
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.files.lock().unwrap().contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().unwrap().is_empty()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_access_lookups(&self, fail: bool) {
        self.fail_access.store(fail, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn access_lookups(&self) -> usize {
        self.access_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileRepository for MemoryFileRepository {
    async fn create_file(&self, file: &FileMetadata) -> RepoResult<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(injected_db_error());
        }
        self.insert(file.clone());
        Ok(())
    }

    async fn get_file(&self, id: Uuid) -> RepoResult<FileMetadata> {
        self.files
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RepoError::NotFound(id))
    }

    async fn delete_file(&self, id: Uuid) -> RepoResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(injected_db_error());
        }
        self.files.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn has_role_access(&self, file_id: Uuid, role: &str) -> RepoResult<bool> {
        self.access_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_access.load(Ordering::SeqCst) {
            return Err(injected_db_error());
        }
        let tags = match self.files.lock().unwrap().get(&file_id) {
            Some(file) => file.tags.clone(),
            None => return Ok(false),
        };
        let rules = self.rules.lock().unwrap();
        Ok(tags
            .iter()
            .any(|tag| rules.contains(&(tag.clone(), role.to_string()))))
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    fail_save: AtomicBool,
    fail_get: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn put(&self, key: &str, data: impl Into<Bytes>) {
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), data.into());
    }

    pub fn read(&self, key: &str) -> Option<Bytes> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, key: &str, content: ByteStream) -> BlobResult<u64> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(BlobError::Io(io::Error::other("injected save failure")));
        }
        let data = collect_stream(content).await?;
        let len = data.len() as u64;
        self.put(key, data);
        Ok(len)
    }

    async fn get(&self, key: &str) -> BlobResult<ByteStream> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(BlobError::Io(io::Error::other("injected get failure")));
        }
        self.read(key)
            .map(stream_from_bytes)
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
