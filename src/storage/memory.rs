//! 进程内存储后端，用于测试与无盘运行。

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    ByteStream, Storage, StorageError, StorageResult, StreamingUpload, bytes_stream, normalize_key,
};

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
}

impl MemoryState {
    fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{dir}/");
        self.files.keys().any(|key| key.starts_with(&prefix))
            || self.dirs.iter().any(|key| key.starts_with(&prefix))
    }
}

/// Keeps every key in a shared map. Clones share the same contents.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn file_count(&self) -> usize {
        self.state.read().await.files.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let key = normalize_key(key)?;
        let state = self.state.read().await;
        Ok(state.files.contains_key(&key) || state.dirs.contains(&key) || state.has_children(&key))
    }

    async fn put_stream(&self, key: &str, mut data: ByteStream) -> StorageResult<u64> {
        let key = normalize_key(key)?;
        let mut buffer = BytesMut::new();
        while let Some(piece) = data.next().await {
            buffer.extend_from_slice(&piece?);
        }
        let written = buffer.len() as u64;
        let mut state = self.state.write().await;
        if state.files.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key));
        }
        state.files.insert(key, buffer.freeze());
        Ok(written)
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let normalized = normalize_key(key)?;
        let state = self.state.read().await;
        let data = state
            .files
            .get(&normalized)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(bytes_stream(data))
    }

    async fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        let dir = normalize_key(dir)?;
        let prefix = format!("{dir}/");
        let state = self.state.read().await;
        Ok(state
            .files
            .keys()
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }

    async fn create_dir(&self, dir: &str) -> StorageResult<()> {
        let dir = normalize_key(dir)?;
        self.state.write().await.dirs.insert(dir);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let normalized = normalize_key(key)?;
        let prefix = format!("{normalized}/");
        let mut state = self.state.write().await;
        let mut removed = state.files.remove(&normalized).is_some();
        removed |= state.dirs.remove(&normalized);

        let before = state.files.len() + state.dirs.len();
        state.files.retain(|path, _| !path.starts_with(&prefix));
        state.dirs.retain(|path| !path.starts_with(&prefix));
        removed |= state.files.len() + state.dirs.len() != before;

        if removed {
            Ok(())
        } else {
            Err(StorageError::NotFound(key.to_string()))
        }
    }

    async fn create_exclusive(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let normalized = normalize_key(key)?;
        let mut state = self.state.write().await;
        if state.files.contains_key(&normalized) || state.dirs.contains(&normalized) {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        // Reserve the key right away so a second creator loses.
        state.files.insert(normalized.clone(), Bytes::new());
        Ok(Box::new(MemoryUpload {
            state: self.state.clone(),
            key: normalized,
            buffer: BytesMut::new(),
        }))
    }
}

struct MemoryUpload {
    state: Arc<RwLock<MemoryState>>,
    key: String,
    buffer: BytesMut,
}

#[async_trait]
impl StreamingUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let MemoryUpload { state, key, buffer } = *self;
        let written = buffer.len() as u64;
        state.write().await.files.insert(key, buffer.freeze());
        Ok(written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.state.write().await.files.remove(&self.key);
        Ok(())
    }
}
