//! 存储能力接口：分片槽位与最终文件所在的介质。
//!
//! Keys are `/`-separated relative paths (`tmp/<identifier>/<file>.0001`).
//! Backends decide how a key maps onto the medium; the assembler never sees
//! real filesystem paths.

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::path::{Component, Path};
use std::pin::Pin;
use thiserror::Error;

/// A boxed stream of bytes used for chunk payloads and chunk reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Byte storage used by the chunk assembler.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Check whether a file or directory exists at `key`.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Write a whole stream to `key` unless something is already there.
    ///
    /// An existing key is left untouched and reported as `AlreadyExists`;
    /// a failed write leaves nothing half-written behind.
    async fn put_stream(&self, key: &str, data: ByteStream) -> StorageResult<u64>;

    /// Read `key` as a stream of byte pieces.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// List the file keys directly under `dir`. A missing directory lists empty.
    async fn list(&self, dir: &str) -> StorageResult<Vec<String>>;

    /// Create `dir` and any missing parents.
    async fn create_dir(&self, dir: &str) -> StorageResult<()>;

    /// Delete a file, or a directory together with its contents.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Create `key` for writing; fails with `AlreadyExists` if anything is
    /// already there.
    async fn create_exclusive(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;
}

/// 独占创建后的增量写入句柄。
#[async_trait]
pub trait StreamingUpload: Send {
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Flush and close, returning the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Drop the partially written target.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Wraps an in-memory payload as a single-piece stream.
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures_util::stream::once(async move { Ok(data) }))
}

/// Joins key segments with `/`, skipping empty ones.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches(['/', '\\']))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Returns the last segment of a key.
pub fn key_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// 规范化 key，拒绝越界或绝对路径。
pub(crate) fn normalize_key(key: &str) -> StorageResult<String> {
    let trimmed = key.trim_start_matches(['/', '\\']).replace('\\', "/");
    let mut segments = Vec::new();
    for component in Path::new(&trimmed).components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath(key.to_string()));
            }
        }
    }
    Ok(segments.join("/"))
}
