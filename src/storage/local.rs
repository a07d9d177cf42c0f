//! 本地磁盘存储后端。

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::instrument;
use uuid::Uuid;

use super::{ByteStream, Storage, StorageError, StorageResult, StreamingUpload, normalize_key};

/// Stores keys as files below a root directory.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    async fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let normalized = normalize_key(key)?;
        let target = self.root.join(&normalized);
        self.ensure_no_symlink_components(&target, key).await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(&self, target: &Path, key: &str) -> StorageResult<()> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath(key.to_string()))?;
        let mut current = self.root.clone();
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath(key.to_string()));
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath(key.to_string()));
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn not_found_or_io(key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.resolve(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self, data), fields(backend = "local"))]
    async fn put_stream(&self, key: &str, mut data: ByteStream) -> StorageResult<u64> {
        let path = self.resolve(key).await?;
        Self::ensure_parent(&path).await?;

        // Chunks become visible under their final name only once complete.
        let temp_name = format!(
            ".{}.tmp.{}",
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4()
        );
        let temp_path = path.with_file_name(temp_name);
        let write_result: StorageResult<u64> = async {
            let mut file = File::create(&temp_path).await?;
            let mut written: u64 = 0;
            while let Some(piece) = data.next().await {
                let piece = piece?;
                file.write_all(&piece).await?;
                written += piece.len() as u64;
            }
            file.sync_all().await?;
            Ok(written)
        }
        .await;

        match write_result {
            Ok(written) => {
                // hard_link refuses an existing target, unlike rename.
                let linked = fs::hard_link(&temp_path, &path).await;
                let _ = fs::remove_file(&temp_path).await;
                match linked {
                    Ok(()) => Ok(written),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                        Err(StorageError::AlreadyExists(key.to_string()))
                    }
                    Err(err) => Err(StorageError::Io(err)),
                }
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.resolve(key).await?;
        let file = File::open(&path)
            .await
            .map_err(|err| not_found_or_io(key, err))?;
        Ok(Box::pin(ReaderStream::new(file).map_err(StorageError::Io)))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        let prefix = normalize_key(dir)?;
        let path = self.resolve(dir).await?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::Io(err)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            // file_type() does not follow symlinks, so links never get listed.
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            keys.push(super::join_key(&[&prefix, &name]));
        }
        Ok(keys)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn create_dir(&self, dir: &str) -> StorageResult<()> {
        let path = self.resolve(dir).await?;
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|err| not_found_or_io(key, err))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn create_exclusive(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.resolve(key).await?;
        Self::ensure_parent(&path).await?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists(key.to_string())
                } else {
                    StorageError::Io(err)
                }
            })?;
        Ok(Box::new(LocalUpload {
            file,
            path,
            bytes_written: 0,
        }))
    }
}

struct LocalUpload {
    file: File,
    path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for LocalUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        let LocalUpload { file, path, .. } = *self;
        drop(file);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}
