//! 分片槽位命名、完整性判断、单片持久化与最终合并。
//!
//! A chunk slot lives at `<temp>/<identifier>/<filename>.<NNNN>`; the number
//! is 1-based and zero-padded to four digits. Slots are written at most once
//! and never rewritten. Once every slot is present the slots are concatenated
//! in numeric order into `<uploads>/<final filename>` and the staging
//! directory is removed.

use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{DEFAULT_TEMP_DIR, DEFAULT_UPLOAD_DIR};
use crate::storage::{ByteStream, Storage, StorageError, StorageResult, join_key, key_name};

#[derive(Clone, Debug)]
pub struct AssemblerConfig {
    /// Key prefix holding one staging directory per identifier.
    pub temp_dir: String,
    /// Key prefix receiving assembled files.
    pub upload_dir: String,
    /// Remove the staging directory after a successful merge.
    pub delete_temp_dir: bool,
    /// Also require the final slot before reporting completeness.
    pub verify_last_chunk: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            temp_dir: DEFAULT_TEMP_DIR.to_string(),
            upload_dir: DEFAULT_UPLOAD_DIR.to_string(),
            delete_temp_dir: true,
            verify_last_chunk: false,
        }
    }
}

/// The file produced by a merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalArtifact {
    pub path: String,
    pub filename: String,
    pub original_filename: String,
    pub extension: Option<String>,
    pub size: u64,
    pub chunks: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assembly {
    Assembled(FinalArtifact),
    /// The destination already existed; someone else merged first.
    AlreadyAssembled { path: String },
}

impl Assembly {
    pub fn path(&self) -> &str {
        match self {
            Assembly::Assembled(artifact) => &artifact.path,
            Assembly::AlreadyAssembled { path } => path,
        }
    }
}

pub struct ChunkAssembler {
    storage: Arc<dyn Storage>,
    config: AssemblerConfig,
}

impl ChunkAssembler {
    pub fn new(storage: Arc<dyn Storage>, config: AssemblerConfig) -> Self {
        Self { storage, config }
    }

    pub fn staging_dir(&self, identifier: &str) -> String {
        join_key(&[&self.config.temp_dir, identifier])
    }

    pub fn chunk_slot_path(&self, identifier: &str, filename: &str, chunk_number: u64) -> String {
        join_key(&[
            &self.staging_dir(identifier),
            &chunk_slot_name(filename, chunk_number),
        ])
    }

    pub async fn ensure_staging_dir(&self, identifier: &str) -> StorageResult<String> {
        let dir = self.staging_dir(identifier);
        self.storage.create_dir(&dir).await?;
        Ok(dir)
    }

    pub async fn chunk_exists(
        &self,
        identifier: &str,
        filename: &str,
        chunk_number: u64,
    ) -> StorageResult<bool> {
        self.storage
            .exists(&self.chunk_slot_path(identifier, filename, chunk_number))
            .await
    }

    /// 根据声明的总大小与分片大小判断是否所有分片都已到达。
    ///
    /// Slots `1..n` are checked where `n = ceil(total / chunk)`. The final
    /// slot is only checked when `verify_last_chunk` is set; otherwise the
    /// request carrying it is trusted to have just written it. A non-positive
    /// chunk size never completes.
    pub async fn is_upload_complete(
        &self,
        filename: &str,
        identifier: &str,
        chunk_size: i64,
        total_size: i64,
    ) -> StorageResult<bool> {
        if chunk_size <= 0 {
            return Ok(false);
        }
        let num_chunks = expected_chunks(chunk_size as u64, total_size.max(0) as u64);
        let last_checked = if self.config.verify_last_chunk {
            num_chunks
        } else {
            num_chunks.saturating_sub(1)
        };
        for chunk_number in 1..=last_checked {
            if !self.chunk_exists(identifier, filename, chunk_number).await? {
                debug!(identifier, chunk_number, num_chunks, "upload not complete yet");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Writes the payload into its slot unless the slot already exists.
    /// Returns whether anything was written; of two concurrent writers to
    /// one slot exactly one wins.
    pub async fn persist_chunk(
        &self,
        identifier: &str,
        filename: &str,
        chunk_number: u64,
        payload: ByteStream,
    ) -> StorageResult<bool> {
        if self.chunk_exists(identifier, filename, chunk_number).await? {
            debug!(identifier, chunk_number, "chunk already stored, skipping");
            return Ok(false);
        }
        self.ensure_staging_dir(identifier).await?;
        let slot = self.chunk_slot_path(identifier, filename, chunk_number);
        match self.storage.put_stream(&slot, payload).await {
            Ok(bytes) => {
                debug!(identifier, chunk_number, bytes, "chunk stored");
                Ok(true)
            }
            Err(StorageError::AlreadyExists(_)) => {
                debug!(identifier, chunk_number, "chunk stored concurrently, skipping");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// 按数字顺序合并暂存目录中的分片并清理暂存目录。
    ///
    /// A destination that already exists is reported as
    /// [`Assembly::AlreadyAssembled`]; the staging directory is still cleaned
    /// up so late retransmissions leave nothing behind.
    pub async fn assemble(
        &self,
        identifier: &str,
        filename: &str,
        override_filename: Option<&str>,
    ) -> StorageResult<Assembly> {
        let staging = self.staging_dir(identifier);
        let mut chunks: Vec<(u64, String)> = self
            .storage
            .list(&staging)
            .await?
            .into_iter()
            .filter_map(|key| chunk_index(key_name(&key), filename).map(|index| (index, key)))
            .collect();
        if chunks.is_empty() {
            return Err(StorageError::NotFound(staging));
        }
        chunks.sort_by_key(|(index, _)| *index);

        let final_name = final_filename(filename, override_filename);
        let destination = join_key(&[&self.config.upload_dir, &final_name]);
        debug!(
            identifier,
            destination,
            chunks = chunks.len(),
            "begin assembling chunks"
        );

        let mut upload = match self.storage.create_exclusive(&destination).await {
            Ok(upload) => upload,
            Err(StorageError::AlreadyExists(_)) => {
                warn!(identifier, destination, "destination exists, assembly already performed");
                self.remove_staging(&staging).await?;
                return Ok(Assembly::AlreadyAssembled { path: destination });
            }
            Err(err) => return Err(err),
        };

        let copied: StorageResult<()> = async {
            for (_, key) in &chunks {
                let mut stream = self.storage.get_stream(key).await?;
                while let Some(piece) = stream.next().await {
                    upload.write(piece?).await?;
                }
                debug!(chunk = key.as_str(), "appended chunk");
            }
            Ok(())
        }
        .await;
        if let Err(err) = copied {
            if let Err(abort_err) = upload.abort().await {
                warn!(destination, error = %abort_err, "failed to remove partial file");
            }
            return Err(err);
        }
        let size = upload.finish().await?;
        debug!(identifier, destination, size, "end assembling chunks");

        self.remove_staging(&staging).await?;

        Ok(Assembly::Assembled(FinalArtifact {
            extension: extension_of(&final_name).map(str::to_string),
            path: destination,
            filename: final_name,
            original_filename: filename.to_string(),
            size,
            chunks: chunks.len(),
        }))
    }

    async fn remove_staging(&self, staging: &str) -> StorageResult<()> {
        if !self.config.delete_temp_dir {
            return Ok(());
        }
        match self.storage.delete(staging).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

pub fn chunk_slot_name(filename: &str, chunk_number: u64) -> String {
    format!("{filename}.{chunk_number:04}")
}

pub fn expected_chunks(chunk_size: u64, total_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

/// Chunk number of a staged `<filename>.<digits>` name; anything else is `None`.
fn chunk_index(name: &str, filename: &str) -> Option<u64> {
    let digits = name.strip_prefix(filename)?.strip_prefix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Extension after the last dot, if the name has a non-empty stem.
pub fn extension_of(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

pub fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// The override keeps its stem but always takes the original's extension.
pub fn final_filename(original: &str, override_filename: Option<&str>) -> String {
    let Some(name) = override_filename else {
        return original.to_string();
    };
    match extension_of(original) {
        Some(ext) => format!("{}.{ext}", strip_extension(name)),
        None => strip_extension(name).to_string(),
    }
}
