//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;

use crate::assembler::AssemblerConfig;
use crate::build;
use crate::params::{DEFAULT_PARAM_PREFIX, FieldMapping, SessionField};

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STORAGE_DIR: &str = ".resumable";
pub const DEFAULT_TEMP_DIR: &str = "tmp";
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_FILE_FIELD: &str = "file";
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
/// Room for multipart boundaries and the text fields around a chunk.
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// Files below `--storage-dir`.
    Local,
    /// Process memory; everything is lost on exit.
    Memory,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(
    name = "resumable-drive",
    version = VERSION_INFO,
    about = "Chunked upload receiver for resumable.js clients"
)]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "RSD_STORAGE_DIR",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Root directory of the local storage backend"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        value_enum,
        env = "RSD_BACKEND",
        default_value_t = StorageBackend::Local,
        help = "Storage backend"
    )]
    pub backend: StorageBackend,
    #[arg(
        long,
        env = "RSD_TEMP_DIR",
        default_value = DEFAULT_TEMP_DIR,
        help = "Staging directory for chunks, relative to the storage root"
    )]
    pub temp_dir: String,
    #[arg(
        long,
        env = "RSD_UPLOAD_DIR",
        default_value = DEFAULT_UPLOAD_DIR,
        help = "Destination of assembled files, relative to the storage root"
    )]
    pub upload_dir: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "RSD_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "RSD_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "RSD_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "RSD_KEEP_CHUNKS",
        help = "Keep staging directories after assembly (diagnostics)"
    )]
    pub keep_chunks: bool,
    #[arg(long, env = "RSD_DEBUG", help = "Enable debug logging")]
    pub debug: bool,
    #[arg(
        long,
        env = "RSD_VERIFY_LAST_CHUNK",
        help = "Require the final chunk to be stored before assembling"
    )]
    pub verify_last_chunk: bool,
    #[arg(
        long,
        env = "RSD_LOCK_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "Max seconds to wait for another request assembling the same upload"
    )]
    pub lock_timeout_secs: u64,
    #[arg(
        long,
        env = "RSD_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max bytes accepted for a single chunk"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "RSD_PARAM_PREFIX",
        default_value = DEFAULT_PARAM_PREFIX,
        help = "Prefix of the session parameter names"
    )]
    pub param_prefix: String,
    #[arg(long, env = "RSD_PARAM_IDENTIFIER", help = "Short name of the identifier field")]
    pub param_identifier: Option<String>,
    #[arg(long, env = "RSD_PARAM_FILENAME", help = "Short name of the filename field")]
    pub param_filename: Option<String>,
    #[arg(long, env = "RSD_PARAM_CHUNK_NUMBER", help = "Short name of the chunk number field")]
    pub param_chunk_number: Option<String>,
    #[arg(long, env = "RSD_PARAM_CHUNK_SIZE", help = "Short name of the chunk size field")]
    pub param_chunk_size: Option<String>,
    #[arg(long, env = "RSD_PARAM_TOTAL_SIZE", help = "Short name of the total size field")]
    pub param_total_size: Option<String>,
    #[arg(
        long,
        env = "RSD_FILE_FIELD",
        default_value = DEFAULT_FILE_FIELD,
        help = "Multipart field carrying the chunk bytes"
    )]
    pub file_field: String,
}

impl Args {
    pub fn field_mapping(&self) -> FieldMapping {
        let overrides = [
            (SessionField::Identifier, &self.param_identifier),
            (SessionField::Filename, &self.param_filename),
            (SessionField::ChunkNumber, &self.param_chunk_number),
            (SessionField::ChunkSize, &self.param_chunk_size),
            (SessionField::TotalSize, &self.param_total_size),
        ];
        overrides.into_iter().fold(
            FieldMapping::default().with_prefix(self.param_prefix.clone()),
            |mapping, (field, name)| match name {
                Some(name) => mapping.with_field(field, name.clone()),
                None => mapping,
            },
        )
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            temp_dir: self.temp_dir.clone(),
            upload_dir: self.upload_dir.clone(),
            delete_temp_dir: !self.keep_chunks,
            verify_last_chunk: self.verify_last_chunk,
        }
    }
}
