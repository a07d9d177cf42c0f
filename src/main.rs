//! resumable-drive server binary.
//!
//! Receives resumable.js chunk uploads over HTTP, stores every chunk in a
//! per-upload staging directory and assembles the final file as soon as all
//! chunks are present.

mod assembler;
mod config;
mod error;
mod http;
mod locking;
mod logging;
mod params;
mod storage;
mod upload;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum::middleware;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::assembler::ChunkAssembler;
use crate::config::{Args, StorageBackend};
use crate::http::build_cors_layer;
use crate::params::ParamResolver;
use crate::storage::{LocalStorage, MemoryStorage, Storage};
use crate::upload::UploadService;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(args.debug);

    let storage: Arc<dyn Storage> = match args.backend {
        StorageBackend::Local => Arc::new(
            LocalStorage::new(&args.storage_dir)
                .await
                .map_err(|err| std::io::Error::other(err.to_string()))?,
        ),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };
    let assembler = ChunkAssembler::new(storage, args.assembler_config());
    let service = Arc::new(
        UploadService::new(assembler, ParamResolver::new(args.field_mapping()))
            .with_lock_timeout(Duration::from_secs(args.lock_timeout_secs))
            .with_file_field(args.file_field.clone())
            .with_max_chunk_size(args.max_chunk_size),
    );
    info!(
        backend = ?args.backend,
        storage_dir = args.storage_dir,
        temp_dir = args.temp_dir,
        upload_dir = args.upload_dir,
        cleanup = !args.keep_chunks,
        "storage ready"
    );

    let mut app = upload::routes(service)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let listener = TcpListener::bind(addr).await?;

    info!("Starting HTTP server at {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
