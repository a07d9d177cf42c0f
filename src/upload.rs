//! 分片上传请求处理：探测（GET）与分片写入（POST）。

use axum::extract::{DefaultBodyLimit, Extension, FromRequest, Multipart, Query, Request};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum::Router;
use axum::routing::any;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::assembler::{Assembly, ChunkAssembler};
use crate::config::{
    DEFAULT_FILE_FIELD, DEFAULT_LOCK_WAIT_TIMEOUT_SECS, DEFAULT_MAX_CHUNK_SIZE, MULTIPART_OVERHEAD,
};
use crate::error::ApiError;
use crate::locking::LockManager;
use crate::params::{ParamResolver, RequestContext, SessionField, SessionParams};
use crate::storage::{StorageError, bytes_stream};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("missing parameter {0}")]
    MissingParam(String),

    #[error("invalid value {value:?} for parameter {name}")]
    InvalidParam { name: String, value: String },

    #[error("chunk exceeds {0} bytes")]
    ChunkTooLarge(u64),

    #[error("upload {0} is being assembled by another request")]
    Busy(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a processed request amounts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Probe: the slot exists.
    Present,
    /// Probe: the slot is missing.
    Absent,
    /// A chunk was accepted, whether or not it was new.
    Accepted {
        stored: bool,
        assembly: Option<Assembly>,
    },
}

impl Outcome {
    pub fn status(&self) -> StatusCode {
        match self {
            Outcome::Absent => StatusCode::NO_CONTENT,
            Outcome::Present | Outcome::Accepted { .. } => StatusCode::OK,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadChunkResponse {
    complete: bool,
    path: Option<String>,
}

pub struct UploadService {
    assembler: ChunkAssembler,
    resolver: ParamResolver,
    locks: LockManager,
    lock_timeout: Duration,
    file_field: String,
    max_chunk_size: u64,
}

impl UploadService {
    pub fn new(assembler: ChunkAssembler, resolver: ParamResolver) -> Self {
        Self {
            assembler,
            resolver,
            locks: LockManager::new(),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
            file_field: DEFAULT_FILE_FIELD.to_string(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_file_field(mut self, field: impl Into<String>) -> Self {
        self.file_field = field.into();
        self
    }

    pub fn with_max_chunk_size(mut self, max: u64) -> Self {
        self.max_chunk_size = max;
        self
    }

    #[cfg(test)]
    pub fn assembler(&self) -> &ChunkAssembler {
        &self.assembler
    }

    /// Returns `None` when the request carries no session parameters.
    pub async fn process(
        &self,
        ctx: &RequestContext,
        override_filename: Option<&str>,
    ) -> Result<Option<Outcome>, UploadError> {
        let params = self.resolver.resolve(ctx);
        if params.is_empty() {
            debug!(method = %ctx.method, "no upload session parameters");
            return Ok(None);
        }
        let outcome = match &ctx.payload {
            Some(payload) => {
                self.handle_chunk(&params, payload.clone(), override_filename)
                    .await?
            }
            None => self.handle_test_chunk(&params).await?,
        };
        Ok(Some(outcome))
    }

    /// 探测分片是否已存在。
    pub async fn handle_test_chunk(&self, params: &SessionParams) -> Result<Outcome, UploadError> {
        let identifier = self.segment(params, SessionField::Identifier)?;
        let filename = self.segment(params, SessionField::Filename)?;
        let chunk_number = self.chunk_number(params)?;

        if self
            .assembler
            .chunk_exists(identifier, filename, chunk_number)
            .await?
        {
            Ok(Outcome::Present)
        } else {
            Ok(Outcome::Absent)
        }
    }

    /// 保存分片；若全部到达则在标识锁内合并。
    pub async fn handle_chunk(
        &self,
        params: &SessionParams,
        payload: Bytes,
        override_filename: Option<&str>,
    ) -> Result<Outcome, UploadError> {
        let identifier = self.segment(params, SessionField::Identifier)?;
        let filename = self.segment(params, SessionField::Filename)?;
        let chunk_number = self.chunk_number(params)?;
        let chunk_size: i64 = self.number(params, SessionField::ChunkSize)?;
        let total_size: i64 = self.number(params, SessionField::TotalSize)?;
        if let Some(name) = override_filename {
            validate_segment("filename override", name)?;
        }
        if payload.len() as u64 > self.max_chunk_size {
            return Err(UploadError::ChunkTooLarge(self.max_chunk_size));
        }

        let stored = self
            .assembler
            .persist_chunk(identifier, filename, chunk_number, bytes_stream(payload))
            .await?;

        let guard = self
            .locks
            .lock_with_timeout(identifier, self.lock_timeout)
            .await
            .map_err(|_| UploadError::Busy(identifier.to_string()))?;
        let assembled: Result<Option<Assembly>, StorageError> = async {
            if !self
                .assembler
                .is_upload_complete(filename, identifier, chunk_size, total_size)
                .await?
            {
                return Ok(None);
            }
            self.assembler
                .assemble(identifier, filename, override_filename)
                .await
                .map(Some)
        }
        .await;
        drop(guard);
        self.locks.prune_idle().await;

        let assembly = assembled?;
        match &assembly {
            Some(Assembly::Assembled(artifact)) => info!(
                identifier,
                path = artifact.path,
                filename = artifact.filename,
                original_filename = artifact.original_filename,
                extension = artifact.extension.as_deref(),
                size = artifact.size,
                chunks = artifact.chunks,
                "upload complete"
            ),
            Some(Assembly::AlreadyAssembled { path }) => {
                info!(identifier, path, "upload was already assembled")
            }
            None => {}
        }
        Ok(Outcome::Accepted { stored, assembly })
    }

    fn required<'a>(
        &self,
        params: &'a SessionParams,
        field: SessionField,
    ) -> Result<&'a str, UploadError> {
        params
            .get(field)
            .ok_or_else(|| UploadError::MissingParam(self.resolver.mapping().wire_name(field)))
    }

    fn segment<'a>(
        &self,
        params: &'a SessionParams,
        field: SessionField,
    ) -> Result<&'a str, UploadError> {
        let value = self.required(params, field)?;
        validate_segment(&self.resolver.mapping().wire_name(field), value)?;
        Ok(value)
    }

    fn number<T: FromStr>(&self, params: &SessionParams, field: SessionField) -> Result<T, UploadError> {
        let value = self.required(params, field)?;
        value.trim().parse().map_err(|_| UploadError::InvalidParam {
            name: self.resolver.mapping().wire_name(field),
            value: value.to_string(),
        })
    }

    fn chunk_number(&self, params: &SessionParams) -> Result<u64, UploadError> {
        let chunk_number: u64 = self.number(params, SessionField::ChunkNumber)?;
        if chunk_number == 0 {
            return Err(UploadError::InvalidParam {
                name: self.resolver.mapping().wire_name(SessionField::ChunkNumber),
                value: "0".into(),
            });
        }
        Ok(chunk_number)
    }
}

/// Identifiers and filenames become single path segments.
fn validate_segment(name: &str, value: &str) -> Result<(), UploadError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if invalid {
        return Err(UploadError::InvalidParam {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Upload routes; the body limit follows the configured chunk size.
pub fn routes(service: Arc<UploadService>) -> Router {
    let body_limit = service.max_chunk_size.saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);
    Router::new()
        .route(
            "/upload",
            any(resumable_upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .layer(Extension(service))
}

/// resumable.js 端点：GET 探测分片，POST 上传分片。
pub async fn resumable_upload(
    Extension(service): Extension<Arc<UploadService>>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, ApiError> {
    let mut ctx = RequestContext::new(method);
    ctx.query = query;
    if ctx.method == Method::POST {
        let (body, payload) = read_multipart(request, &service.file_field).await?;
        ctx.body = body;
        ctx.payload = payload;
    }

    let Some(outcome) = service.process(&ctx, None).await? else {
        return Err(ApiError::BadRequest("no resumable parameters".into()));
    };
    let status = outcome.status();
    match outcome {
        Outcome::Accepted { stored, assembly } => {
            debug!(stored, complete = assembly.is_some(), "chunk accepted");
            let response = UploadChunkResponse {
                complete: assembly.is_some(),
                path: assembly.map(|assembly| assembly.path().to_string()),
            };
            Ok((status, JsonResponse(response)).into_response())
        }
        Outcome::Present | Outcome::Absent => Ok(status.into_response()),
    }
}

async fn read_multipart(
    request: Request,
    file_field: &str,
) -> Result<(HashMap<String, String>, Option<Bytes>), ApiError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    let mut body = HashMap::new();
    let mut payload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == file_field {
            let data = field
                .bytes()
                .await
                .map_err(|err| ApiError::BadRequest(err.body_text()))?;
            payload = Some(data);
        } else {
            let value = field
                .text()
                .await
                .map_err(|err| ApiError::BadRequest(err.body_text()))?;
            body.insert(name, value);
        }
    }
    Ok((body, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::AssemblerConfig;
    use crate::storage::{LocalStorage, MemoryStorage, Storage};
    use axum::body::Body as AxumBody;
    use axum::http::Request as HttpRequest;
    use futures_util::StreamExt;
    use serde_json::Value;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "resumable-test-boundary";

    fn make_service(config: AssemblerConfig) -> (MemoryStorage, Arc<UploadService>) {
        let storage = MemoryStorage::new();
        let assembler = ChunkAssembler::new(Arc::new(storage.clone()), config);
        let service = UploadService::new(assembler, ParamResolver::default())
            .with_lock_timeout(Duration::from_secs(5));
        (storage, Arc::new(service))
    }

    fn chunk_params(
        identifier: &str,
        filename: &str,
        chunk_number: u64,
        chunk_size: i64,
        total_size: i64,
    ) -> HashMap<String, String> {
        [
            ("resumableIdentifier", identifier.to_string()),
            ("resumableFilename", filename.to_string()),
            ("resumableChunkNumber", chunk_number.to_string()),
            ("resumableChunkSize", chunk_size.to_string()),
            ("resumableTotalSize", total_size.to_string()),
            ("resumableRelativePath", filename.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }

    fn multipart_request(params: &HashMap<String, String>, data: &[u8]) -> HttpRequest<AxumBody> {
        let mut body = Vec::new();
        for (name, value) in params {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        HttpRequest::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("build request")
    }

    fn probe_request(params: &HashMap<String, String>) -> HttpRequest<AxumBody> {
        let query = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        HttpRequest::builder()
            .method(Method::GET)
            .uri(format!("/upload?{query}"))
            .body(AxumBody::empty())
            .expect("build request")
    }

    async fn send(router: &Router, request: HttpRequest<AxumBody>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn read_all(storage: &dyn Storage, key: &str) -> Vec<u8> {
        let mut stream = storage.get_stream(key).await.expect("open");
        let mut out = Vec::new();
        while let Some(piece) = stream.next().await {
            out.extend_from_slice(&piece.expect("piece"));
        }
        out
    }

    #[tokio::test]
    async fn probe_reports_missing_then_present_chunk() {
        let (_, service) = make_service(AssemblerConfig::default());
        let router = routes(service.clone());
        let params = chunk_params("id1", "f.bin", 5, 10, 100);

        let (status, _) = send(&router, probe_request(&params)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        service
            .assembler()
            .persist_chunk("id1", "f.bin", 5, bytes_stream(Bytes::from_static(b"x")))
            .await
            .expect("persist");
        let (status, _) = send(&router, probe_request(&params)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn chunks_are_assembled_once_complete() {
        let temp = tempdir().expect("tempdir");
        let storage = LocalStorage::new(temp.path()).await.expect("storage");
        let assembler = ChunkAssembler::new(Arc::new(storage), AssemblerConfig::default());
        let router = routes(Arc::new(UploadService::new(
            assembler,
            ParamResolver::default(),
        )));

        // Final partial chunk first, so completion happens on chunk 2.
        let (status, json) = send(
            &router,
            multipart_request(&chunk_params("id1", "f.bin", 3, 10, 25), &[3; 5]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["complete"], Value::Bool(false));

        let (_, json) = send(
            &router,
            multipart_request(&chunk_params("id1", "f.bin", 1, 10, 25), &[1; 10]),
        )
        .await;
        assert_eq!(json["complete"], Value::Bool(false));

        let (status, json) = send(
            &router,
            multipart_request(&chunk_params("id1", "f.bin", 2, 10, 25), &[2; 10]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["complete"], Value::Bool(true));
        assert_eq!(json["path"], Value::String("uploads/f.bin".into()));

        let assembled = std::fs::read(temp.path().join("uploads/f.bin")).expect("final file");
        assert_eq!(assembled.len(), 25);
        assert_eq!(assembled[..10], [1u8; 10]);
        assert_eq!(assembled[10..20], [2u8; 10]);
        assert_eq!(assembled[20..], [3u8; 5]);
        assert!(!temp.path().join("tmp/id1").exists());
    }

    #[tokio::test]
    async fn retransmitted_chunk_is_accepted_without_rewrite() {
        let (storage, service) = make_service(AssemblerConfig::default());
        let router = routes(service);
        let params = chunk_params("retry", "f.bin", 1, 10, 100);

        let (status, _) = send(&router, multipart_request(&params, b"original")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, json) = send(&router, multipart_request(&params, b"changed!")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["complete"], Value::Bool(false));
        assert_eq!(read_all(&storage, "tmp/retry/f.bin.0001").await, b"original");
    }

    #[tokio::test]
    async fn strict_mode_waits_for_final_chunk() {
        let (storage, service) = make_service(AssemblerConfig {
            verify_last_chunk: true,
            ..AssemblerConfig::default()
        });
        let body = chunk_params("strict", "f.bin", 1, 10, 25);
        let outcome = service
            .process(&RequestContext::chunk(body, Bytes::from_static(&[1; 10])), None)
            .await
            .expect("process");
        assert_eq!(
            outcome,
            Some(Outcome::Accepted {
                stored: true,
                assembly: None
            })
        );

        let body = chunk_params("strict", "f.bin", 2, 10, 25);
        let outcome = service
            .process(&RequestContext::chunk(body, Bytes::from_static(&[2; 10])), None)
            .await
            .expect("process");
        assert!(matches!(outcome, Some(Outcome::Accepted { assembly: None, .. })));

        let body = chunk_params("strict", "f.bin", 3, 10, 25);
        let outcome = service
            .process(&RequestContext::chunk(body, Bytes::from_static(&[3; 5])), None)
            .await
            .expect("process");
        assert!(matches!(
            outcome,
            Some(Outcome::Accepted {
                assembly: Some(Assembly::Assembled(_)),
                ..
            })
        ));
        assert_eq!(read_all(&storage, "uploads/f.bin").await.len(), 25);
    }

    #[tokio::test]
    async fn override_filename_is_applied_on_assembly() {
        let (storage, service) = make_service(AssemblerConfig::default());
        let body = chunk_params("csv", "data.csv", 1, 100, 4);
        let outcome = service
            .process(
                &RequestContext::chunk(body, Bytes::from_static(b"a,b\n")),
                Some("report"),
            )
            .await
            .expect("process");

        let Some(Outcome::Accepted {
            assembly: Some(assembly),
            ..
        }) = outcome
        else {
            panic!("expected an assembly");
        };
        assert_eq!(assembly.path(), "uploads/report.csv");
        assert_eq!(read_all(&storage, "uploads/report.csv").await, b"a,b\n");
    }

    #[tokio::test]
    async fn concurrent_final_chunks_assemble_once() {
        let (storage, service) = make_service(AssemblerConfig {
            verify_last_chunk: true,
            ..AssemblerConfig::default()
        });
        let first = RequestContext::chunk(
            chunk_params("race", "f.bin", 1, 2, 4),
            Bytes::from_static(b"ab"),
        );
        let second = RequestContext::chunk(
            chunk_params("race", "f.bin", 2, 2, 4),
            Bytes::from_static(b"cd"),
        );

        let (a, b) = tokio::join!(service.process(&first, None), service.process(&second, None));
        let assembled = [a.expect("first"), b.expect("second")]
            .into_iter()
            .filter(|outcome| {
                matches!(
                    outcome,
                    Some(Outcome::Accepted {
                        assembly: Some(Assembly::Assembled(_)),
                        ..
                    })
                )
            })
            .count();
        assert_eq!(assembled, 1);
        assert_eq!(read_all(&storage, "uploads/f.bin").await, b"abcd");
    }

    #[tokio::test]
    async fn other_methods_have_no_parameters() {
        let (_, service) = make_service(AssemblerConfig::default());
        let router = routes(service.clone());
        let request = HttpRequest::builder()
            .method(Method::PUT)
            .uri("/upload?resumableIdentifier=id1&resumableFilename=f.bin&resumableChunkNumber=1")
            .body(AxumBody::empty())
            .expect("build request");

        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut ctx = RequestContext::new(Method::DELETE);
        ctx.query = chunk_params("id1", "f.bin", 1, 10, 10);
        assert_eq!(service.process(&ctx, None).await.expect("process"), None);
    }

    #[tokio::test]
    async fn missing_or_bad_params_are_rejected() {
        let (_, service) = make_service(AssemblerConfig::default());
        let router = routes(service.clone());

        let mut params = chunk_params("id1", "f.bin", 1, 10, 10);
        params.remove("resumableChunkSize");
        let (status, _) = send(&router, multipart_request(&params, b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let params = chunk_params("../escape", "f.bin", 1, 10, 10);
        let (status, _) = send(&router, multipart_request(&params, b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut params = chunk_params("id1", "f.bin", 1, 10, 10);
        params.insert("resumableChunkNumber".into(), "0".into());
        let result = service
            .process(&RequestContext::chunk(params, Bytes::from_static(b"x")), None)
            .await;
        assert!(matches!(result, Err(UploadError::InvalidParam { .. })));
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected() {
        let (storage, service) = make_service(AssemblerConfig::default());
        let service = Arc::try_unwrap(service)
            .unwrap_or_else(|_| panic!("service is shared"))
            .with_max_chunk_size(4);
        let result = service
            .process(
                &RequestContext::chunk(
                    chunk_params("big", "f.bin", 1, 4, 8),
                    Bytes::from_static(b"too big"),
                ),
                None,
            )
            .await;
        assert!(matches!(result, Err(UploadError::ChunkTooLarge(4))));
        assert_eq!(storage.file_count().await, 0);
    }

    #[tokio::test]
    async fn zero_chunk_size_is_stored_but_never_complete() {
        let (storage, service) = make_service(AssemblerConfig::default());
        let outcome = service
            .process(
                &RequestContext::chunk(
                    chunk_params("zero", "f.bin", 1, 0, 10),
                    Bytes::from_static(b"x"),
                ),
                None,
            )
            .await
            .expect("process");
        assert_eq!(
            outcome,
            Some(Outcome::Accepted {
                stored: true,
                assembly: None
            })
        );
        assert!(storage.exists("tmp/zero/f.bin.0001").await.expect("exists"));
    }
}
