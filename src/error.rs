//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::storage::StorageError;
use crate::upload::UploadError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Conflict(String),
    PayloadTooLarge(u64),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => {
                error!(error = msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(limit) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("chunk exceeds {limit} bytes"),
            )
                .into_response(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath(path) => ApiError::BadRequest(format!("invalid path: {path}")),
            StorageError::NotFound(key) => ApiError::NotFound(format!("not found: {key}")),
            StorageError::AlreadyExists(key) => ApiError::Conflict(format!("already exists: {key}")),
            StorageError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::MissingParam(_) | UploadError::InvalidParam { .. } => {
                ApiError::BadRequest(error.to_string())
            }
            UploadError::ChunkTooLarge(limit) => ApiError::PayloadTooLarge(limit),
            UploadError::Busy(_) => ApiError::Conflict(error.to_string()),
            UploadError::Storage(err) => err.into(),
        }
    }
}
