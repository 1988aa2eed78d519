use crate::audit::AuditError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failure kinds surfaced by backends and the storage service.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("file size {size} bytes exceeds the {max_mb} MB limit")]
    FileTooLarge { size: u64, max_mb: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("storage backend `{0}` is not implemented")]
    BackendNotImplemented(String),
    #[error("unsupported storage backend `{0}`")]
    UnsupportedBackend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("audit ledger: {0}")]
    Audit(#[from] AuditError),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Business error code carried in the response envelope.
    pub fn code(&self) -> i64 {
        match self {
            StorageError::BadRequest(_) => -400,
            StorageError::Forbidden(_) => -403,
            StorageError::NotFound(_) => -404,
            StorageError::FileTooLarge { .. } => -413,
            StorageError::BackendNotImplemented(_) | StorageError::UnsupportedBackend(_) => -501,
            StorageError::BackendUnavailable(_) => -502,
            StorageError::Io(_) | StorageError::Audit(_) => -500,
        }
    }
}

/// An error rendered as the `{code, msg, data}` envelope.
///
/// Business errors travel with HTTP 200 and a non-zero code; `status` is only
/// used by the backend-facing blob endpoint.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: i64,
    pub message: String,
}

impl AppError {
    pub fn new(code: i64, msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            code,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(-400, msg)
    }

    /// Use a real HTTP status instead of the 200 envelope.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "msg": self.message,
            "data": null,
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        if let StorageError::BackendUnavailable(_) | StorageError::Io(_) | StorageError::Audit(_) =
            &err
        {
            tracing::error!(error = %err, "storage request failed");
        }
        AppError::new(err.code(), err.to_string())
    }
}
