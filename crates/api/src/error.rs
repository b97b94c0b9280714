//! Error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use stowage_core::{StorageError, UploadError};
use stowage_shared::AppError;
use tracing::error;

/// An [`AppError`] rendered as `{ "error": code, "message": msg }`.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        let app = match err {
            UploadError::Parse(msg) => AppError::Validation(msg),
            UploadError::PostTooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            UploadError::NoTransports | UploadError::InvalidPolicy(_) => {
                AppError::Configuration(err.to_string())
            }
        };
        Self(app)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let app = match err {
            StorageError::NotFound { .. } => AppError::NotFound("File not found".to_string()),
            StorageError::InvalidKey(_) => AppError::Validation("File name invalid".to_string()),
            StorageError::Configuration(msg) => AppError::Configuration(msg),
            other if other.is_not_found() => AppError::NotFound("File not found".to_string()),
            other => AppError::Storage(other.to_string()),
        };
        Self(app)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(json!({
                "error": self.0.error_code(),
                "message": self.0.message(),
            })),
        )
            .into_response()
    }
}
