//! Error types for the PriorArt API

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use priorart_core::PriorArtError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Record not found: {0}")]
    RecordNotFound(i64),

    /// The request body is not a valid search request
    #[error("Invalid request body: {}", .0.body_text())]
    InvalidBody(#[from] JsonRejection),

    #[error("Invalid path: {}", .0.body_text())]
    InvalidPath(#[from] PathRejection),

    #[error(transparent)]
    Search(#[from] PriorArtError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RecordNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidBody(_) | ApiError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            ApiError::Search(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Search(PriorArtError::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Search(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::RecordNotFound(_) | ApiError::InvalidBody(_) | ApiError::InvalidPath(_) => {
                self.to_string()
            }
            ApiError::Search(e) if e.is_client_error() => e.to_string(),
            ApiError::Search(e @ PriorArtError::StoreUnavailable(_)) => {
                tracing::error!("Store error: {}", e);
                "Metadata store unavailable".to_string()
            }
            ApiError::Search(e) => {
                tracing::error!("Internal error: {}", e);
                "Internal error".to_string()
            }
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
