//! Service Error Taxonomy
//!
//! One error type for the HTTP surface with a fixed status mapping. Client
//! responses carry a short JSON message and never disclose identifiers
//! beyond the caller's own. Pipeline-internal failures (inference, storage,
//! database) are handled where they occur and only reach this type when an
//! endpoint itself fails.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("access denied")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("evidence storage failed: {0}")]
    Storage(#[from] std::io::Error),
    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{0} deadline exceeded")]
    Timeout(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::ModelLoad(_)
            | Self::Inference(_)
            | Self::Storage(_)
            | Self::Database(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller
    fn public_message(&self) -> String {
        match self {
            Self::Unauthenticated
            | Self::Forbidden
            | Self::BadRequest(_)
            | Self::NotFound(_)
            | Self::Timeout(_) => self.to_string(),
            // internal detail stays in the logs
            _ => "internal error".to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServiceError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServiceError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ServiceError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::NotFound("stream").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::Timeout("signaling").status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServiceError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_detail_is_not_public() {
        let err = ServiceError::Internal("secret stream abc".into());
        assert_eq!(err.public_message(), "internal error");
        let err = ServiceError::NotFound("stream");
        assert_eq!(err.public_message(), "stream not found");
    }
}
