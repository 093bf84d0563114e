use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("mask has no pixel set for the requested class")]
    EmptyMask,
    #[error("image fetch failed: {0}")]
    Fetch(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn load(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        ServiceError::Load(format!("{}: {reason}", path.display()))
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidInput(_) | ServiceError::NotFound(_)
        )
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Fetch(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Load(_)
            | ServiceError::EmptyMask
            | ServiceError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
