use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Failure taxonomy shared by every stage of the pipeline.
///
/// `Provider`, `IndexUnavailable` and `Storage` are transient: the whole
/// pipeline step can be retried because vector ids are deterministic.
/// `Configuration`, `NotFound` and `InvalidInput` are surfaced as-is.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type RagResult<T> = Result<T, RagError>;

impl RagError {
    pub fn provider<E: std::fmt::Display>(err: E) -> Self {
        RagError::Provider(err.to_string())
    }

    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        RagError::Storage(err.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Configuration(_) => "configuration",
            RagError::Provider(_) => "provider",
            RagError::IndexUnavailable(_) => "index_unavailable",
            RagError::NotFound(_) => "not_found",
            RagError::InvalidInput(_) => "invalid_input",
            RagError::Storage(_) => "storage",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::Provider(_) | RagError::IndexUnavailable(_) | RagError::Storage(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RagError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RagError::Provider(_) => StatusCode::BAD_GATEWAY,
            RagError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RagError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<qdrant_client::QdrantError> for RagError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        RagError::IndexUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for RagError {
    fn from(err: sqlx::Error) -> Self {
        RagError::Storage(err.to_string())
    }
}

impl IntoResponse for RagError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_split() {
        assert!(RagError::Provider("timeout".into()).is_retryable());
        assert!(RagError::IndexUnavailable("down".into()).is_retryable());
        assert!(!RagError::Configuration("no key".into()).is_retryable());
        assert!(!RagError::NotFound("template".into()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RagError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(RagError::Provider("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RagError::IndexUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(RagError::InvalidInput("x".into()).status_code(), StatusCode::BAD_REQUEST);
    }
}
