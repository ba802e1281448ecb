use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum MutatorError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Test run {0} not found")]
    RunNotFound(i64),

    #[error("Test run {run_id} has no result for request {request_hash}")]
    ResultNotFound { run_id: i64, request_hash: String },

    #[error("Test run {id} is in state {state}: {reason}")]
    InvalidState {
        id: i64,
        state: String,
        reason: String,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not persist test result: {0}")]
    Persistence(String),

    #[error("Execution queue stalled: {0}")]
    QueueStalled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for MutatorError {
    fn from(e: anyhow::Error) -> Self {
        MutatorError::Other(format!("{:#}", e))
    }
}

impl IntoResponse for MutatorError {
    fn into_response(self) -> Response {
        let status = match &self {
            MutatorError::RunNotFound(_) => StatusCode::NOT_FOUND,
            MutatorError::ResultNotFound { .. } => StatusCode::NOT_FOUND,
            MutatorError::InvalidState { .. } => StatusCode::BAD_REQUEST,
            MutatorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MutatorError::Serialization(_) => StatusCode::BAD_REQUEST,
            MutatorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MutatorError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MutatorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MutatorError::QueueStalled(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MutatorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MutatorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
