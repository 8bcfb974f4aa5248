use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("{language}-{version} runtime is unknown")]
    UnknownRuntime { language: String, version: String },
    #[error("requests must be of type application/json")]
    UnsupportedMediaType,
    #[error("no sandbox became available in time, retry later")]
    PoolExhausted,
    #[error("job is not in a valid state to {0}")]
    InvalidState(&'static str),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
    #[error("cleanup failed: {0}")]
    Cleanup(String),
}

impl EngineError {
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) | EngineError::UnknownRuntime { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            EngineError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::InvalidState(_)
            | EngineError::Infrastructure(_)
            | EngineError::Cleanup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for faults that are not attributable to the request itself.
    pub fn is_infrastructure(&self) -> bool {
        self.status().is_server_error()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the log.
        let message = match &self {
            EngineError::Infrastructure(_) | EngineError::Cleanup(_) => {
                "internal error while executing job".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Infrastructure(format!("{value:#}"))
    }
}
