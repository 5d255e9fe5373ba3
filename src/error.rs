use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("Request too large: {0}")]
    PayloadTooLarge(String),

    #[error("invalid rate limit algorithm '{0}'")]
    InvalidAlgorithm(i32),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("unable to pick a peer; pool is empty")]
    EmptyPool,

    #[error("failed to connect to peer '{address}': {reason}")]
    PeerConnect { address: String, reason: String },

    #[error("request to peer '{address}' failed: {reason}")]
    PeerRequest { address: String, reason: String },

    #[error("peer client for '{0}' is shut down")]
    PeerClosed(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("failed to listen on '{address}': {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &ThrottlerError) -> Self {
        let message = err.to_string();
        match err {
            ThrottlerError::InvalidRequest(_) | ThrottlerError::ValidationError(_) => {
                Self::new("invalid_argument", &message, 400)
            }
            ThrottlerError::OutOfRange(_) => Self::new("out_of_range", &message, 400),
            ThrottlerError::PayloadTooLarge(_) => Self::new("out_of_range", &message, 413),
            ThrottlerError::EmptyPool
            | ThrottlerError::PeerConnect { .. }
            | ThrottlerError::PeerRequest { .. }
            | ThrottlerError::PeerClosed(_) => Self::new("service_unavailable", &message, 503),
            ThrottlerError::DeadlineExceeded(_) => Self::new("deadline_exceeded", &message, 504),
            _ => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}
