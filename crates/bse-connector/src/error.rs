//! Error types for the connector service.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bse_cache::CacheError;

use crate::exit_codes;

/// Upstream fetch failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// No response within the configured timeout.
    #[error("upstream timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Connection could not be established.
    #[error("upstream unreachable: {message}")]
    Unreachable { message: String },

    /// Upstream has no such resource.
    #[error("upstream resource not found: {path}")]
    NotFound { path: String },

    /// Upstream asked us to slow down.
    #[error("upstream rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other non-success status.
    #[error("upstream returned status {status}")]
    Status { status: u16 },

    /// Body could not be read or was malformed.
    #[error("invalid upstream response: {message}")]
    InvalidResponse { message: String },
}

impl UpstreamError {
    /// Whether an automatic retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Unreachable { .. } | Self::RateLimited { .. } => true,
            Self::Status { status } => *status >= 500,
            Self::NotFound { .. } | Self::InvalidResponse { .. } => false,
        }
    }

    /// Status returned to our client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Unreachable { .. } | Self::InvalidResponse { .. } => StatusCode::BAD_GATEWAY,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Status { status } => match StatusCode::from_u16(*status) {
                Ok(code) if code.is_client_error() => code,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

/// Connector errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Configuration is unusable. Fatal at startup.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("storage error: {0}")]
    Storage(#[from] CacheError),

    /// The request cannot be forwarded as asked.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// No upstream fetch slot became free in time.
    #[error("overloaded: no upstream fetch slot within {waited:?}")]
    Overloaded { waited: Duration },

    /// The shutdown grace period expired while the request was running.
    #[error("shutdown timeout")]
    ShutdownTimeout,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ConnectorError {
    /// Process exit code when this error ends the service.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_codes::CONFIG_ERROR,
            _ => exit_codes::FATAL,
        }
    }

    /// HTTP status when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upstream(e) => e.status_code(),
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Overloaded { .. } | Self::ShutdownTimeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config { .. } | Self::Storage(_) | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ConnectorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (
            status,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response();

        if let Self::Upstream(UpstreamError::RateLimited {
            retry_after: Some(after),
        }) = &self
        {
            if let Ok(value) = after.as_secs().max(1).to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
