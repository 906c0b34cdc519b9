//! Shared `AppError` taxonomy (spec §4.N / §7): one enum with an HTTP status
//! and a machine-readable code, used uniformly by the API and the proxy.
//! Lower layers (DB, Redis, Runtime) convert into this at the boundary; the
//! original cause is logged via `tracing::error!` and never leaks into the
//! response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    WorkspaceNotFound,
    InvalidState,
    TooManyRequests,
    UpstreamUnavailable,
    InternalError,
}

impl ErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::WorkspaceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidState => StatusCode::CONFLICT,
            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    code: ErrorCode,
    message: String,
    retry_after_secs: Option<u64>,
}

impl AppError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), retry_after_secs: None }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn workspace_not_found() -> Self {
        Self::new(ErrorCode::WorkspaceNotFound, "workspace not found")
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn too_many_requests(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self {
            code: ErrorCode::TooManyRequests,
            message: message.into(),
            retry_after_secs: Some(retry_after_secs),
        }
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
            }
        }));
        let mut response = (self.code.status(), body).into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert("Retry-After", secs.to_string().parse().expect("digits are valid header value"));
        }
        response
    }
}

impl From<codehub_core::CoreError> for AppError {
    fn from(err: codehub_core::CoreError) -> Self {
        tracing::error!(error = %err, "core operation failed");
        match err {
            codehub_core::CoreError::CircuitOpen { service, retry_after_secs } => {
                AppError::upstream_unavailable(format!("{service} unavailable, retry shortly"))
                    .with_retry_after(retry_after_secs.ceil() as u64)
            }
            codehub_core::CoreError::InvalidState(msg) => AppError::invalid_state(msg),
            _ => AppError::internal("internal error"),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database operation failed");
        AppError::internal("internal error")
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!(error = %err, "redis operation failed");
        AppError::internal("internal error")
    }
}

impl AppError {
    fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }
}
