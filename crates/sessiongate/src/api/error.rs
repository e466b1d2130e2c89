//! API error handling with structured responses.

use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use sessiongate_protocol::{ErrorBody, GATEWAY_ERROR_HEADER, RoutingError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::auth::AuthError;
use crate::registry::RegistryError;

/// Control-plane error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Too many requests: {0}")]
    RateLimited(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::RateLimited(_) => "rate_limited",
            Self::ServiceUnavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorBody {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            RegistryError::RateLimited { .. } => ApiError::RateLimited(err.to_string()),
            RegistryError::Auth(e) => ApiError::Internal(e.to_string()),
            RegistryError::Store(e) => ApiError::ServiceUnavailable(format!("{:#}", e)),
        }
    }
}

/// Result type for control-plane handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Data-plane error. Every variant terminates the response with a JSON body
/// and the gateway error header.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Descriptor cannot be dialed (gateway variant or missing fields).
    #[error("session backend is not routable")]
    Unroutable(RoutingError),

    /// Token valid, backend refused or dropped the connection.
    #[error("backend unreachable")]
    Unreachable(String),

    /// Token valid, backend did not answer in time.
    #[error("backend timed out")]
    Timeout,

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Registry lookup failed; the token may well be valid.
    #[error("session registry unavailable")]
    Registry(String),

    #[error("internal proxy error")]
    Internal(String),
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(AuthError::Signing(_)) => "internal_error",
            Self::Auth(_) => "invalid_token",
            Self::Unroutable(_) => "backend_unroutable",
            Self::Unreachable(_) => "backend_unreachable",
            Self::Timeout => "backend_timeout",
            Self::PayloadTooLarge(_) | Self::BadRequest(_) => "bad_request",
            Self::Registry(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::Signing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Unroutable(_) | Self::Unreachable(_) | Self::Timeout => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RegistryError> for ProxyError {
    fn from(err: RegistryError) -> Self {
        ProxyError::Registry(err.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Details stay in the log; the client only sees the generic message.
        match &self {
            ProxyError::Unroutable(reason) => {
                warn!(error_code = code, reason = ?reason, "Unroutable session backend");
            }
            ProxyError::Unreachable(detail) => {
                warn!(error_code = code, detail = %detail, "Backend unreachable");
            }
            ProxyError::Registry(detail) | ProxyError::Internal(detail) => {
                error!(error_code = code, detail = %detail, "Proxy error");
            }
            _ => {
                debug!(error_code = code, message = %self, "Proxy request rejected");
            }
        }

        let body = ErrorBody {
            error: self.to_string(),
            code: code.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(GATEWAY_ERROR_HEADER, HeaderValue::from_static(code));
        response
    }
}
