//! Token errors.

use std::fmt;

use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use sessiongate_protocol::{ErrorBody, GATEWAY_ERROR_HEADER};
use thiserror::Error;

/// Why a token was rejected. Logged, never returned to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    NotFound,
    Expired,
    BadSignature,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::NotFound => write!(f, "not_found"),
            InvalidReason::Expired => write!(f, "expired"),
            InvalidReason::BadSignature => write!(f, "bad_signature"),
        }
    }
}

/// Token errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token in the request path.
    #[error("missing session token")]
    MissingToken,

    /// Token not found, expired or forged. Deliberately uninformative.
    #[error("invalid or expired session token")]
    InvalidToken,

    /// Token could not be minted.
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AuthError::MissingToken | AuthError::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "invalid_token")
            }
            AuthError::Signing(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(ErrorBody {
            error: self.to_string(),
            code: code.to_string(),
        });

        let mut response = (status, body).into_response();
        response
            .headers_mut()
            .insert(GATEWAY_ERROR_HEADER, HeaderValue::from_static(code));
        response
    }
}
