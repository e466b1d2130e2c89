//! Registry errors.

use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Caller supplied an unusable value (empty id, non-positive TTL).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Per-user hourly creation cap reached.
    #[error("session creation limit of {limit} per hour reached for user {user_id}")]
    RateLimited { user_id: String, limit: u32 },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("registry store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl RegistryError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RegistryError::InvalidRequest(msg.into())
    }
}
