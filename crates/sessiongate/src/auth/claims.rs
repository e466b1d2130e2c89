//! Claims embedded in signed session tokens.

use serde::{Deserialize, Serialize};

/// JWT claims for a session token.
///
/// `exp` records the expiry at issue time. The registry's stored expiry is
/// authoritative because sessions can be extended after the token is minted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User ID.
    pub sub: String,
    /// Logical server name.
    pub srv: String,
    /// Session ID.
    pub sid: String,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expiry at issue time (Unix seconds).
    pub exp: i64,
}

impl SessionClaims {
    pub fn new(
        user_id: impl Into<String>,
        server_name: impl Into<String>,
        session_id: impl Into<String>,
        iat: i64,
        exp: i64,
    ) -> Self {
        Self {
            sub: user_id.into(),
            srv: server_name.into(),
            sid: session_id.into(),
            iat,
            exp,
        }
    }
}
