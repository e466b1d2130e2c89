//! Token minting and signature checks.

use std::fmt;

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};

use super::claims::SessionClaims;
use super::config::{ConfigValidationError, TokenConfig, TokenFormat};
use super::error::{AuthError, InvalidReason};

/// Opaque token length. nanoid's alphabet never produces a '.'.
const OPAQUE_TOKEN_LEN: usize = 32;

/// Shape of a presented token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Signed,
    Opaque,
}

impl TokenKind {
    /// Three non-empty dot-separated segments means a signed token.
    pub fn sniff(token: &str) -> Self {
        let mut segments = token.split('.');
        let well_formed = (0..3).all(|_| segments.next().is_some_and(|s| !s.is_empty()))
            && segments.next().is_none();
        if well_formed {
            TokenKind::Signed
        } else {
            TokenKind::Opaque
        }
    }
}

/// Shorten a token for logs.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

/// Issues new tokens and checks signatures on presented ones.
#[derive(Clone)]
pub struct TokenIssuer {
    format: TokenFormat,
    keys: Option<(EncodingKey, DecodingKey)>,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("format", &self.format)
            .field("has_secret", &self.keys.is_some())
            .finish()
    }
}

impl TokenIssuer {
    /// Build from validated configuration.
    pub fn from_config(config: &TokenConfig) -> Result<Self, ConfigValidationError> {
        config.validate()?;
        let secret = config.resolve_signing_secret()?;
        Ok(Self {
            format: config.format,
            keys: secret.map(|s| keys_for(&s)),
        })
    }

    /// Issuer minting signed tokens.
    pub fn signed(secret: &str) -> Self {
        Self {
            format: TokenFormat::Signed,
            keys: Some(keys_for(secret)),
        }
    }

    /// Issuer minting opaque tokens. Signed tokens presented to it never verify.
    pub fn opaque() -> Self {
        Self {
            format: TokenFormat::Opaque,
            keys: None,
        }
    }

    pub fn format(&self) -> TokenFormat {
        self.format
    }

    /// Mint a token for the given claims.
    pub fn issue(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        match (self.format, &self.keys) {
            (TokenFormat::Opaque, _) => Ok(nanoid::nanoid!(OPAQUE_TOKEN_LEN)),
            (TokenFormat::Signed, Some((encoding, _))) => {
                encode(&Header::new(Algorithm::HS256), claims, encoding)
                    .map_err(|e| AuthError::Signing(e.to_string()))
            }
            (TokenFormat::Signed, None) => {
                Err(AuthError::Signing("no signing secret configured".to_string()))
            }
        }
    }

    /// Check the signature of a signed token and return its claims.
    ///
    /// The embedded `exp` is not enforced here; expiry is decided by the
    /// registry record, which extensions move forward.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, InvalidReason> {
        let Some((_, decoding)) = &self.keys else {
            return Err(InvalidReason::BadSignature);
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["sub", "exp"]);

        decode::<SessionClaims>(token, decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => InvalidReason::Expired,
                _ => InvalidReason::BadSignature,
            })
    }
}

fn keys_for(secret: &str) -> (EncodingKey, DecodingKey) {
    (
        EncodingKey::from_secret(secret.as_bytes()),
        DecodingKey::from_secret(secret.as_bytes()),
    )
}
