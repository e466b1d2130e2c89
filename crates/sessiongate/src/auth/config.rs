//! Token configuration.

use serde::{Deserialize, Serialize};

use crate::registry::MAX_TTL_MINUTES;

/// Minimum accepted signing secret length.
const MIN_SECRET_LEN: usize = 32;

/// Which token format new sessions receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenFormat {
    #[default]
    Signed,
    Opaque,
}

/// Token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Format used for newly issued tokens. Validation accepts both.
    pub format: TokenFormat,

    /// HS256 secret. REQUIRED when `format` is `signed`.
    /// Accepts `env:VAR_NAME` to read it from the environment.
    pub signing_secret: Option<String>,

    /// TTL applied when a caller does not pass one.
    pub default_ttl_minutes: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            format: TokenFormat::Signed,
            // No default secret - must be explicitly configured
            signing_secret: None,
            default_ttl_minutes: 60,
        }
    }
}

impl TokenConfig {
    /// Resolve the signing secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_signing_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        match &self.signing_secret {
            None => Ok(None),
            Some(value) => {
                if let Some(var_name) = value.strip_prefix("env:") {
                    match std::env::var(var_name) {
                        Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                        Ok(_) => Err(ConfigValidationError::EnvVarEmpty(var_name.to_string())),
                        Err(_) => Err(ConfigValidationError::EnvVarNotFound(var_name.to_string())),
                    }
                } else {
                    Ok(Some(value.clone()))
                }
            }
        }
    }

    /// Validate the configuration. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !(1..=MAX_TTL_MINUTES).contains(&self.default_ttl_minutes) {
            return Err(ConfigValidationError::InvalidTtl(self.default_ttl_minutes));
        }

        if self.format == TokenFormat::Signed {
            match self.resolve_signing_secret()? {
                None => return Err(ConfigValidationError::MissingSigningSecret),
                Some(secret) if secret.len() < MIN_SECRET_LEN => {
                    return Err(ConfigValidationError::SigningSecretTooShort);
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Generate a random signing secret for `config init`.
    pub fn generate_signing_secret() -> String {
        use rand::Rng;

        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const SECRET_LENGTH: usize = 64;

        let mut rng = rand::rng();
        (0..SECRET_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error(
        "signing secret is required for signed tokens. Set tokens.signing_secret (or SESSIONGATE__TOKENS__SIGNING_SECRET)."
    )]
    MissingSigningSecret,

    #[error("signing secret must be at least 32 characters long")]
    SigningSecretTooShort,

    #[error("environment variable '{0}' not found (referenced via env:{0} in config)")]
    EnvVarNotFound(String),

    #[error("environment variable '{0}' is empty (referenced via env:{0} in config)")]
    EnvVarEmpty(String),

    #[error("default_ttl_minutes must be between 1 and {max}, got {0}", max = MAX_TTL_MINUTES)]
    InvalidTtl(i64),

    #[error("store connection string is required")]
    MissingStoreUrl,

    #[error("tls.cert_path and tls.key_path must be set together")]
    IncompleteTls,

    #[error("gateway prefix must start with '/' and must not end with '/': {0:?}")]
    InvalidPrefix(String),
}
