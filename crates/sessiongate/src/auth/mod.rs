//! Session tokens.
//!
//! Two token formats are accepted everywhere:
//! - signed compact tokens (HS256 JWT carrying user, server and session ids)
//! - opaque random strings
//!
//! The validator sniffs the format, so a registry can hold a mix of both.

mod claims;
mod config;
mod error;
mod token;

pub use claims::SessionClaims;
pub use config::{ConfigValidationError, TokenConfig, TokenFormat};
pub use error::{AuthError, InvalidReason};
pub use token::{TokenIssuer, TokenKind, redact};
