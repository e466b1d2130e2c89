//! Token-addressed reverse proxy.
//!
//! Three route classes share one pipeline (validate, resolve, strip, forward)
//! and differ only in response handling:
//! - `api`: verbatim
//! - `static`: passthrough
//! - default: HTML asset links rewritten, WebSocket upgrades relayed

pub mod builder;
mod handlers;
pub mod rewrite;
pub mod websocket;

pub use handlers::{proxy_api, proxy_default, proxy_static};
