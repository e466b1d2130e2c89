//! Sessiongate library.
//!
//! A single stable endpoint in front of many short-lived per-user backends:
//! a token registry, the gateway that proxies `{prefix}/{token}/...` to the
//! backend the token resolves to, and a session coordinator backends use to
//! obtain a URL and a port to serve on.

pub mod api;
pub mod auth;
pub mod coordinator;
pub mod db;
pub mod registry;
