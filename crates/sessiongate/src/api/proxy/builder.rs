//! Proxy target resolution and request forwarding.
//!
//! Shared by every data-plane route:
//! - token validation and backend resolution
//! - backend path and query construction
//! - request forwarding with body limits and read deadlines
//! - HTML rewriting on the default route

use std::io;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, header},
};
use futures::StreamExt;
use http_body_util::{BodyExt, Limited};
use log::{debug, warn};
use tokio::time::Instant;
use sessiongate_protocol::{RouteTarget, TOKEN_QUERY_PARAM};

use super::rewrite::{is_html, rewrite_static_links};
use crate::api::error::ProxyError;
use crate::api::state::AppState;
use crate::auth::{AuthError, redact};
use crate::registry::EphemeralSession;

/// Route classes with their own forwarding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// `.../api/*`: verbatim both ways, `/api` stripped.
    Api,
    /// `.../static/*`: passthrough.
    Static,
    /// Everything else: HTML rewritten, WebSocket upgrades relayed.
    Default,
}

impl RouteClass {
    fn rewrites_html(self) -> bool {
        self == RouteClass::Default
    }
}

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

// ============================================================================
// Session Resolution
// ============================================================================

/// Validate the token and resolve where its traffic goes.
///
/// Nothing is dialed unless this succeeds. The target comes only from the
/// stored descriptor.
pub async fn resolve_session(
    state: &AppState,
    token: &str,
) -> Result<(EphemeralSession, RouteTarget), ProxyError> {
    let session = state
        .registry
        .validate_token(token)
        .await?
        .ok_or(ProxyError::Auth(AuthError::InvalidToken))?;

    let target = session
        .backend
        .route_target()
        .map_err(ProxyError::Unroutable)?;

    Ok((session, target))
}

// ============================================================================
// Path and Query
// ============================================================================

/// Backend-relative path: `{prefix}/{token}` removed, plus `/api` for the
/// API class.
pub fn backend_path(raw_path: &str, prefix: &str, token: &str, class: RouteClass) -> String {
    let scoped = format!("{}/{}", prefix, token);
    let rest = raw_path.strip_prefix(scoped.as_str()).unwrap_or(raw_path);
    let rest = match class {
        RouteClass::Api => rest.strip_prefix("/api").unwrap_or(rest),
        RouteClass::Static | RouteClass::Default => rest,
    };

    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

/// Query string with the token set as `token=...`, replacing any existing one.
pub fn build_backend_query(query: Option<&str>, token: &str) -> String {
    let mut pairs: Vec<String> = Vec::new();
    if let Some(query) = query {
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let name = pair.split('=').next().unwrap_or(pair);
            if name == TOKEN_QUERY_PARAM {
                continue;
            }
            pairs.push(pair.to_string());
        }
    }
    pairs.push(format!(
        "{}={}",
        TOKEN_QUERY_PARAM,
        urlencoding::encode(token)
    ));
    pairs.join("&")
}

/// Path and query as sent to the backend.
pub fn backend_path_and_query(uri: &Uri, prefix: &str, token: &str, class: RouteClass) -> String {
    format!(
        "{}?{}",
        backend_path(uri.path(), prefix, token, class),
        build_backend_query(uri.query(), token)
    )
}

/// Absolute URI for the backend.
pub fn target_uri(target: &RouteTarget, path_and_query: &str) -> Result<Uri, ProxyError> {
    match target {
        RouteTarget::Tcp { host, port } => {
            let uri = format!("http://{}:{}{}", authority_host(host), port, path_and_query);
            uri.parse()
                .map_err(|e| ProxyError::Internal(format!("invalid target URI {}: {}", uri, e)))
        }
        RouteTarget::Unix { socket_path } => {
            Ok(hyperlocal::Uri::new(socket_path, path_and_query).into())
        }
    }
}

/// Bracket bare IPv6 literals.
fn authority_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn host_header(target: &RouteTarget) -> String {
    match target {
        RouteTarget::Tcp { host, port } => format!("{}:{}", authority_host(host), port),
        RouteTarget::Unix { .. } => "localhost".to_string(),
    }
}

// ============================================================================
// Body Limit Enforcement
// ============================================================================

/// Enforce a body size limit based on the Content-Length header.
pub fn enforce_proxy_body_limit(headers: &HeaderMap, max_body_bytes: usize) -> Result<(), ProxyError> {
    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or_else(|| ProxyError::BadRequest("invalid Content-Length".to_string()))?;
        if length > max_body_bytes {
            return Err(ProxyError::PayloadTooLarge(max_body_bytes));
        }
    }
    Ok(())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

// ============================================================================
// HTTP Proxy Core
// ============================================================================

/// Forward a request to the resolved target and relay the response.
pub async fn forward_request(
    state: &AppState,
    target: &RouteTarget,
    token: &str,
    class: RouteClass,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let settings = &state.settings;
    let path_and_query = backend_path_and_query(req.uri(), &settings.prefix, token, class);
    let uri = target_uri(target, &path_and_query)?;

    let (parts, body) = req.into_parts();

    enforce_proxy_body_limit(&parts.headers, settings.max_body_bytes)?;
    let body_bytes = axum::body::to_bytes(body, settings.max_body_bytes)
        .await
        .map_err(|e| {
            if e.to_string().contains("length limit") {
                return ProxyError::PayloadTooLarge(settings.max_body_bytes);
            }
            ProxyError::BadRequest(format!("reading request body: {}", e))
        })?;

    let mut forwarded = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Body::from(body_bytes.clone()))
        .map_err(|e| ProxyError::Internal(format!("building proxy request: {}", e)))?;

    let headers = forwarded.headers_mut();
    *headers = parts.headers;
    strip_hop_by_hop(headers);
    headers.remove(header::UPGRADE);
    // Body was buffered, so the length is exact.
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_bytes.len()));
    if class.rewrites_html() {
        // HTML must arrive uncompressed to be rewritten.
        headers.remove(header::ACCEPT_ENCODING);
    }
    headers.insert(
        header::HOST,
        HeaderValue::from_str(&host_header(target))
            .map_err(|e| ProxyError::Internal(format!("invalid Host header: {}", e)))?,
    );
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ProxyError::Auth(AuthError::InvalidToken))?,
    );

    debug!(
        "Proxying {} {} (token {}) to {:?}",
        forwarded.method(),
        path_and_query.split('?').next().unwrap_or("/"),
        redact(token),
        target
    );

    let deadline = Instant::now() + settings.request_timeout;
    let result = match target {
        RouteTarget::Tcp { .. } => {
            tokio::time::timeout_at(deadline, state.http_client.request(forwarded)).await
        }
        RouteTarget::Unix { .. } => {
            tokio::time::timeout_at(deadline, state.unix_client.request(forwarded)).await
        }
    };

    let response = match result {
        Err(_) => return Err(ProxyError::Timeout),
        Ok(Err(e)) => {
            return Err(ProxyError::Unreachable(format!("{:?}: {}", target, e)));
        }
        Ok(Ok(response)) => response,
    };

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let encoded = parts.headers.contains_key(header::CONTENT_ENCODING);

    if !(class.rewrites_html() && is_html(content_type) && !encoded) {
        let body = match class {
            RouteClass::Api | RouteClass::Static => {
                with_read_timeout(Body::new(body), settings.request_timeout)
            }
            // Long-lived streams (event streams, downloads) are not cut off.
            RouteClass::Default => Body::new(body),
        };
        return Ok(Response::from_parts(parts, body));
    }

    // The rewrite needs the whole page before anything is sent, so the page
    // must arrive within what is left of the request budget.
    let collect = Limited::new(body, settings.max_body_bytes).collect();
    let html = tokio::time::timeout_at(deadline, collect)
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(|e| ProxyError::Unreachable(format!("reading HTML from {:?}: {}", target, e)))?
        .to_bytes();

    // Stale after rewriting.
    parts.headers.remove(header::CONTENT_LENGTH);

    let body = match std::str::from_utf8(&html) {
        Ok(text) => Body::from(rewrite_static_links(text, &settings.prefix, token)),
        Err(_) => Body::from(html),
    };
    Ok(Response::from_parts(parts, body))
}

/// Pass `body` through, failing the stream when the backend sends nothing
/// for `idle`. The client sees a truncated response instead of a hang.
fn with_read_timeout(body: Body, idle: Duration) -> Body {
    let frames = body.into_data_stream();
    Body::from_stream(futures::stream::unfold(Some(frames), move |frames| async move {
        let mut frames = frames?;
        match tokio::time::timeout(idle, frames.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(frames))),
            Ok(None) => None,
            Err(_) => {
                warn!("Backend response stalled for {:?}; aborting body", idle);
                let stalled = io::Error::new(io::ErrorKind::TimedOut, "backend stopped sending");
                Some((Err(axum::Error::new(stalled)), None))
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_class_strips_prefix_token_and_api() {
        assert_eq!(backend_path("/s/tok/api/x", "/s", "tok", RouteClass::Api), "/x");
        assert_eq!(
            backend_path("/s/tok/api/items/1", "/s", "tok", RouteClass::Api),
            "/items/1"
        );
    }

    #[test]
    fn static_and_default_keep_their_path() {
        assert_eq!(
            backend_path("/s/tok/static/a.css", "/s", "tok", RouteClass::Static),
            "/static/a.css"
        );
        assert_eq!(
            backend_path("/s/tok/index.html", "/s", "tok", RouteClass::Default),
            "/index.html"
        );
        assert_eq!(backend_path("/s/tok", "/s", "tok", RouteClass::Default), "/");
        assert_eq!(backend_path("/s/tok/", "/s", "tok", RouteClass::Default), "/");
    }

    #[test]
    fn query_replaces_existing_token() {
        assert_eq!(build_backend_query(None, "abc"), "token=abc");
        assert_eq!(
            build_backend_query(Some("a=1&token=old&tokenish=2"), "abc"),
            "a=1&tokenish=2&token=abc"
        );
    }

    #[test]
    fn query_encodes_token() {
        assert_eq!(build_backend_query(None, "a b"), "token=a%20b");
    }

    #[test]
    fn tcp_target_uri() {
        let target = RouteTarget::Tcp {
            host: "127.0.0.1".into(),
            port: 8600,
        };
        let uri = target_uri(&target, "/x?token=t").unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:8600/x?token=t");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let target = RouteTarget::Tcp {
            host: "::1".into(),
            port: 9000,
        };
        assert_eq!(
            target_uri(&target, "/").unwrap().to_string(),
            "http://[::1]:9000/"
        );
        assert_eq!(host_header(&target), "[::1]:9000");
    }

    fn stalling_body(head: &'static [u8]) -> Body {
        let head = futures::stream::once(async move {
            Ok::<_, io::Error>(axum::body::Bytes::from_static(head))
        });
        Body::from_stream(head.chain(futures::stream::pending()))
    }

    #[tokio::test]
    async fn read_timeout_ends_a_stalled_body() {
        let body = with_read_timeout(stalling_body(b"partial"), Duration::from_millis(50));
        let read = tokio::time::timeout(Duration::from_secs(5), axum::body::to_bytes(body, 1024))
            .await
            .expect("stalled body must not hang");
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn read_timeout_passes_complete_bodies() {
        let body = with_read_timeout(Body::from("complete"), Duration::from_millis(50));
        let bytes = axum::body::to_bytes(body, 1024).await.unwrap();
        assert_eq!(&bytes[..], b"complete");
    }

    #[test]
    fn body_limit_checks_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("128"));
        assert!(matches!(
            enforce_proxy_body_limit(&headers, 64),
            Err(ProxyError::PayloadTooLarge(64))
        ));
        assert!(enforce_proxy_body_limit(&headers, 256).is_ok());

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert!(matches!(
            enforce_proxy_body_limit(&headers, 64),
            Err(ProxyError::BadRequest(_))
        ));
    }
}
