//! Data-plane handlers for `{prefix}/{token}/...`.

use axum::{
    body::Body,
    extract::{FromRequestParts, Path, State, ws::WebSocketUpgrade},
    http::Request,
    response::Response,
};
use serde::Deserialize;

use super::builder::{RouteClass, forward_request, resolve_session};
use super::websocket::{is_websocket_upgrade, proxy_websocket};
use crate::api::error::ProxyError;
use crate::api::state::AppState;

/// The token segment. Other path parameters are read from the raw URI.
#[derive(Debug, Deserialize)]
pub struct TokenPath {
    pub token: String,
}

/// `{prefix}/{token}/api/{*path}`
pub async fn proxy_api(
    State(state): State<AppState>,
    Path(TokenPath { token }): Path<TokenPath>,
    req: Request<Body>,
) -> Result<Response, ProxyError> {
    proxy_http(&state, &token, RouteClass::Api, req).await
}

/// `{prefix}/{token}/static/{*name}`
pub async fn proxy_static(
    State(state): State<AppState>,
    Path(TokenPath { token }): Path<TokenPath>,
    req: Request<Body>,
) -> Result<Response, ProxyError> {
    proxy_http(&state, &token, RouteClass::Static, req).await
}

/// Everything else under the token, including WebSocket upgrades.
pub async fn proxy_default(
    State(state): State<AppState>,
    Path(TokenPath { token }): Path<TokenPath>,
    req: Request<Body>,
) -> Result<Response, ProxyError> {
    if !is_websocket_upgrade(req.headers()) {
        return proxy_http(&state, &token, RouteClass::Default, req).await;
    }

    // Same validation and resolution as HTTP, before the upgrade completes.
    let (_session, target) = resolve_session(&state, &token).await?;

    let (mut parts, _body) = req.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
        .await
        .map_err(|rejection| ProxyError::BadRequest(rejection.body_text()))?;

    proxy_websocket(&state, ws, &target, &token, &parts.uri, &parts.headers).await
}

async fn proxy_http(
    state: &AppState,
    token: &str,
    class: RouteClass,
    req: Request<Body>,
) -> Result<Response, ProxyError> {
    let (_session, target) = resolve_session(state, token).await?;
    forward_request(state, &target, token, class, req).await
}
