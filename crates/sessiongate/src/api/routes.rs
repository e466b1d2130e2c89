//! API route definitions.

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{any, delete, get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::proxy;
use super::state::AppState;

/// Create the gateway router: control plane at the root, data plane under
/// the configured prefix.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.settings.allowed_origins);
    let max_body_size = state.settings.max_body_bytes;
    let prefix = state.settings.prefix.clone();

    // Tracing layer with request IDs and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let control_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/create-session", post(handlers::create_session))
        .route("/revoke-session", post(handlers::revoke_session))
        .route("/register-server", post(handlers::register_server))
        .route(
            "/register-server/{server_name}",
            delete(handlers::unregister_server),
        )
        .route(
            "/discover-server/{server_name}",
            get(handlers::discover_server),
        )
        .route("/heartbeat/{server_name}", post(handlers::heartbeat))
        .route("/sessions/{user_id}", get(handlers::list_user_sessions));

    let data_routes = Router::new()
        .route(
            &format!("{}/{{token}}/api/{{*path}}", prefix),
            any(proxy::proxy_api),
        )
        .route(
            &format!("{}/{{token}}/static/{{*name}}", prefix),
            any(proxy::proxy_static),
        )
        .route(
            &format!("{}/{{token}}/{{*path}}", prefix),
            any(proxy::proxy_default),
        )
        .route(&format!("{}/{{token}}/", prefix), any(proxy::proxy_default))
        .route(&format!("{}/{{token}}", prefix), any(proxy::proxy_default));

    control_routes
        .merge(data_routes)
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::PATCH,
        Method::OPTIONS,
    ];

    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::COOKIE,
    ];

    if allowed_origins.is_empty() {
        // Same-origin only.
        return CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")));
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::error!("CORS: All configured origins are invalid!");
        CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
    } else {
        tracing::info!("CORS: Allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}
