//! Control-plane handlers.
//!
//! Unauthenticated; the control plane is expected to be reachable only from
//! trusted networks.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use sessiongate_protocol::{
    CreateSessionRequest, CreateSessionResponse, DiscoverServerResponse, HealthResponse,
    RegisterServerRequest, RegisterServerResponse, RemoveServerResponse, RevokeSessionRequest,
    RevokeSessionResponse, SessionSummary, StatsResponse,
};
use tracing::{info, instrument};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::registry::NewSession;

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let draining = state.is_draining();
    Json(HealthResponse {
        status: if draining { "draining" } else { "ok" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        draining,
    })
}

/// `POST /create-session`: reuse the live session for the composite key or
/// create one. 201 when created, 200 when reused.
#[instrument(skip(state, body))]
pub async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    if state.is_draining() {
        return Err(ApiError::service_unavailable(
            "gateway is shutting down; not accepting new sessions",
        ));
    }

    let request = json_body(body)?;
    let (session, reused) = state
        .registry
        .find_or_create_session(NewSession::from(request))
        .await?;

    let status = if reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(CreateSessionResponse {
            token: session.token,
            expires_at: session.expires_at,
            session_id: session.session_id,
            reused,
        }),
    ))
}

/// `POST /revoke-session`
pub async fn revoke_session(
    State(state): State<AppState>,
    body: Result<Json<RevokeSessionRequest>, JsonRejection>,
) -> ApiResult<Json<RevokeSessionResponse>> {
    let request = json_body(body)?;
    let revoked = state.registry.revoke_session(&request.token).await?;
    Ok(Json(RevokeSessionResponse { revoked }))
}

/// `POST /register-server`
#[instrument(skip(state, body))]
pub async fn register_server(
    State(state): State<AppState>,
    body: Result<Json<RegisterServerRequest>, JsonRejection>,
) -> ApiResult<Json<RegisterServerResponse>> {
    let request = json_body(body)?;
    let server = state
        .registry
        .register_server(&request.server_name, request.backend, request.metadata)
        .await?;

    info!(server = %server.server_name, backend = %server.backend, "Server registered");

    Ok(Json(RegisterServerResponse {
        server_name: server.server_name,
        registered_at: server.registered_at,
    }))
}

/// `DELETE /register-server/{server_name}`
pub async fn unregister_server(
    State(state): State<AppState>,
    Path(server_name): Path<String>,
) -> ApiResult<Json<RemoveServerResponse>> {
    let removed = state.registry.unregister_server(&server_name).await?;
    Ok(Json(RemoveServerResponse { removed }))
}

/// `GET /discover-server/{server_name}`
pub async fn discover_server(
    State(state): State<AppState>,
    Path(server_name): Path<String>,
) -> ApiResult<Json<DiscoverServerResponse>> {
    let server = state
        .registry
        .get_registered_server(&server_name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("server {}", server_name)))?;

    Ok(Json(DiscoverServerResponse {
        backend: server.backend,
        metadata: server.metadata,
        registered_at: server.registered_at,
    }))
}

/// `POST /heartbeat/{server_name}`: 204, or 404 when not registered.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(server_name): Path<String>,
) -> ApiResult<StatusCode> {
    if state.registry.update_server_heartbeat(&server_name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("server {}", server_name)))
    }
}

/// `GET /sessions/{user_id}`
pub async fn list_user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let sessions = state.registry.get_user_sessions(&user_id).await?;
    Ok(Json(sessions.iter().map(|s| s.summary()).collect()))
}

/// `GET /stats`
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    Ok(Json(state.registry.get_stats().await?))
}

/// Fallback for unknown control-plane paths.
pub async fn not_found() -> ApiError {
    ApiError::not_found("no such route")
}
