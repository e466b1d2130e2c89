//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response, header},
};
use serde_json::Value;
use sessiongate::api::{self, AppState, GatewaySettings};
use sessiongate::auth::TokenIssuer;
use sessiongate::db::Database;
use sessiongate::registry::{RegistrySettings, SqliteRegistryStore, TokenRegistry};
use tokio::net::TcpListener;

pub const TEST_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";

/// Registry over a fresh in-memory SQLite store.
pub async fn test_registry(settings: RegistrySettings) -> TokenRegistry {
    let db = Database::in_memory().await.expect("in-memory database");
    let store = SqliteRegistryStore::new(&db, "test");
    TokenRegistry::new(Arc::new(store), TokenIssuer::signed(TEST_SECRET), settings)
}

pub async fn test_state() -> AppState {
    test_state_with(RegistrySettings::default(), GatewaySettings::default()).await
}

pub async fn test_state_with(registry: RegistrySettings, gateway: GatewaySettings) -> AppState {
    AppState::new(test_registry(registry).await, gateway)
}

pub async fn test_app() -> (Router, AppState) {
    let state = test_state().await;
    (api::create_router(state.clone()), state)
}

pub fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

pub async fn read_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Serve `app` on an ephemeral localhost port.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Serve the gateway for `state` on an ephemeral port.
pub async fn spawn_gateway(state: AppState) -> SocketAddr {
    spawn_server(api::create_router(state)).await
}

/// A localhost port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
