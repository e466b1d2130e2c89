//! Control-plane integration tests.

use axum::http::{Method, Request, StatusCode};
use axum::body::Body;
use serde_json::{Value, json};
use sessiongate::api::{self, GatewaySettings};
use sessiongate::registry::RegistrySettings;
use tower::ServiceExt;

mod common;
use common::{get, json_request, read_json, test_app, test_state_with};

fn create_body(user: &str, server: &str) -> Value {
    json!({
        "userId": user,
        "serverName": server,
        "backend": {"type": "tcp", "host": "127.0.0.1", "port": 8600}
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state) = test_app().await;

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = read_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["draining"], false);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_create_session_then_reuse() {
    let (app, _state) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            create_body("u1", "todo"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let first = read_json(response).await;
    assert!(first["token"].is_string());
    assert!(first["expiresAt"].is_string());
    assert_eq!(first["reused"], false);

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            create_body("u1", "todo"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second = read_json(response).await;
    assert_eq!(second["token"], first["token"]);
    assert_eq!(second["reused"], true);
}

#[tokio::test]
async fn test_created_token_validates_to_same_identity() {
    let (app, state) = test_app().await;

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            create_body("u7", "notes"),
        ))
        .await
        .unwrap();
    let created = read_json(response).await;
    let token = created["token"].as_str().unwrap();

    let session = state.registry.validate_token(token).await.unwrap().unwrap();
    assert_eq!(session.user_id, "u7");
    assert_eq!(session.server_name, "notes");
}

#[tokio::test]
async fn test_create_session_missing_backend_is_bad_request() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            json!({"userId": "u1", "serverName": "todo"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = read_json(response).await;
    assert_eq!(json["code"], "bad_request");
}

#[tokio::test]
async fn test_create_session_empty_user_is_bad_request() {
    let (app, _state) = test_app().await;

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            create_body("", "todo"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_session_huge_ttl_is_bad_request() {
    let (app, _state) = test_app().await;

    let mut body = create_body("u1", "todo");
    body["ttlMinutes"] = json!(9_000_000_000_000_000_i64);
    let response = app
        .clone()
        .oneshot(json_request(Method::POST, "/create-session", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "bad_request");

    // The handler survived and still serves.
    let response = app
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            create_body("u1", "todo"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_draining_refuses_new_sessions() {
    let (app, state) = test_app().await;
    state.start_draining();

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            create_body("u1", "todo"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read_json(response).await["code"], "unavailable");

    let health = read_json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["status"], "draining");
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let state = test_state_with(
        RegistrySettings {
            max_sessions_per_user_per_hour: 1,
            ..Default::default()
        },
        GatewaySettings::default(),
    )
    .await;
    let app = api::create_router(state);

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            create_body("u1", "todo"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/create-session",
            create_body("u1", "notes"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(read_json(response).await["code"], "rate_limited");
}

#[tokio::test]
async fn test_revoke_session() {
    let (app, state) = test_app().await;

    let created = read_json(
        app.clone()
            .oneshot(json_request(
                Method::POST,
                "/create-session",
                create_body("u1", "todo"),
            ))
            .await
            .unwrap(),
    )
    .await;
    let token = created["token"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/revoke-session",
            json!({"token": token}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["revoked"], true);
    assert!(state.registry.validate_token(&token).await.unwrap().is_none());

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/revoke-session",
            json!({"token": token}),
        ))
        .await
        .unwrap();
    assert_eq!(read_json(response).await["revoked"], false);
}

#[tokio::test]
async fn test_server_registration_lifecycle() {
    let (app, _state) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/register-server",
            json!({
                "serverName": "todo",
                "backend": {"type": "unix", "socketPath": "/run/todo.sock"},
                "metadata": {"version": "1.2"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let registered = read_json(response).await;
    assert_eq!(registered["serverName"], "todo");
    assert!(registered["registeredAt"].is_string());

    let response = app
        .clone()
        .oneshot(get("/discover-server/todo"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let discovered = read_json(response).await;
    assert_eq!(discovered["backend"]["type"], "unix");
    assert_eq!(discovered["backend"]["socketPath"], "/run/todo.sock");
    assert_eq!(discovered["metadata"]["version"], "1.2");

    let heartbeat = Request::builder()
        .method(Method::POST)
        .uri("/heartbeat/todo")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(heartbeat).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let remove = Request::builder()
        .method(Method::DELETE)
        .uri("/register-server/todo")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(remove).await.unwrap();
    assert_eq!(read_json(response).await["removed"], true);

    let response = app
        .clone()
        .oneshot(get("/discover-server/todo"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let heartbeat = Request::builder()
        .method(Method::POST)
        .uri("/heartbeat/todo")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(heartbeat).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stats_and_user_listing() {
    let (app, _state) = test_app().await;

    for (user, server) in [("u1", "todo"), ("u1", "notes"), ("u2", "todo")] {
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/create-session",
                create_body(user, server),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let stats = read_json(app.clone().oneshot(get("/stats")).await.unwrap()).await;
    assert_eq!(stats["totalSessions"], 3);
    assert_eq!(stats["byServer"]["todo"], 2);
    assert_eq!(stats["byUser"]["u1"], 2);

    let listing = read_json(app.oneshot(get("/sessions/u1")).await.unwrap()).await;
    let entries = listing.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.get("token").is_none()));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (app, _state) = test_app().await;

    let response = app.oneshot(get("/no/such/route")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(response).await["code"], "not_found");
}
