// Integration tests for the connection status API and the sweep trigger

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether::api::{
    create_connection_router, create_refresh_router, ConnectionAppState, RefreshAppState,
};
use tether::platforms::{ClientCredentials, Platform, PlatformDirectory};
use tether::refresh::RefreshSweeper;
use tether::registry::Registry;
use tether::vault::TokenVault;
use tower::ServiceExt;

fn platform_entry(id: &str, configured: bool) -> Platform {
    Platform {
        id: id.to_string(),
        auth_url: "https://provider.example/authorize".to_string(),
        token_url: "https://provider.example/token".to_string(),
        scopes: vec![],
        extra_auth_params: BTreeMap::new(),
        identity_pointer: None,
        credentials: configured.then(|| ClientCredentials {
            client_id: "cid".to_string(),
            client_secret: "cs".to_string(),
        }),
        webhook_secret: None,
    }
}

fn create_test_app() -> (Router, Arc<Registry>) {
    let registry = Arc::new(Registry::open(":memory:").unwrap());
    let state = ConnectionAppState {
        registry: Arc::clone(&registry),
        platforms: Arc::new(PlatformDirectory::from_entries(vec![
            platform_entry("spotify", true),
            platform_entry("strava", false),
        ])),
        auth_enabled: true,
    };
    (create_connection_router(state), registry)
}

async fn get_json(app: &Router, uri: &str, bearer: Option<&str>) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = bearer {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_list_connections_without_any_links() {
    let (app, _registry) = create_test_app();

    let (status, json) = get_json(&app, "/api/connections", Some("user1")).await;
    assert_eq!(status, StatusCode::OK);

    let connections = json["connections"].as_array().unwrap();
    assert_eq!(connections.len(), 2);
    for connection in connections {
        assert_eq!(connection["status"], "disconnected");
    }
    // Platform entries carry the deployment's configuration flag
    let spotify = connections
        .iter()
        .find(|c| c["platform"] == "spotify")
        .unwrap();
    assert_eq!(spotify["enabled"], true);
    let strava = connections
        .iter()
        .find(|c| c["platform"] == "strava")
        .unwrap();
    assert_eq!(strava["enabled"], false);
}

#[tokio::test]
async fn test_list_shows_status_without_token_material() {
    let (app, registry) = create_test_app();
    registry
        .connect(
            "user1",
            "spotify",
            "sealed-ct",
            Some("sealed-rt"),
            Some(chrono::Utc::now() + Duration::hours(1)),
            None,
        )
        .unwrap();

    let (_, json) = get_json(&app, "/api/connections", Some("user1")).await;
    let spotify = json["connections"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["platform"] == "spotify")
        .cloned()
        .unwrap();

    assert_eq!(spotify["status"], "connected");
    assert!(spotify["expires_at"].is_string());
    // Ciphertext never leaves the service
    let raw = spotify.to_string();
    assert!(!raw.contains("sealed-ct"));
    assert!(!raw.contains("sealed-rt"));

    // Another user sees nothing connected
    let (_, other) = get_json(&app, "/api/connections", Some("user2")).await;
    let spotify = other["connections"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["platform"] == "spotify")
        .cloned()
        .unwrap();
    assert_eq!(spotify["status"], "disconnected");
}

#[tokio::test]
async fn test_list_requires_bearer() {
    let (app, _registry) = create_test_app();
    let (status, _) = get_json(&app, "/api/connections", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_disconnect_drops_connection() {
    let (app, registry) = create_test_app();
    registry
        .connect("user1", "spotify", "ct", Some("rt"), None, None)
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/connections/spotify")
                .header("authorization", "Bearer user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let row = registry.get("user1", "spotify").unwrap().unwrap();
    assert_eq!(row.status.as_str(), "disconnected");
    assert!(row.access_token.is_none());
}

#[tokio::test]
async fn test_disconnect_unknown_platform_is_404() {
    let (app, _registry) = create_test_app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/connections/myspace")
                .header("authorization", "Bearer user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disconnect_without_existing_connection_is_404() {
    let (app, _registry) = create_test_app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/connections/spotify")
                .header("authorization", "Bearer user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

fn refresh_app(secret: &str) -> Router {
    let registry = Arc::new(Registry::open(":memory:").unwrap());
    let vault = Arc::new(TokenVault::new(&BASE64.encode([0u8; 32])).unwrap());
    let sweeper = Arc::new(RefreshSweeper::new(
        registry,
        vault,
        Arc::new(PlatformDirectory::from_entries(vec![])),
        reqwest::Client::new(),
        Duration::minutes(10),
    ));
    create_refresh_router(RefreshAppState {
        sweeper,
        sweep_secret: secret.to_string(),
    })
}

#[tokio::test]
async fn test_sweep_trigger_requires_shared_secret() {
    let app = refresh_app("cron-secret");

    // No credential
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/refresh/run")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong credential
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/refresh/run")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_sweep_trigger_returns_summary() {
    let app = refresh_app("cron-secret");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/refresh/run")
                .header("authorization", "Bearer cron-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["checked"], 0);
    assert_eq!(json["refreshed"], 0);
    assert_eq!(json["failed"], 0);
    assert!(json["duration_ms"].is_number());
}
