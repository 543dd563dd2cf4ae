//! Integration tests for the control HTTP/JSON API.
//!
//! Uses `tower::ServiceExt::oneshot` to call the router without binding a
//! real TCP port; each test gets its own temp data directory so runs never
//! interfere with each other.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use nekkus_core::api::{self, AppState};
use nekkus_core::config::RuntimeConfig;
use nekkus_core::engine::VpnEngine;
use nekkus_core::fetcher::SubscriptionFetcher;
use nekkus_core::installer::Installer;
use nekkus_core::store::Store;
use tower::ServiceExt;

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        singbox_path_override: None,
        proxy_listen: "127.0.0.1".to_string(),
        proxy_port: 17899,
        set_system_proxy: false,
        auto_connect: false,
        singbox_log: nekkus_core::config::SingboxLogMode::Memory,
    }
}

async fn make_state(data_dir: &std::path::Path) -> Arc<AppState> {
    let config = test_config();
    let store = Store::load(data_dir.to_path_buf()).await.unwrap();
    let engine = Arc::new(VpnEngine::new(store.clone(), config.clone(), 100));
    let fetcher = SubscriptionFetcher::new(Duration::from_secs(5)).unwrap();
    let installer = Installer::new(Duration::from_secs(5)).unwrap();
    Arc::new(AppState { store, engine, fetcher, installer, config })
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap()
}

fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_starts_disconnected_with_zero_configs() {
    let dir = tempfile::tempdir().unwrap();
    let app = api::router(make_state(dir.path()).await);

    let resp = app.oneshot(get_req("/api/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["connected"], false);
    assert_eq!(body["configCount"], 0);
}

#[tokio::test]
async fn connect_with_no_subscriptions_returns_400() {
    let dir = tempfile::tempdir().unwrap();
    let app = api::router(make_state(dir.path()).await);

    let resp = app.oneshot(Request::builder().method(Method::POST).uri("/api/connect").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("no servers"));
}

#[tokio::test]
async fn connect_to_server_with_empty_uri_returns_500() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path()).await;

    let sub = state.store.add_subscription("Test".into(), "https://example.com/sub".into()).await.unwrap();
    let node = nekkus_core::model::ServerNode {
        id: "node-1".into(),
        name: "Empty".into(),
        address: "1.2.3.4".into(),
        country: None,
        ping: None,
        uri: String::new(),
    };
    state.store.update_subscription_servers(&sub.id, vec![node]).await.unwrap();

    let app = api::router(Arc::clone(&state));
    let resp = app.oneshot(json_post("/api/connect", serde_json::json!({"server_id": "node-1"}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("uri"));
}

#[tokio::test]
async fn post_subscription_then_list_reflects_it() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path()).await;

    let app1 = api::router(Arc::clone(&state));
    let resp = app1
        .oneshot(json_post("/api/subscriptions", serde_json::json!({"name": "Test", "url": "https://example.com/sub"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let created = body_json(resp).await;
    assert_eq!(created["name"], "Test");

    let app2 = api::router(Arc::clone(&state));
    let resp = app2.oneshot(get_req("/api/subscriptions")).await.unwrap();
    let list = body_json(resp).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let app3 = api::router(Arc::clone(&state));
    let resp = app3.oneshot(get_req("/api/configs")).await.unwrap();
    let configs = body_json(resp).await;
    assert_eq!(configs[0]["serverCount"], 0);
}

#[tokio::test]
async fn post_subscription_rejects_blank_name() {
    let dir = tempfile::tempdir().unwrap();
    let app = api::router(make_state(dir.path()).await);

    let resp = app
        .oneshot(json_post("/api/subscriptions", serde_json::json!({"name": "  ", "url": "https://example.com/sub"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn settings_round_trip_through_the_api() {
    let dir = tempfile::tempdir().unwrap();
    let state = make_state(dir.path()).await;

    let app1 = api::router(Arc::clone(&state));
    let resp = app1
        .oneshot(json_post("/api/settings", serde_json::json!({"singBoxPath": "/opt/sing-box"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let app2 = api::router(Arc::clone(&state));
    let resp = app2.oneshot(get_req("/api/settings")).await.unwrap();
    let settings = body_json(resp).await;
    assert_eq!(settings["singBoxPath"], "/opt/sing-box");
}

#[tokio::test]
async fn disconnect_when_never_connected_is_a_harmless_noop() {
    let dir = tempfile::tempdir().unwrap();
    let app = api::router(make_state(dir.path()).await);

    let resp = app.oneshot(Request::builder().method(Method::POST).uri("/api/disconnect").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["connected"], false);
}

#[tokio::test]
async fn deps_singbox_reports_not_installed_in_a_fresh_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let app = api::router(make_state(dir.path()).await);

    let resp = app.oneshot(get_req("/api/deps/singbox")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["installed"], false);
}
