use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::engine::VpnEngine;
use crate::error::CoreError;
use crate::fetcher::SubscriptionFetcher;
use crate::installer::Installer;
use crate::model::{Settings, SettingsPatch};
use crate::store::Store;
use crate::uri_parser::UriParser;

pub struct AppState {
    pub store: Arc<Store>,
    pub engine: Arc<VpnEngine>,
    pub fetcher: SubscriptionFetcher,
    pub installer: Installer,
    pub config: RuntimeConfig,
}

/// Builds the control HTTP/JSON API router. CORS is permissive
/// (`*`, `GET`/`POST`/`OPTIONS`) since this is a local control plane with
/// no fixed caller origin.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/servers", get(get_servers))
        .route("/api/connect", post(post_connect))
        .route("/api/disconnect", post(post_disconnect))
        .route("/api/subscriptions", get(get_subscriptions).post(post_subscription))
        .route("/api/subscriptions/refresh", post(post_subscriptions_refresh))
        .route("/api/configs", get(get_configs))
        .route("/api/settings", get(get_settings).post(post_settings))
        .route("/api/traffic", get(get_traffic))
        .route("/api/deps/singbox", get(get_deps_singbox))
        .route("/api/deps/singbox/install", post(post_deps_singbox_install))
        .route("/api/logs", get(get_logs))
        .layer(cors)
        .with_state(state)
}

/// Maps `CoreError` to a status code and a `{"error": "..."}` JSON body
/// with a human-readable message.
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidInput(_)
            | CoreError::UnsupportedScheme(_)
            | CoreError::MissingCredential(_)
            | CoreError::InvalidPort(_)
            | CoreError::NoServersAvailable => StatusCode::BAD_REQUEST,
            CoreError::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::EngineStartFailure(_)
            | CoreError::InvalidServerState(_)
            | CoreError::ReadinessDeadline(_)
            | CoreError::ChildExitedEarly(_)
            | CoreError::PathTraversalError(_)
            | CoreError::UnsupportedArchive(_)
            | CoreError::IoError(_)
            | CoreError::CorruptState(_)
            | CoreError::HttpStatusError(_)
            | CoreError::NetworkError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.engine.status().await).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct ServersQuery {
    config_id: Option<String>,
}

async fn get_servers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServersQuery>,
) -> Json<serde_json::Value> {
    let servers = state.store.list_servers(query.config_id.as_deref()).await;
    Json(serde_json::to_value(servers).unwrap_or_else(|_| json!([])))
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    server_id: Option<String>,
    #[serde(default)]
    server: Option<String>,
}

async fn post_connect(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ConnectRequest>>,
) -> Result<Json<serde_json::Value>, CoreError> {
    let id = body.and_then(|Json(b)| b.server_id.or(b.server));
    let status = match id {
        Some(id) => state.engine.connect(&id).await?,
        None => state.engine.quick_connect().await?,
    };
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

async fn post_disconnect(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, CoreError> {
    let status = state.engine.disconnect().await?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

async fn get_subscriptions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let subs = state.store.list_subscriptions().await;
    Json(serde_json::to_value(subs).unwrap_or_else(|_| json!([])))
}

#[derive(Debug, Deserialize)]
struct AddSubscriptionRequest {
    name: String,
    url: String,
}

async fn post_subscription(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddSubscriptionRequest>,
) -> Result<Json<serde_json::Value>, CoreError> {
    if body.name.trim().is_empty() || body.url.trim().is_empty() {
        return Err(CoreError::InvalidInput("name and url are required".to_string()));
    }
    let sub = state.store.add_subscription(body.name, body.url).await?;
    Ok(Json(serde_json::to_value(sub).unwrap_or_default()))
}

#[derive(Debug, Serialize)]
struct RefreshOutcome {
    id: String,
    status: String,
}

/// Refreshes every subscription independently, collecting a per-item
/// outcome rather than aborting on first failure.
async fn post_subscriptions_refresh(State(state): State<Arc<AppState>>) -> Json<Vec<RefreshOutcome>> {
    let subscriptions = state.store.list_subscriptions().await;
    let mut outcomes = Vec::with_capacity(subscriptions.len());

    for sub in subscriptions {
        let outcome = match state.fetcher.fetch(&sub.url).await {
            Ok(body) => {
                let servers = UriParser::parse(&body);
                match state.store.update_subscription_servers(&sub.id, servers).await {
                    Ok(_) => RefreshOutcome { id: sub.id, status: "ok".to_string() },
                    Err(e) => {
                        warn!(subscription = %sub.id, error = %e, "failed to persist refreshed servers");
                        RefreshOutcome { id: sub.id, status: e.to_string() }
                    }
                }
            }
            Err(e) => {
                warn!(subscription = %sub.id, error = %e, "subscription refresh failed");
                RefreshOutcome { id: sub.id, status: e.to_string() }
            }
        };
        outcomes.push(outcome);
    }

    Json(outcomes)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigProjection {
    id: String,
    name: String,
    source_url: String,
    server_count: usize,
    updated_at: String,
}

async fn get_configs(State(state): State<Arc<AppState>>) -> Json<Vec<ConfigProjection>> {
    let subs = state.store.list_subscriptions().await;
    Json(
        subs.into_iter()
            .map(|s| ConfigProjection {
                id: s.id,
                name: s.name,
                source_url: s.url,
                server_count: s.servers.len(),
                updated_at: s.updated_at,
            })
            .collect(),
    )
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.store.get_settings().await)
}

async fn post_settings(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<Settings>, CoreError> {
    let settings = state.store.update_settings(patch).await?;
    Ok(Json(settings))
}

async fn get_traffic(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.engine.traffic_stats().await).unwrap_or_default())
}

async fn get_deps_singbox(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let settings = state.store.get_settings().await;
    let status = crate::installer::probe(
        state.store.data_dir(),
        state.config.singbox_path_override.as_deref(),
        settings.sing_box_path.as_deref(),
    )
    .await;
    Json(serde_json::to_value(status).unwrap_or_default())
}

async fn post_deps_singbox_install(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, CoreError> {
    let status = state.installer.install_and_persist(&state.store).await?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

async fn get_logs(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.engine.logs().await)
}
