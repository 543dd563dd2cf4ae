use std::net::SocketAddr;
use std::sync::Arc;

use directories::ProjectDirs;
use nekkus_core::api::{self, AppState};
use nekkus_core::config::RuntimeConfig;
use nekkus_core::engine::VpnEngine;
use nekkus_core::fetcher::SubscriptionFetcher;
use nekkus_core::installer::Installer;
use nekkus_core::store::Store;
use nekkus_core::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = RuntimeConfig::from_env();
    let data_dir = resolve_data_dir();
    info!(data_dir = %data_dir.display(), "starting nekkus-core");

    let store = Store::load(data_dir).await?;
    let engine = Arc::new(VpnEngine::new(store.clone(), config.clone(), nekkus_core::config::log_ring_capacity()));
    let fetcher = SubscriptionFetcher::new(config.fetch_deadline())?;
    let installer = Installer::new(config.install_deadline())?;

    if config.auto_connect {
        let engine = engine.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let default_server = store.get_settings().await.default_server;
            let outcome = match default_server {
                Some(id) => engine.connect(&id).await,
                None => engine.quick_connect().await,
            };
            if let Err(e) = outcome {
                warn!(error = %e, "auto-connect failed");
            }
        });
    }

    let state = Arc::new(AppState { store, engine, fetcher, installer, config: config.clone() });
    let app = api::router(state);

    let addr: SocketAddr = ([127, 0, 0, 1], 17870).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control API listening");

    if let Err(e) = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "server exited with error");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn resolve_data_dir() -> std::path::PathBuf {
    ProjectDirs::from("dev", "nekkus", "nekkus-core")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}
