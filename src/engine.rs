use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{CoreError, Result};
use crate::model::{EngineStatus, ServerNode, TrafficStats};
use crate::outbound::{Outbound, OutboundBuilder, ToOutbound};
use crate::readiness::ReadinessGate;
use crate::store::Store;
use crate::supervisor::EngineSupervisor;
use crate::system_proxy::{PlatformSystemProxyToggle, SystemProxyToggle};
use crate::traffic::TrafficSampler;

struct EngineState {
    status: EngineStatus,
    current_node: Option<ServerNode>,
    current_subscription_id: Option<String>,
    config_path: Option<PathBuf>,
    last_update_unix: u64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            status: EngineStatus::Disconnected,
            current_node: None,
            current_subscription_id: None,
            config_path: None,
            last_update_unix: now_unix(),
        }
    }

    fn set(&mut self, status: EngineStatus, node: Option<ServerNode>, subscription_id: Option<String>) {
        self.status = status;
        self.current_node = node;
        self.current_subscription_id = subscription_id;
        self.last_update_unix = now_unix();
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Aggregated view returned by `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub connected: bool,
    pub server: Option<ServerNode>,
    pub active_config_id: Option<String>,
    pub config_count: usize,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub total_download: u64,
    pub total_upload: u64,
    pub last_update_unix: u64,
}

/// Accumulates what has succeeded so far in `connect()` so a failure can
/// unwind in reverse order without scattered cleanup duplication.
#[derive(Default)]
struct RollbackPlan {
    config_path: Option<PathBuf>,
    child_spawned: bool,
    system_proxy_on: bool,
}

/// Owns all in-memory connection state: the state machine, the child
/// supervisor, the system proxy toggle and the traffic sampler. `Store`
/// owns persisted data; `VpnEngine` owns everything transient. A single
/// mutex guards the small state struct below; no handle ever escapes
/// this type.
pub struct VpnEngine {
    store: Arc<Store>,
    state: Mutex<EngineState>,
    supervisor: EngineSupervisor,
    system_proxy: Box<dyn SystemProxyToggle>,
    traffic: TrafficSampler,
    config: RuntimeConfig,
}

impl VpnEngine {
    pub fn new(store: Arc<Store>, config: RuntimeConfig, log_capacity: usize) -> Self {
        Self::with_system_proxy(store, config, log_capacity, Box::new(PlatformSystemProxyToggle))
    }

    /// Same as `new`, with an injectable `SystemProxyToggle` — used by
    /// tests to observe toggle-vs-kill ordering without touching the real
    /// OS registry.
    pub fn with_system_proxy(
        store: Arc<Store>,
        config: RuntimeConfig,
        log_capacity: usize,
        system_proxy: Box<dyn SystemProxyToggle>,
    ) -> Self {
        Self {
            store,
            state: Mutex::new(EngineState::new()),
            supervisor: EngineSupervisor::new(log_capacity, config.singbox_log),
            system_proxy,
            traffic: TrafficSampler::new(),
            config,
        }
    }

    pub async fn status(&self) -> StatusView {
        let guard = self.state.lock().await;
        let stats = self.traffic.stats(guard.status);
        let subscriptions = self.store.list_subscriptions().await;
        StatusView {
            connected: guard.status == EngineStatus::Connected,
            server: guard.current_node.clone(),
            active_config_id: guard.current_subscription_id.clone(),
            config_count: subscriptions.len(),
            download_speed: stats.download_speed,
            upload_speed: stats.upload_speed,
            total_download: stats.total_download,
            total_upload: stats.total_upload,
            last_update_unix: guard.last_update_unix,
        }
    }

    pub async fn traffic_stats(&self) -> TrafficStats {
        let status = self.state.lock().await.status;
        self.traffic.stats(status)
    }

    pub async fn logs(&self) -> Vec<String> {
        self.supervisor.logs().snapshot().await
    }

    /// `QuickConnect`: connects to the first known server or fails with
    /// `NoServersAvailable`.
    pub async fn quick_connect(&self) -> Result<StatusView> {
        let servers = self.store.list_servers(None).await;
        let first = servers.into_iter().next().ok_or(CoreError::NoServersAvailable)?;
        self.connect(&first.id).await
    }

    /// Runs the ordered Connect pipeline, rolling back completed steps in
    /// reverse on any failure.
    pub async fn connect(&self, server_id: &str) -> Result<StatusView> {
        {
            let guard = self.state.lock().await;
            if guard.status == EngineStatus::Connected {
                if let Some(node) = &guard.current_node {
                    if node.id == server_id {
                        drop(guard);
                        return Ok(self.status().await);
                    }
                }
            }
        }

        if self.state.lock().await.status == EngineStatus::Connected {
            self.disconnect().await?;
        }

        let server = self.store.get_server(server_id).await?;
        let subscription_id = self.store.find_owning_subscription_id(&server.id).await;
        if server.uri.is_empty() {
            self.mark_error().await;
            return Err(CoreError::InvalidServerState(format!("server {server_id} has no uri")));
        }

        self.set_status(EngineStatus::Connecting, None, None).await;

        let mut plan = RollbackPlan::default();
        match self.run_connect_pipeline(&server, &mut plan).await {
            Ok(()) => {
                self.set_status(EngineStatus::Connected, Some(server), subscription_id).await;
                Ok(self.status().await)
            }
            Err(e) => {
                error!(error = %e, "connect failed, rolling back");
                self.rollback(plan).await;
                self.mark_error().await;
                Err(e)
            }
        }
    }

    async fn run_connect_pipeline(&self, server: &ServerNode, plan: &mut RollbackPlan) -> Result<()> {
        let outbound = OutboundBuilder::build(&server.uri)?;

        let config_path = self.write_engine_config(&outbound).await?;
        plan.config_path = Some(config_path.clone());

        let binary_path = self.locate_binary().await.ok_or(CoreError::EngineUnavailable)?;

        self.supervisor.start(&binary_path, &config_path).await?;
        plan.child_spawned = true;

        ReadinessGate::await_ready(&self.config.proxy_listen, self.config.proxy_port, self.config.readiness_deadline(), &self.supervisor)
            .await?;

        if self.config.set_system_proxy {
            self.system_proxy.on(&self.config.proxy_listen, self.config.proxy_port);
            plan.system_proxy_on = true;
        }

        self.state.lock().await.config_path = Some(config_path);
        Ok(())
    }

    /// Unwinds a partially completed Connect in reverse order: proxy off,
    /// child killed, config file removed.
    async fn rollback(&self, plan: RollbackPlan) {
        if plan.system_proxy_on {
            self.system_proxy.off();
        }
        if plan.child_spawned {
            self.supervisor.stop(self.config.stop_grace()).await;
        }
        if let Some(path) = plan.config_path {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    /// `Disconnect`: proxy off first so an externally-killed process never
    /// leaves a stray system proxy behind, then stop the child, then clear
    /// state.
    pub async fn disconnect(&self) -> Result<StatusView> {
        self.system_proxy.off();
        self.supervisor.stop(self.config.stop_grace()).await;

        let config_path = {
            let mut guard = self.state.lock().await;
            guard.set(EngineStatus::Disconnected, None, None);
            guard.config_path.take()
        };
        if let Some(path) = config_path {
            let _ = tokio::fs::remove_file(&path).await;
        }

        Ok(self.status().await)
    }

    async fn set_status(&self, status: EngineStatus, node: Option<ServerNode>, subscription_id: Option<String>) {
        self.state.lock().await.set(status, node, subscription_id);
    }

    async fn mark_error(&self) {
        self.state.lock().await.set(EngineStatus::Error, None, None);
    }

    /// Builds the engine-supplied outbound plus the fixed direct/block
    /// outbounds and writes it to a uniquely named file under
    /// `$DATA_DIR/runtime/`.
    async fn write_engine_config(&self, outbound: &Outbound) -> Result<PathBuf> {
        let mut outbound_json = outbound.to_outbound_json();
        if let Some(obj) = outbound_json.as_object_mut() {
            obj.insert("tag".into(), json!("proxy"));
        }

        let document = json!({
            "log": {"level": "info"},
            "inbounds": [{
                "type": "mixed",
                "tag": "mixed-in",
                "listen": self.config.proxy_listen,
                "listen_port": self.config.proxy_port,
                "set_system_proxy": true,
            }],
            "outbounds": [
                outbound_json,
                {"type": "direct", "tag": "direct"},
                {"type": "block", "tag": "block"},
            ],
            "route": {"final": "proxy"},
        });

        let runtime_dir = self.store.data_dir().join("runtime");
        tokio::fs::create_dir_all(&runtime_dir).await?;
        let path = runtime_dir.join(format!("sing-box-{}.json", now_unix_nanos()));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&document)?).await?;
        info!(path = %path.display(), "wrote engine config");
        Ok(path)
    }

    /// Resolves the engine binary path: `NEKKUS_SINGBOX_PATH` env, then the
    /// saved settings path, then the bundled install directory under the
    /// data dir, then a `PATH` lookup.
    async fn locate_binary(&self) -> Option<PathBuf> {
        if let Some(p) = &self.config.singbox_path_override {
            let path = PathBuf::from(p);
            if path.is_file() {
                return Some(path);
            }
            warn!(path = %p, "NEKKUS_SINGBOX_PATH does not point to a file");
        }

        if let Some(p) = self.store.get_settings().await.sing_box_path {
            let path = PathBuf::from(&p);
            if path.is_file() {
                return Some(path);
            }
        }

        let bundled = crate::installer::bundled_binary_path(self.store.data_dir());
        if bundled.is_file() {
            return Some(bundled);
        }

        crate::installer::path_lookup(crate::installer::binary_name())
    }
}

fn now_unix_nanos() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SingboxLogMode;
    use crate::model::{Settings, SettingsPatch};

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            singbox_path_override: None,
            proxy_listen: "127.0.0.1".to_string(),
            proxy_port: 7890,
            set_system_proxy: false,
            auto_connect: false,
            singbox_log: SingboxLogMode::Memory,
        }
    }

    #[tokio::test]
    async fn quick_connect_with_no_servers_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();
        let engine = VpnEngine::new(store, test_config(), 50);
        let err = engine.quick_connect().await.unwrap_err();
        assert!(matches!(err, CoreError::NoServersAvailable));
    }

    #[tokio::test]
    async fn connect_with_unresolvable_server_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();
        let engine = VpnEngine::new(store, test_config(), 50);
        let err = engine.connect("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        let status = engine.status().await;
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn connect_with_empty_uri_server_fails_and_reports_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();
        let sub = store.add_subscription("test".into(), "http://example.invalid".into()).await.unwrap();
        let node = crate::model::ServerNode {
            id: "node-1".into(),
            name: "Empty".into(),
            address: "1.2.3.4".into(),
            country: None,
            ping: None,
            uri: String::new(),
        };
        store.update_subscription_servers(&sub.id, vec![node]).await.unwrap();

        let engine = VpnEngine::new(store, test_config(), 50);
        let err = engine.connect("node-1").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidServerState(_)));
        assert!(err.to_string().contains("uri"));
        assert!(!engine.status().await.connected);
    }

    #[tokio::test]
    async fn disconnect_when_never_connected_is_a_harmless_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();
        let engine = VpnEngine::new(store, test_config(), 50);
        let status = engine.disconnect().await.unwrap();
        assert!(!status.connected);
    }

    #[test]
    fn settings_merge_ignores_blank_patch_fields() {
        let mut settings = Settings { sing_box_path: Some("/usr/bin/sing-box".into()), ..Default::default() };
        settings.merge(SettingsPatch { sing_box_path: Some(String::new()), ..Default::default() });
        assert_eq!(settings.sing_box_path.as_deref(), Some("/usr/bin/sing-box"));
    }

    mockall::mock! {
        Toggle {}
        impl SystemProxyToggle for Toggle {
            fn on(&self, host: &str, port: u16);
            fn off(&self);
        }
    }

    /// `Disconnect` turns the system proxy off before anything else,
    /// regardless of engine state.
    #[tokio::test]
    async fn disconnect_turns_system_proxy_off() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();

        let mut toggle = MockToggle::new();
        toggle.expect_off().times(1).return_const(());

        let engine = VpnEngine::with_system_proxy(store, test_config(), 50, Box::new(toggle));
        engine.disconnect().await.unwrap();
    }
}
