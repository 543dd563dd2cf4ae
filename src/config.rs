use std::env;
use std::time::Duration;

/// Runtime configuration resolved once from the `NEKKUS_*` environment
/// variables at startup; components receive the already-resolved values
/// rather than calling `env::var` themselves.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub singbox_path_override: Option<String>,
    pub proxy_listen: String,
    pub proxy_port: u16,
    pub set_system_proxy: bool,
    pub auto_connect: bool,
    pub singbox_log: SingboxLogMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingboxLogMode {
    Memory,
    Stdout,
    None,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            singbox_path_override: env::var("NEKKUS_SINGBOX_PATH").ok().filter(|s| !s.is_empty()),
            proxy_listen: env::var("NEKKUS_PROXY_LISTEN").unwrap_or_else(|_| "127.0.0.1".to_string()),
            proxy_port: env::var("NEKKUS_PROXY_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(7890),
            set_system_proxy: env_bool("NEKKUS_SET_SYSTEM_PROXY", true),
            auto_connect: env_bool("NEKKUS_AUTO_CONNECT", false),
            singbox_log: match env::var("NEKKUS_SINGBOX_LOG").as_deref() {
                Ok("stdout") => SingboxLogMode::Stdout,
                Ok("none") => SingboxLogMode::None,
                _ => SingboxLogMode::Memory,
            },
        }
    }

    pub fn readiness_deadline(&self) -> Duration {
        Duration::from_secs(15)
    }

    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_secs(30)
    }

    pub fn install_deadline(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(3)
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Ring buffer capacity for the engine's forwarded stdout/stderr lines,
/// overridable via `NEKKUS_SINGBOX_LOG_LINES`.
pub fn log_ring_capacity() -> usize {
    env::var("NEKKUS_SINGBOX_LOG_LINES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300)
}
