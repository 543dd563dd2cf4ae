use serde::{Deserialize, Serialize};

/// A single reachable proxy endpoint parsed from a subscription body.
/// `uri` non-empty is required for `Connect` to succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNode {
    pub id: String,
    pub name: String,
    pub address: String,
    pub country: Option<String>,
    pub ping: Option<u32>,
    pub uri: String,
}

/// A named subscription URL whose body resolves to a list of `ServerNode`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    pub servers: Vec<ServerNode>,
    pub updated_at: String,
}

/// Persistent user configuration, field-merged on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub sing_box_path: Option<String>,
    pub default_config_id: Option<String>,
    pub default_server: Option<String>,
}

/// Partial settings update; empty strings do not overwrite existing values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub sing_box_path: Option<String>,
    pub default_config_id: Option<String>,
    pub default_server: Option<String>,
}

impl Settings {
    pub fn merge(&mut self, patch: SettingsPatch) {
        if let Some(v) = patch.sing_box_path.filter(|s| !s.is_empty()) {
            self.sing_box_path = Some(v);
        }
        if let Some(v) = patch.default_config_id.filter(|s| !s.is_empty()) {
            self.default_config_id = Some(v);
        }
        if let Some(v) = patch.default_server.filter(|s| !s.is_empty()) {
            self.default_server = Some(v);
        }
    }
}

/// In-memory connection status, mirrored to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Rolling traffic counter snapshot; only one sample retained between calls.
#[derive(Debug, Clone, Copy)]
pub struct TrafficSample {
    pub recv_bytes: u64,
    pub sent_bytes: u64,
    pub captured_at: std::time::Instant,
}

/// Derived traffic figures returned by `GET /api/traffic`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStats {
    pub download_speed: f64,
    pub upload_speed: f64,
    pub total_download: u64,
    pub total_upload: u64,
}
