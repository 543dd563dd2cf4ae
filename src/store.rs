use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{ServerNode, Settings, SettingsPatch, Subscription};

/// Persists subscriptions, server nodes and settings under a data directory.
/// Two JSON files guarded by readers-writer locks, each write going through
/// a temp-file-then-rename for atomicity.
pub struct Store {
    data_dir: PathBuf,
    subscriptions: RwLock<Vec<Subscription>>,
    settings: RwLock<Settings>,
}

fn subscriptions_path(data_dir: &Path) -> PathBuf {
    data_dir.join("subscriptions.json")
}

fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

impl Store {
    /// Loads persisted state from `data_dir`, creating the directory (but
    /// not the files — a missing file is not an error) if needed.
    pub async fn load(data_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let subscriptions = read_json_or_default(&subscriptions_path(&data_dir)).await?;
        let settings = read_json_or_default(&settings_path(&data_dir)).await?;

        Ok(Arc::new(Self {
            data_dir,
            subscriptions: RwLock::new(subscriptions),
            settings: RwLock::new(settings),
        }))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn get_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<Settings> {
        let mut guard = self.settings.write().await;
        guard.merge(patch);
        let snapshot = guard.clone();
        write_json_atomic(&settings_path(&self.data_dir), &snapshot).await?;
        Ok(snapshot)
    }

    pub async fn list_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().await.clone()
    }

    pub async fn add_subscription(&self, name: String, url: String) -> Result<Subscription> {
        let mut guard = self.subscriptions.write().await;
        let sub = Subscription {
            id: Uuid::new_v4().to_string(),
            name,
            url,
            servers: Vec::new(),
            updated_at: Utc::now().to_rfc3339(),
        };
        guard.push(sub.clone());
        let snapshot = guard.clone();
        drop(guard);
        write_json_atomic(&subscriptions_path(&self.data_dir), &snapshot).await?;
        Ok(sub)
    }

    pub async fn get_subscription(&self, id: &str) -> Result<Subscription> {
        self.subscriptions
            .read()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))
    }

    pub async fn remove_subscription(&self, id: &str) -> Result<()> {
        let mut guard = self.subscriptions.write().await;
        let before = guard.len();
        guard.retain(|s| s.id != id);
        if guard.len() == before {
            return Err(CoreError::NotFound(format!("subscription {id}")));
        }
        let snapshot = guard.clone();
        drop(guard);
        write_json_atomic(&subscriptions_path(&self.data_dir), &snapshot).await
    }

    pub async fn update_subscription_servers(&self, id: &str, servers: Vec<ServerNode>) -> Result<Subscription> {
        let mut guard = self.subscriptions.write().await;
        let sub = guard
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))?;
        sub.servers = servers;
        sub.updated_at = Utc::now().to_rfc3339();
        let updated = sub.clone();
        let snapshot = guard.clone();
        drop(guard);
        write_json_atomic(&subscriptions_path(&self.data_dir), &snapshot).await?;
        Ok(updated)
    }

    /// Flattened servers across subscriptions, duplicates by `id` suppressed
    /// (first occurrence wins, preserving insertion order).
    pub async fn list_servers(&self, config_id: Option<&str>) -> Vec<ServerNode> {
        let guard = self.subscriptions.read().await;
        let mut seen = HashMap::new();
        let mut out = Vec::new();
        for sub in guard.iter() {
            if let Some(cid) = config_id {
                if sub.id != cid {
                    continue;
                }
            }
            for server in &sub.servers {
                if seen.insert(server.id.clone(), ()).is_none() {
                    out.push(server.clone());
                }
            }
        }
        out
    }

    /// Matches by `id` first, then by `name` within each subscription.
    pub async fn get_server(&self, id_or_name: &str) -> Result<ServerNode> {
        let guard = self.subscriptions.read().await;
        for sub in guard.iter() {
            if let Some(found) = sub.servers.iter().find(|s| s.id == id_or_name) {
                return Ok(found.clone());
            }
        }
        for sub in guard.iter() {
            if let Some(found) = sub.servers.iter().find(|s| s.name == id_or_name) {
                return Ok(found.clone());
            }
        }
        Err(CoreError::NotFound(format!("server {id_or_name}")))
    }

    /// Finds the subscription that owns a given server id, for callers that
    /// need to report the parent config alongside the resolved server.
    pub async fn find_owning_subscription_id(&self, server_id: &str) -> Option<String> {
        let guard = self.subscriptions.read().await;
        guard.iter().find(|s| s.servers.iter().any(|n| n.id == server_id)).map(|s| s.id.clone())
    }
}

async fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            warn!(path = %path.display(), error = %e, "corrupt persisted state");
            CoreError::CorruptState(format!("{}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Atomic replace: serialize under the caller's write lock, write to a
/// sibling temp file, then rename over the target. On platforms without
/// atomic rename semantics this degrades to write-then-close with
/// restrictive permissions.
async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::write(&tmp_path, &json).await?;
        let mut perms = tokio::fs::metadata(&tmp_path).await?.permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }
    #[cfg(not(unix))]
    {
        tokio::fs::write(&tmp_path, &json).await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    debug!(path = %path.display(), "persisted state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_round_trips_through_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();
        let sub = store.add_subscription("Test".into(), "https://example.com/sub".into()).await.unwrap();
        store
            .update_subscription_servers(
                &sub.id,
                vec![ServerNode {
                    id: "s1".into(),
                    name: "Node".into(),
                    address: "1.2.3.4".into(),
                    country: Some("JP".into()),
                    ping: Some(42),
                    uri: "vless://u@1.2.3.4:443".into(),
                }],
            )
            .await
            .unwrap();

        let reloaded = Store::load(dir.path().to_path_buf()).await.unwrap();
        let subs = reloaded.list_subscriptions().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, sub.id);
        assert_eq!(subs[0].servers.len(), 1);
        assert_eq!(subs[0].servers[0].name, "Node");
    }

    #[tokio::test]
    async fn settings_round_trip_through_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();
        store
            .update_settings(SettingsPatch { sing_box_path: Some("/opt/sing-box".into()), ..Default::default() })
            .await
            .unwrap();

        let reloaded = Store::load(dir.path().to_path_buf()).await.unwrap();
        let settings = reloaded.get_settings().await;
        assert_eq!(settings.sing_box_path.as_deref(), Some("/opt/sing-box"));
    }

    #[tokio::test]
    async fn remove_unknown_subscription_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();
        let err = store.remove_subscription("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_servers_dedups_across_subscriptions_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(dir.path().to_path_buf()).await.unwrap();
        let a = store.add_subscription("A".into(), "https://a.example".into()).await.unwrap();
        let b = store.add_subscription("B".into(), "https://b.example".into()).await.unwrap();
        let node = |id: &str| ServerNode {
            id: id.into(),
            name: id.into(),
            address: String::new(),
            country: None,
            ping: None,
            uri: format!("trojan://pw@{id}.example:443"),
        };
        store.update_subscription_servers(&a.id, vec![node("shared"), node("only-a")]).await.unwrap();
        store.update_subscription_servers(&b.id, vec![node("shared"), node("only-b")]).await.unwrap();

        let all = store.list_servers(None).await;
        assert_eq!(all.len(), 3);
        let scoped = store.list_servers(Some(&a.id)).await;
        assert_eq!(scoped.len(), 2);
    }
}
