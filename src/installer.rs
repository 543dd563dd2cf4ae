use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, Result};

const MANIFEST_URL: &str = "https://api.github.com/repos/SagerNet/sing-box/releases/latest";

#[derive(Debug, Deserialize)]
struct ReleaseManifest {
    tag_name: String,
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize, Clone)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Clone)]
pub struct InstallResult {
    pub path: PathBuf,
    pub version: String,
    pub source: &'static str,
}

/// Locates or downloads the sing-box binary: fetch the release manifest,
/// pick the right asset for this OS/arch, download, extract safely,
/// install under `$DATA_DIR/tools/sing-box/`.
pub struct Installer {
    client: reqwest::Client,
    download_deadline: Duration,
}

impl Installer {
    pub fn new(download_deadline: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("nekkus-core")
            .build()
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        Ok(Self { client, download_deadline })
    }

    pub async fn install_latest(&self, data_dir: &Path) -> Result<InstallResult> {
        let manifest = self.fetch_manifest().await?;
        let asset = select_asset(&manifest.assets).ok_or_else(|| {
            CoreError::UnsupportedArchive(format!("no asset for {}-{}", platform_suffix(), std::env::consts::ARCH))
        })?;

        info!(asset = %asset.name, version = %manifest.tag_name, "installing sing-box");

        let archive_bytes = self.download(&asset.browser_download_url).await?;
        let extract_dir = tempfile_dir(data_dir)?;
        extract_archive(&asset.name, &archive_bytes, &extract_dir)?;

        let binary_src = locate_binary(&extract_dir)
            .ok_or_else(|| CoreError::UnsupportedArchive("no sing-box binary found in archive".to_string()))?;

        let install_dir = data_dir.join("tools").join("sing-box");
        tokio::fs::create_dir_all(&install_dir).await?;
        let install_path = copy_binary_and_siblings(&binary_src, &extract_dir, &install_dir)?;

        let _ = tokio::fs::remove_dir_all(&extract_dir).await;

        Ok(InstallResult { path: install_path, version: manifest.tag_name, source: "installed" })
    }

    /// Installs and persists the resolved path into `Settings.singBoxPath`
    /// so subsequent `locate_binary` calls find it without a re-download.
    pub async fn install_and_persist(&self, store: &crate::store::Store) -> Result<DepsStatus> {
        let result = self.install_latest(store.data_dir()).await?;
        let path_string = result.path.display().to_string();
        store
            .update_settings(crate::model::SettingsPatch {
                sing_box_path: Some(path_string.clone()),
                ..Default::default()
            })
            .await?;
        let version = probe_version(&result.path).await.or(Some(result.version));
        Ok(DepsStatus { installed: true, path: Some(path_string), version, source: Some("installed") })
    }

    async fn fetch_manifest(&self) -> Result<ReleaseManifest> {
        let resp = self
            .client
            .get(MANIFEST_URL)
            .send()
            .await
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::HttpStatusError(resp.status().as_u16()));
        }
        resp.json().await.map_err(|e| CoreError::NetworkError(e.to_string()))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = tokio::time::timeout(self.download_deadline, self.client.get(url).send())
            .await
            .map_err(|_| CoreError::NetworkError("download deadline exceeded".to_string()))?
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::HttpStatusError(resp.status().as_u16()));
        }
        Ok(resp.bytes().await.map_err(|e| CoreError::NetworkError(e.to_string()))?.to_vec())
    }
}

/// Reported by `GET /api/deps/singbox`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepsStatus {
    pub installed: bool,
    pub path: Option<String>,
    pub version: Option<String>,
    pub source: Option<&'static str>,
}

pub(crate) fn binary_name() -> &'static str {
    if cfg!(windows) {
        "sing-box.exe"
    } else {
        "sing-box"
    }
}

/// Location the Installer places a downloaded binary; also the "bundled"
/// candidate in `VpnEngine`'s lookup precedence.
pub(crate) fn bundled_binary_path(data_dir: &Path) -> PathBuf {
    data_dir.join("tools").join("sing-box").join(binary_name())
}

pub(crate) fn path_lookup(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}

/// Checks each candidate location in precedence order and, if one
/// resolves, confirms it actually runs via a version probe.
pub async fn probe(data_dir: &Path, env_override: Option<&str>, settings_path: Option<&str>) -> DepsStatus {
    if let Some(p) = env_override {
        if Path::new(p).is_file() {
            return found(p.to_string(), "env").await;
        }
    }
    if let Some(p) = settings_path {
        if Path::new(p).is_file() {
            return found(p.to_string(), "settings").await;
        }
    }
    let bundled = bundled_binary_path(data_dir);
    if bundled.is_file() {
        return found(bundled.display().to_string(), "bundled").await;
    }
    if let Some(found_path) = path_lookup(binary_name()) {
        return found(found_path.display().to_string(), "path").await;
    }
    DepsStatus { installed: false, path: None, version: None, source: None }
}

async fn found(path: String, source: &'static str) -> DepsStatus {
    let version = probe_version(Path::new(&path)).await;
    DepsStatus { installed: true, path: Some(path), version, source: Some(source) }
}

async fn probe_version(path: &Path) -> Option<String> {
    let output = tokio::process::Command::new(path).arg("version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok().and_then(|s| s.lines().next().map(str::to_string))
}

fn platform_suffix() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "darwin"
    }
}

fn asset_extension() -> &'static str {
    if cfg!(target_os = "windows") {
        ".zip"
    } else {
        ".tar.gz"
    }
}

/// Picks the asset whose name ends with `$platform-$arch.{zip,tar.gz}`,
/// preferring names that don't contain "legacy"; first match wins ties.
fn select_asset(assets: &[ReleaseAsset]) -> Option<ReleaseAsset> {
    let suffix = format!("{}-{}{}", platform_suffix(), std::env::consts::ARCH, asset_extension());
    let mut candidates: Vec<&ReleaseAsset> = assets.iter().filter(|a| a.name.ends_with(&suffix)).collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|a| a.name.contains("legacy"));
    candidates.into_iter().next().cloned()
}

fn tempfile_dir(data_dir: &Path) -> Result<PathBuf> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = data_dir.join("runtime").join(format!("install-{nanos}"));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Rejects any archive entry whose joined path escapes `dest`, is
/// absolute, or contains `..` segments.
fn safe_join(dest: &Path, entry_path: &Path) -> Result<PathBuf> {
    if entry_path.is_absolute() || entry_path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CoreError::PathTraversalError(entry_path.display().to_string()));
    }
    let joined = dest.join(entry_path);
    let normalized = joined.components().collect::<PathBuf>();
    if !normalized.starts_with(dest) {
        return Err(CoreError::PathTraversalError(entry_path.display().to_string()));
    }
    Ok(joined)
}

fn extract_archive(asset_name: &str, bytes: &[u8], dest: &Path) -> Result<()> {
    if asset_name.ends_with(".zip") {
        extract_zip(bytes, dest)
    } else if asset_name.ends_with(".tar.gz") || asset_name.ends_with(".tgz") {
        extract_tar_gz(bytes, dest)
    } else {
        Err(CoreError::UnsupportedArchive(asset_name.to_string()))
    }
}

fn extract_zip(bytes: &[u8], dest: &Path) -> Result<()> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|e| CoreError::UnsupportedArchive(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| CoreError::UnsupportedArchive(e.to_string()))?;
        let Some(entry_path) = entry.enclosed_name() else {
            return Err(CoreError::PathTraversalError(entry.name().to_string()));
        };
        let out_path = safe_join(dest, &entry_path)?;

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;

        #[cfg(unix)]
        set_executable_if_binary(&out_path, entry.unix_mode());
    }
    Ok(())
}

fn extract_tar_gz(bytes: &[u8], dest: &Path) -> Result<()> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let out_path = safe_join(dest, &entry_path)?;

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mode = entry.header().mode().ok();
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;

        #[cfg(unix)]
        set_executable_if_binary(&out_path, mode);
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable_if_binary(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    let is_binary_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.eq_ignore_ascii_case("sing-box"))
        .unwrap_or(false);
    if is_binary_name || mode.map(|m| m & 0o111 != 0).unwrap_or(false) {
        if let Ok(metadata) = std::fs::metadata(path) {
            let mut perms = metadata.permissions();
            perms.set_mode(perms.mode() | 0o755);
            let _ = std::fs::set_permissions(path, perms);
        }
    }
}

fn locate_binary(root: &Path) -> Option<PathBuf> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_lowercase();
            if name == "sing-box" || name == "sing-box.exe" {
                return Some(path);
            }
        }
    }
    None
}

fn copy_binary_and_siblings(binary: &Path, extract_root: &Path, install_dir: &Path) -> Result<PathBuf> {
    let sibling_dir = binary.parent().unwrap_or(extract_root);
    for entry in std::fs::read_dir(sibling_dir)?.flatten() {
        let path = entry.path();
        if path.is_file() {
            let dest = install_dir.join(path.file_name().unwrap());
            std::fs::copy(&path, &dest)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let name = dest.file_name().and_then(|n| n.to_str()).unwrap_or("").to_lowercase();
                if name == "sing-box" {
                    let mut perms = std::fs::metadata(&dest)?.permissions();
                    perms.set_mode(0o755);
                    std::fs::set_permissions(&dest, perms)?;
                }
            }
        }
    }
    let bin_name = binary.file_name().unwrap();
    Ok(install_dir.join(bin_name))
}
