use tracing::warn;

/// Enables/disables the host HTTP-proxy setting. One trait, compile-time
/// platform-selected implementations; non-Windows variants are genuine
/// no-ops because the engine's own `set_system_proxy: true` inbound
/// already handles them.
///
/// Best-effort: failures are logged but never fail `Connect`/`Disconnect`.
pub trait SystemProxyToggle: Send + Sync {
    fn on(&self, host: &str, port: u16);
    fn off(&self);
}

#[cfg(target_os = "windows")]
pub struct PlatformSystemProxyToggle;

#[cfg(target_os = "windows")]
impl SystemProxyToggle for PlatformSystemProxyToggle {
    fn on(&self, host: &str, port: u16) {
        if let Err(e) = windows_impl::set_proxy(Some(&format!("{host}:{port}"))) {
            warn!(error = %e, "failed to enable system proxy");
        }
    }

    fn off(&self) {
        if let Err(e) = windows_impl::set_proxy(None) {
            warn!(error = %e, "failed to disable system proxy");
        }
    }
}

#[cfg(target_os = "windows")]
mod windows_impl {
    use winreg::enums::*;
    use winreg::RegKey;

    const SETTINGS_PATH: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

    pub fn set_proxy(target: Option<&str>) -> std::io::Result<()> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let (key, _) = hkcu.create_subkey(SETTINGS_PATH)?;

        match target {
            Some(server) => {
                key.set_value("ProxyEnable", &1u32)?;
                key.set_value("ProxyServer", &server.to_string())?;
            }
            None => {
                key.set_value("ProxyEnable", &0u32)?;
            }
        }

        notify_wininet();
        Ok(())
    }

    /// Broadcasts `INTERNET_OPTION_SETTINGS_CHANGED`/`INTERNET_OPTION_REFRESH`
    /// so running processes pick up the registry change without a restart.
    fn notify_wininet() {
        #[link(name = "wininet")]
        extern "system" {
            fn InternetSetOptionW(handle: *mut std::ffi::c_void, option: u32, buffer: *mut std::ffi::c_void, len: u32) -> i32;
        }
        const INTERNET_OPTION_SETTINGS_CHANGED: u32 = 39;
        const INTERNET_OPTION_REFRESH: u32 = 37;
        unsafe {
            InternetSetOptionW(std::ptr::null_mut(), INTERNET_OPTION_SETTINGS_CHANGED, std::ptr::null_mut(), 0);
            InternetSetOptionW(std::ptr::null_mut(), INTERNET_OPTION_REFRESH, std::ptr::null_mut(), 0);
        }
    }
}

#[cfg(not(target_os = "windows"))]
pub struct PlatformSystemProxyToggle;

#[cfg(not(target_os = "windows"))]
impl SystemProxyToggle for PlatformSystemProxyToggle {
    fn on(&self, _host: &str, _port: u16) {
        // No-op: the engine's own inbound `set_system_proxy: true` handles
        // this on non-Windows platforms.
    }

    fn off(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_never_panics() {
        let toggle = PlatformSystemProxyToggle;
        toggle.on("127.0.0.1", 7890);
        toggle.off();
    }
}
