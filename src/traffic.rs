use std::sync::Mutex;
use std::time::Instant;

use sysinfo::Networks;
use tracing::debug;

use crate::model::{EngineStatus, TrafficSample, TrafficStats};

const TUNNEL_NAME_HINTS: &[&str] = &["tun", "wintun", "utun", "tap", "wg-", "wireguard", "vpn", "sing"];
const EXCLUDED_NAME_HINTS: &[&str] = &["lo", "loopback", "bluetooth", "vmware", "vbox", "virtualbox"];

/// Periodically reads per-interface byte counters and derives rolling
/// download/upload speeds.
pub struct TrafficSampler {
    previous: Mutex<Option<TrafficSample>>,
}

impl Default for TrafficSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficSampler {
    pub fn new() -> Self {
        Self { previous: Mutex::new(None) }
    }

    /// Reads current counters; `None` when disconnected, also clearing the
    /// saved previous sample so a later reconnect doesn't see a stale delta.
    pub fn sample(&self, status: EngineStatus) -> Option<TrafficSample> {
        if status != EngineStatus::Connected {
            *self.previous.lock().unwrap() = None;
            return None;
        }

        let networks = Networks::new_with_refreshed_list();
        let (recv_bytes, sent_bytes) = select_counters(&networks);

        let sample = TrafficSample { recv_bytes, sent_bytes, captured_at: Instant::now() };
        Some(sample)
    }

    /// Derives download/upload speed and totals from the current sample
    /// against the previously retained one.
    pub fn stats(&self, status: EngineStatus) -> TrafficStats {
        let Some(current) = self.sample(status) else {
            return TrafficStats::default();
        };

        let mut guard = self.previous.lock().unwrap();
        let stats = match *guard {
            Some(prev) => {
                let dt = current.captured_at.saturating_duration_since(prev.captured_at).as_secs_f64();
                let (download_speed, upload_speed) = if dt > 0.0 {
                    (
                        ((current.recv_bytes.saturating_sub(prev.recv_bytes)) as f64 / dt).max(0.0),
                        ((current.sent_bytes.saturating_sub(prev.sent_bytes)) as f64 / dt).max(0.0),
                    )
                } else {
                    (0.0, 0.0)
                };
                TrafficStats {
                    download_speed,
                    upload_speed,
                    total_download: current.recv_bytes,
                    total_upload: current.sent_bytes,
                }
            }
            None => TrafficStats {
                download_speed: 0.0,
                upload_speed: 0.0,
                total_download: current.recv_bytes,
                total_upload: current.sent_bytes,
            },
        };

        *guard = Some(current);
        stats
    }
}

fn select_counters(networks: &Networks) -> (u64, u64) {
    for (name, data) in networks {
        if matches_any(&name.to_lowercase(), TUNNEL_NAME_HINTS) {
            debug!(interface = %name, "selected tunnel interface for traffic sampling");
            return (data.total_received(), data.total_transmitted());
        }
    }

    let mut recv = 0u64;
    let mut sent = 0u64;
    for (name, data) in networks {
        if matches_any(&name.to_lowercase(), EXCLUDED_NAME_HINTS) {
            continue;
        }
        recv = recv.saturating_add(data.total_received());
        sent = sent.saturating_add(data.total_transmitted());
    }
    (recv, sent)
}

fn matches_any(name: &str, hints: &[&str]) -> bool {
    hints.iter().any(|hint| name.contains(hint))
}
