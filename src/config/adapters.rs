use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub xray: XrayConfig,
}

/// External multi-protocol tunnel sidecar. When enabled, the updater stops
/// probing upstreams directly and instead drives one xray child per mode,
/// reading node liveness from its metrics endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct XrayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub binary_path: String,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub socks_listen_strict: String,
    #[serde(default)]
    pub socks_listen_relaxed: String,
    #[serde(default)]
    pub metrics_listen_strict: String,
    #[serde(default)]
    pub metrics_listen_relaxed: String,
    /// Shared password for the per-node SOCKS accounts.
    #[serde(default)]
    pub user_password: String,
    #[serde(default)]
    pub max_nodes: usize,
    #[serde(default)]
    pub start_timeout_seconds: u64,
    #[serde(default)]
    pub observatory: ObservatoryConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObservatoryConfig {
    /// "burst" (default) or "observatory"
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub interval_seconds: u64,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub sampling: u64,
}

impl XrayConfig {
    pub fn apply_defaults(&mut self) {
        if !self.enabled {
            return;
        }
        if self.work_dir.is_empty() {
            self.work_dir = "xray-work".to_string();
        }
        if self.max_nodes == 0 {
            self.max_nodes = 2000;
        }
        if self.start_timeout_seconds == 0 {
            self.start_timeout_seconds = 10;
        }
        if self.observatory.destination.is_empty() {
            self.observatory.destination = "https://www.google.com/generate_204".to_string();
        }
        if self.observatory.interval_seconds == 0 {
            self.observatory.interval_seconds = 30;
        }
        if self.observatory.timeout_seconds == 0 {
            self.observatory.timeout_seconds = 5;
        }
        if self.observatory.sampling == 0 {
            self.observatory.sampling = 3;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.binary_path.trim().is_empty() {
            return Err(anyhow::anyhow!("adapters.xray.binary_path is required"));
        }
        if self.user_password.trim().is_empty() {
            return Err(anyhow::anyhow!("adapters.xray.user_password is required"));
        }
        for (name, v) in [
            ("socks_listen_strict", &self.socks_listen_strict),
            ("socks_listen_relaxed", &self.socks_listen_relaxed),
            ("metrics_listen_strict", &self.metrics_listen_strict),
            ("metrics_listen_relaxed", &self.metrics_listen_relaxed),
        ] {
            if v.trim().is_empty() {
                return Err(anyhow::anyhow!("adapters.xray.{} is required", name));
            }
        }
        Ok(())
    }
}
