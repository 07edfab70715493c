//! # 配置管理模块
//!
//! 本模块负责 rotapool 网关的 YAML 配置解析与校验：
//!
//! - 代理源列表（raw_list / clash_yaml）
//! - 健康检查与更新周期参数
//! - 四个前端监听端口（strict/relaxed × SOCKS5/HTTP）
//! - 入站认证、上游选择策略与粘性会话
//! - 可选的 xray 隧道适配器
//!
//! 配置在启动时加载一次；字段缺省通过 `apply_defaults` 补齐，随后
//! `validate` 做整体校验，失败即为致命错误。

pub mod adapters;
pub mod selection;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

pub use adapters::{AdaptersConfig, ObservatoryConfig, XrayConfig};
pub use selection::{Failover, SelectionConfig, StickyConfig, StickyMode, Strategy};

/// rotapool 主配置结构
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Legacy newline-delimited proxy list URLs.
    #[serde(default)]
    pub proxy_list_urls: Vec<String>,
    /// Typed sources (raw_list / clash_yaml).
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub health_check_concurrency: usize,
    #[serde(default)]
    pub update_interval_minutes: u64,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceConfig {
    /// "raw_list" or "clash_yaml"
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub total_timeout_seconds: u64,
    #[serde(default)]
    pub tls_handshake_threshold_seconds: u64,
    #[serde(default)]
    pub target_address: String,
    #[serde(default)]
    pub target_server_name: String,
}

/// Listener addresses; an empty string disables the listener.
/// Bare `:port` binds all interfaces, as does the upstream convention.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PortsConfig {
    #[serde(default)]
    pub socks5_strict: String,
    #[serde(default)]
    pub socks5_relaxed: String,
    #[serde(default)]
    pub http_strict: String,
    #[serde(default)]
    pub http_relaxed: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// "disabled", "basic" or "shared_password". When empty the mode is
    /// derived from `username`: non-empty means basic, empty means disabled.
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl AuthConfig {
    pub fn effective_mode(&self) -> &str {
        let mode = self.mode.trim();
        if !mode.is_empty() {
            return mode;
        }
        if self.username.trim().is_empty() {
            "disabled"
        } else {
            "basic"
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub addr: String,
}

impl Config {
    /// Load configuration from a YAML file, apply defaults and validate.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let mut config: Config = serde_yaml::from_str(&content)?;

        config.apply_defaults();
        config.validate()?;

        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    pub fn apply_defaults(&mut self) {
        if self.health_check_concurrency == 0 {
            self.health_check_concurrency = 200;
        }
        if self.update_interval_minutes == 0 {
            self.update_interval_minutes = 5;
        }
        if self.health_check.total_timeout_seconds == 0 {
            self.health_check.total_timeout_seconds = 8;
        }
        if self.health_check.tls_handshake_threshold_seconds == 0 {
            self.health_check.tls_handshake_threshold_seconds = 5;
        }
        if self.health_check.target_address.is_empty() {
            self.health_check.target_address = "www.google.com:443".to_string();
        }
        if self.health_check.target_server_name.is_empty() {
            self.health_check.target_server_name = "www.google.com".to_string();
        }
        if self.logging.level.is_empty() {
            self.logging.level = "info".to_string();
        }
        if self.admin.addr.is_empty() {
            self.admin.addr = ":17287".to_string();
        }
        self.selection.apply_defaults();
        self.adapters.xray.apply_defaults();
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy_list_urls.is_empty() && self.sources.is_empty() {
            return Err(anyhow::anyhow!(
                "at least one of proxy_list_urls or sources is required"
            ));
        }
        for src in &self.sources {
            match src.kind.trim().to_ascii_lowercase().as_str() {
                "raw_list" | "clash_yaml" => {}
                other => {
                    return Err(anyhow::anyhow!(
                        "sources: unsupported type {:?} (use raw_list or clash_yaml)",
                        other
                    ))
                }
            }
            if src.url.is_empty() == src.path.is_empty() {
                return Err(anyhow::anyhow!(
                    "sources: exactly one of url or path must be set"
                ));
            }
        }
        match self.auth.effective_mode() {
            "disabled" | "basic" | "shared_password" => {}
            other => {
                return Err(anyhow::anyhow!(
                    "auth.mode: unsupported {:?} (use disabled, basic or shared_password)",
                    other
                ))
            }
        }
        self.selection.validate()?;
        self.adapters.xray.validate()?;
        Ok(())
    }
}

/// Resolve a `host:port` or bare `:port` listen string into a socket address.
pub fn listen_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let full = if let Some(stripped) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", stripped)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {:?}: {}", addr, e))
}
