//! Normalized upstream node specs.
//!
//! Every source (raw lists, Clash subscriptions) is reduced to a `Spec` with
//! a content-derived stable id: two nodes that differ only in display name
//! collapse into one. The id doubles as the xray outbound tag, hence the
//! `n-` prefix.

use std::collections::BTreeMap;
use std::collections::HashSet;

use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Socks5,
    Http,
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
}

impl UpstreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socks5 => "socks5",
            Self::Http => "http",
            Self::Shadowsocks => "shadowsocks",
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPassConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowsocksConfig {
    pub method: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamConfig {
    pub tls: bool,
    pub skip_cert_verify: bool,
    pub server_name: String,
    /// tcp | ws | grpc; empty means tcp.
    pub network: String,
    pub ws_path: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmessConfig {
    pub uuid: String,
    pub alter_id: i64,
    pub security: String,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VlessConfig {
    pub uuid: String,
    pub flow: String,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrojanConfig {
    pub password: String,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpecDetail {
    Socks5(UserPassConfig),
    Http(UserPassConfig),
    Shadowsocks(ShadowsocksConfig),
    Vmess(VmessConfig),
    Vless(VlessConfig),
    Trojan(TrojanConfig),
}

impl SpecDetail {
    pub fn kind(&self) -> UpstreamKind {
        match self {
            Self::Socks5(_) => UpstreamKind::Socks5,
            Self::Http(_) => UpstreamKind::Http,
            Self::Shadowsocks(_) => UpstreamKind::Shadowsocks,
            Self::Vmess(_) => UpstreamKind::Vmess,
            Self::Vless(_) => UpstreamKind::Vless,
            Self::Trojan(_) => UpstreamKind::Trojan,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spec {
    pub id: String,
    pub name: String,
    pub server: String,
    pub port: u16,
    pub detail: SpecDetail,
}

impl Spec {
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16, detail: SpecDetail) -> Self {
        let mut spec = Self {
            id: String::new(),
            name: name.into(),
            server: server.into(),
            port,
            detail,
        };
        spec.id = stable_node_id(&spec);
        spec
    }

    pub fn socks5(server: impl Into<String>, port: u16) -> Self {
        Self::new("", server, port, SpecDetail::Socks5(UserPassConfig::default()))
    }

    pub fn kind(&self) -> UpstreamKind {
        self.detail.kind()
    }

    /// Recompute the content-derived id; idempotent by construction.
    pub fn normalize(mut self) -> Self {
        self.id = stable_node_id(&self);
        self
    }

    /// Non-secret view of the spec for the admin surface and logs.
    pub fn safe_summary(&self) -> serde_json::Value {
        let mut out = serde_json::json!({
            "id": self.id,
            "name": self.name,
            "type": self.kind().as_str(),
            "server": self.server,
            "port": self.port,
        });
        let obj = out.as_object_mut().unwrap();
        match &self.detail {
            SpecDetail::Socks5(c) | SpecDetail::Http(c) => {
                if !c.username.trim().is_empty() {
                    obj.insert("username".into(), c.username.clone().into());
                }
            }
            SpecDetail::Shadowsocks(c) => {
                obj.insert("method".into(), c.method.clone().into());
            }
            SpecDetail::Vmess(c) => insert_stream_summary(obj, &c.stream),
            SpecDetail::Vless(c) => {
                insert_stream_summary(obj, &c.stream);
                if !c.flow.is_empty() {
                    obj.insert("flow".into(), c.flow.clone().into());
                }
            }
            SpecDetail::Trojan(c) => insert_stream_summary(obj, &c.stream),
        }
        out
    }
}

fn insert_stream_summary(obj: &mut serde_json::Map<String, serde_json::Value>, s: &StreamConfig) {
    obj.insert("network".into(), s.network.clone().into());
    obj.insert("tls".into(), s.tls.into());
    obj.insert("skip_cert_verify".into(), s.skip_cert_verify.into());
    if !s.server_name.is_empty() {
        obj.insert("sni".into(), s.server_name.clone().into());
    }
}

/// "n-" plus the first 12 hex chars of SHA-256 over the canonical form.
pub fn stable_node_id(spec: &Spec) -> String {
    let digest = Sha256::digest(canonical_string(spec).as_bytes());
    format!("n-{}", &hex::encode(digest)[..12])
}

fn canonical_string(spec: &Spec) -> String {
    let mut parts = vec![
        format!("type={}", spec.kind().as_str()),
        format!("server={}", spec.server.trim().to_lowercase()),
        format!("port={}", spec.port),
    ];

    match &spec.detail {
        SpecDetail::Socks5(c) | SpecDetail::Http(c) => {
            parts.push(format!("user={}", c.username));
            parts.push(format!("pass={}", c.password));
        }
        SpecDetail::Shadowsocks(c) => {
            parts.push(format!("method={}", c.method.trim().to_lowercase()));
            parts.push(format!("pass={}", c.password));
        }
        SpecDetail::Vmess(c) => {
            parts.push(canonical_stream(
                "vmess",
                &[
                    format!("uuid={}", c.uuid),
                    format!("aid={}", c.alter_id),
                    format!("sec={}", c.security),
                ],
                &c.stream,
            ));
        }
        SpecDetail::Vless(c) => {
            parts.push(canonical_stream(
                "vless",
                &[format!("uuid={}", c.uuid), format!("flow={}", c.flow)],
                &c.stream,
            ));
        }
        SpecDetail::Trojan(c) => {
            parts.push(canonical_stream(
                "trojan",
                &[format!("pass={}", c.password)],
                &c.stream,
            ));
        }
    }

    parts.join("|")
}

fn canonical_stream(prefix: &str, own: &[String], s: &StreamConfig) -> String {
    let mut out = vec![prefix.to_string()];
    out.extend_from_slice(own);
    out.push(format!("tls={}", s.tls));
    out.push(format!("skip={}", s.skip_cert_verify));
    out.push(format!("sni={}", s.server_name));
    out.push(format!("net={}", s.network));
    out.push(format!("wspath={}", s.ws_path));
    out.push(format!("hdr={}", canonical_headers(&s.headers)));
    out.join(",")
}

fn canonical_headers(headers: &BTreeMap<String, String>) -> String {
    // BTreeMap iteration is already key-sorted; lowercase for stability.
    headers
        .iter()
        .map(|(k, v)| format!("{}={}", k.to_lowercase(), v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Drop later duplicates, keeping first-seen order by id.
pub fn deduplicate(specs: Vec<Spec>) -> Vec<Spec> {
    let mut seen = HashSet::with_capacity(specs.len());
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let spec = if spec.id.trim().is_empty() {
            spec.normalize()
        } else {
            spec
        };
        if seen.insert(spec.id.clone()) {
            out.push(spec);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_id_ignores_display_name_and_case() {
        let a = Spec::new(
            "n1",
            "Example.COM",
            1080,
            SpecDetail::Socks5(UserPassConfig {
                username: "u".into(),
                password: "p".into(),
            }),
        );
        let b = Spec::new(
            "ignored",
            "example.com",
            1080,
            SpecDetail::Socks5(UserPassConfig {
                username: "u".into(),
                password: "p".into(),
            }),
        );
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("n-"));
        assert_eq!(a.id.len(), 14);
    }

    #[test]
    fn test_stable_id_changes_with_secret() {
        let a = Spec::new(
            "",
            "1.2.3.4",
            8388,
            SpecDetail::Shadowsocks(ShadowsocksConfig {
                method: "aes-128-gcm".into(),
                password: "p1".into(),
            }),
        );
        let b = Spec::new(
            "",
            "1.2.3.4",
            8388,
            SpecDetail::Shadowsocks(ShadowsocksConfig {
                method: "aes-128-gcm".into(),
                password: "p2".into(),
            }),
        );
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let a = Spec::socks5("h.example", 1080);
        let b = a.clone().normalize().normalize();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_header_order_does_not_matter() {
        let mut h1 = BTreeMap::new();
        h1.insert("Host".to_string(), "x".to_string());
        h1.insert("User-Agent".to_string(), "y".to_string());
        let mut h2 = BTreeMap::new();
        h2.insert("User-Agent".to_string(), "y".to_string());
        h2.insert("Host".to_string(), "x".to_string());

        let mk = |headers| {
            Spec::new(
                "",
                "s",
                443,
                SpecDetail::Vmess(VmessConfig {
                    uuid: "uuid".into(),
                    alter_id: 0,
                    security: "auto".into(),
                    stream: StreamConfig {
                        tls: true,
                        network: "ws".into(),
                        ws_path: "/ws".into(),
                        headers,
                        ..Default::default()
                    },
                }),
            )
        };
        assert_eq!(mk(h1).id, mk(h2).id);
    }

    #[test]
    fn test_deduplicate_keeps_first_seen() {
        let a = Spec::socks5("a.example", 1080);
        let b = Spec::socks5("b.example", 1080);
        let dup = Spec::new("other name", "A.EXAMPLE", 1080, SpecDetail::Socks5(UserPassConfig::default()));

        let out = deduplicate(vec![a.clone(), b.clone(), dup]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, a.id);
        assert_eq!(out[1].id, b.id);
    }

    #[test]
    fn test_safe_summary_has_no_secrets() {
        let spec = Spec::new(
            "node",
            "x",
            443,
            SpecDetail::Trojan(TrojanConfig {
                password: "hunter2".into(),
                stream: StreamConfig {
                    tls: true,
                    server_name: "x".into(),
                    ..Default::default()
                },
            }),
        );
        let summary = serde_json::to_string(&spec.safe_summary()).unwrap();
        assert!(!summary.contains("hunter2"));
        assert!(summary.contains("\"sni\":\"x\""));
    }
}
