//! Clash subscription parser.
//!
//! Clash YAML in the wild is loosely typed: ports arrive as integers or
//! strings, booleans as booleans or "true"/"1", header maps in several
//! shapes. Each accessor below accepts the full variant set and yields the
//! canonical typed value; a malformed proxy entry fails alone and is
//! reported as a problem instead of failing the whole subscription.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{RotapoolError, RotapoolResult};
use crate::upstream::{
    deduplicate, ShadowsocksConfig, Spec, SpecDetail, StreamConfig, TrojanConfig, UserPassConfig,
    VlessConfig, VmessConfig,
};

#[derive(Debug, Default)]
pub struct ParseReport {
    pub specs: Vec<Spec>,
    pub skipped_by_type: HashMap<String, usize>,
    pub problems: Vec<String>,
}

#[derive(Deserialize)]
struct ClashDocument {
    #[serde(default)]
    proxies: Vec<Value>,
}

pub fn parse_yaml(data: &[u8]) -> RotapoolResult<ParseReport> {
    let doc: ClashDocument = serde_yaml::from_slice(data)
        .map_err(|e| RotapoolError::source(format!("parse clash yaml: {}", e)))?;

    let mut report = ParseReport::default();

    for raw in &doc.proxies {
        let name = get_string(raw, &["name"]);
        let kind = get_string(raw, &["type"]).to_lowercase();
        if kind.trim().is_empty() {
            report
                .problems
                .push(format!("proxy(name={:?}): missing type", name));
            continue;
        }

        match parse_proxy(raw, &name, &kind, &mut report) {
            Some(spec) => report.specs.push(spec.normalize()),
            None => {
                *report.skipped_by_type.entry(kind).or_insert(0) += 1;
            }
        }
    }

    report.specs = deduplicate(std::mem::take(&mut report.specs));
    Ok(report)
}

fn parse_proxy(raw: &Value, name: &str, kind: &str, report: &mut ParseReport) -> Option<Spec> {
    let server = get_string(raw, &["server"]);
    let port = get_int(raw, &["port"]);

    let port = match u16::try_from(port) {
        Ok(p) if p > 0 => p,
        _ => {
            if matches!(kind, "socks5" | "http" | "ss" | "vmess" | "vless" | "trojan") {
                report.problems.push(format!(
                    "proxy(name={:?},type={}): missing server/port",
                    name, kind
                ));
            }
            return None;
        }
    };
    if server.is_empty() {
        report.problems.push(format!(
            "proxy(name={:?},type={}): missing server/port",
            name, kind
        ));
        return None;
    }

    match kind {
        "socks5" => Some(Spec::new(
            name,
            server,
            port,
            SpecDetail::Socks5(UserPassConfig {
                username: get_string(raw, &["username"]),
                password: get_string(raw, &["password"]),
            }),
        )),

        "http" => Some(Spec::new(
            name,
            server,
            port,
            SpecDetail::Http(UserPassConfig {
                username: get_string(raw, &["username"]),
                password: get_string(raw, &["password"]),
            }),
        )),

        "ss" => {
            let method = get_string(raw, &["cipher"]);
            let password = get_string(raw, &["password"]);
            if method.is_empty() || password.is_empty() {
                report.problems.push(format!(
                    "proxy(name={:?},type=ss): missing cipher/password",
                    name
                ));
                return None;
            }
            Some(Spec::new(
                name,
                server,
                port,
                SpecDetail::Shadowsocks(ShadowsocksConfig { method, password }),
            ))
        }

        "vmess" => {
            let uuid = get_string(raw, &["uuid"]);
            if uuid.is_empty() {
                report
                    .problems
                    .push(format!("proxy(name={:?},type=vmess): missing uuid", name));
                return None;
            }
            let mut security = get_string(raw, &["cipher"]);
            if security.is_empty() {
                security = get_string(raw, &["security"]);
            }
            if security.is_empty() {
                security = "auto".to_string();
            }
            Some(Spec::new(
                name,
                server,
                port,
                SpecDetail::Vmess(VmessConfig {
                    uuid,
                    alter_id: get_int(raw, &["alterId", "alter_id", "aid"]),
                    security,
                    stream: parse_stream(raw, get_bool(raw, &["tls"])),
                }),
            ))
        }

        "vless" => {
            let uuid = get_string(raw, &["uuid"]);
            if uuid.is_empty() {
                report
                    .problems
                    .push(format!("proxy(name={:?},type=vless): missing uuid", name));
                return None;
            }
            Some(Spec::new(
                name,
                server,
                port,
                SpecDetail::Vless(VlessConfig {
                    uuid,
                    flow: get_string(raw, &["flow"]),
                    stream: parse_stream(raw, get_bool(raw, &["tls"])),
                }),
            ))
        }

        "trojan" => {
            let password = get_string(raw, &["password"]);
            if password.is_empty() {
                report.problems.push(format!(
                    "proxy(name={:?},type=trojan): missing password",
                    name
                ));
                return None;
            }
            // trojan implies tls
            Some(Spec::new(
                name,
                server,
                port,
                SpecDetail::Trojan(TrojanConfig {
                    password,
                    stream: parse_stream(raw, true),
                }),
            ))
        }

        _ => None,
    }
}

fn parse_stream(raw: &Value, tls: bool) -> StreamConfig {
    let (ws_path, headers) = parse_ws_opts(raw);
    StreamConfig {
        tls,
        skip_cert_verify: get_bool(raw, &["skip-cert-verify", "skip_cert_verify"]),
        server_name: {
            let sni = get_string(raw, &["servername"]);
            if sni.is_empty() {
                get_string(raw, &["sni"])
            } else {
                sni
            }
        },
        network: get_string(raw, &["network"]),
        ws_path,
        headers,
    }
}

fn parse_ws_opts(raw: &Value) -> (String, BTreeMap<String, String>) {
    let opts = match raw.get("ws-opts") {
        Some(v) => v,
        None => return (String::new(), BTreeMap::new()),
    };
    let path = get_string(opts, &["path"]);
    let mut headers = BTreeMap::new();
    if let Some(Value::Mapping(map)) = opts.get("headers") {
        for (k, v) in map {
            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                headers.insert(k.to_string(), v.to_string());
            }
        }
    }
    (path, headers)
}

fn get_string(raw: &Value, keys: &[&str]) -> String {
    for key in keys {
        let v = match raw.get(key) {
            Some(v) => v,
            None => continue,
        };
        match v {
            Value::String(s) => return s.trim().to_string(),
            Value::Number(n) => return n.to_string(),
            Value::Bool(b) => return b.to_string(),
            _ => continue,
        }
    }
    String::new()
}

fn get_int(raw: &Value, keys: &[&str]) -> i64 {
    for key in keys {
        let v = match raw.get(key) {
            Some(v) => v,
            None => continue,
        };
        match v {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return i;
                }
                if let Some(f) = n.as_f64() {
                    return f as i64;
                }
            }
            Value::String(s) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    if i != 0 {
                        return i;
                    }
                }
            }
            _ => continue,
        }
    }
    0
}

fn get_bool(raw: &Value, keys: &[&str]) -> bool {
    for key in keys {
        let v = match raw.get(key) {
            Some(v) => v,
            None => continue,
        };
        match v {
            Value::Bool(b) => return *b,
            Value::String(s) => {
                if matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "y") {
                    return true;
                }
            }
            _ => continue,
        }
    }
    false
}
