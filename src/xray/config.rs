//! Deterministic xray configuration generation.
//!
//! The serialized document is the identity of a running child process: same
//! node set and options produce byte-identical JSON and therefore the same
//! hash, which `ensure` uses to decide between no-op and restart.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::ObservatoryConfig;
use crate::error::{RotapoolError, RotapoolResult};
use crate::proxy::Mode;
use crate::upstream::{Spec, SpecDetail, StreamConfig};

const INBOUND_TAG: &str = "socks-in";

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub mode: Mode,
    pub socks_listen: String,
    pub metrics_listen: String,
    pub user_password: String,
    pub max_nodes: usize,
    pub observatory: ObservatoryConfig,
}

#[derive(Debug, Default)]
pub struct Generated {
    pub config_json: Vec<u8>,
    pub hash: String,
    pub included: Vec<String>,
    pub skipped: HashMap<String, usize>,
}

pub fn generate(specs: &[Spec], opt: &GenerateOptions) -> RotapoolResult<Generated> {
    if opt.socks_listen.trim().is_empty() {
        return Err(RotapoolError::adapter("missing socks listen"));
    }
    if opt.metrics_listen.trim().is_empty() {
        return Err(RotapoolError::adapter("missing metrics listen"));
    }
    if opt.user_password.trim().is_empty() {
        return Err(RotapoolError::adapter("missing user password"));
    }
    let max_nodes = if opt.max_nodes == 0 { 2000 } else { opt.max_nodes };

    let mut gen = Generated::default();

    let mut nodes: Vec<Spec> = Vec::with_capacity(specs.len());
    for spec in specs {
        let spec = if spec.id.trim().is_empty() {
            spec.clone().normalize()
        } else {
            spec.clone()
        };
        if build_outbound(&spec, opt.mode).is_none() {
            *gen.skipped.entry(spec.kind().as_str().to_string()).or_insert(0) += 1;
            continue;
        }
        nodes.push(spec);
    }

    if nodes.len() > max_nodes {
        return Err(RotapoolError::adapter(format!(
            "too many nodes: {} > max_nodes={}",
            nodes.len(),
            max_nodes
        )));
    }

    // Stable ordering keeps the config hash stable.
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let mut accounts = Vec::with_capacity(nodes.len());
    let mut outbounds = Vec::with_capacity(nodes.len() + 1);
    let mut rules = Vec::with_capacity(nodes.len() + 1);

    for node in &nodes {
        accounts.push(json!({ "user": node.id, "pass": opt.user_password }));
        outbounds.push(build_outbound(node, opt.mode).unwrap_or(Value::Null));
        rules.push(json!({
            "type": "field",
            "inboundTag": [INBOUND_TAG],
            "user": [node.id],
            "outboundTag": node.id,
        }));
        gen.included.push(node.id.clone());
    }

    // Unmatched users fall through to a direct outbound.
    outbounds.push(json!({ "tag": "direct", "protocol": "freedom" }));
    rules.push(json!({
        "type": "field",
        "inboundTag": [INBOUND_TAG],
        "outboundTag": "direct",
    }));

    let mut root = Map::new();
    root.insert("log".into(), json!({ "loglevel": "warning" }));
    root.insert(
        "inbounds".into(),
        json!([{
            "listen": host_part(&opt.socks_listen),
            "port": port_part(&opt.socks_listen),
            "protocol": "socks",
            "tag": INBOUND_TAG,
            "settings": {
                "auth": "password",
                "udp": true,
                "accounts": accounts,
            },
        }]),
    );
    root.insert(
        "routing".into(),
        json!({ "domainStrategy": "AsIs", "rules": rules }),
    );
    root.insert("outbounds".into(), Value::Array(outbounds));
    root.insert(
        "metrics".into(),
        json!({ "tag": "metrics", "listen": opt.metrics_listen }),
    );

    match opt.observatory.mode.trim().to_lowercase().as_str() {
        "observatory" => {
            root.insert(
                "observatory".into(),
                json!({
                    "subjectSelector": ["n-"],
                    "probeUrl": opt.observatory.destination,
                    "probeInterval": format!("{}s", default_secs(opt.observatory.interval_seconds, 30)),
                }),
            );
        }
        _ => {
            let mut ping = Map::new();
            ping.insert("destination".into(), opt.observatory.destination.clone().into());
            ping.insert(
                "interval".into(),
                format!("{}s", default_secs(opt.observatory.interval_seconds, 30)).into(),
            );
            ping.insert("sampling".into(), opt.observatory.sampling.into());
            ping.insert(
                "timeout".into(),
                format!("{}s", default_secs(opt.observatory.timeout_seconds, 5)).into(),
            );
            root.insert(
                "burstObservatory".into(),
                json!({
                    "subjectSelector": ["n-"],
                    "pingConfig": Value::Object(ping),
                }),
            );
        }
    }

    let raw = serde_json::to_vec_pretty(&Value::Object(root))
        .map_err(|e| RotapoolError::adapter(format!("marshal xray config: {}", e)))?;
    let digest = Sha256::digest(&raw);
    gen.hash = hex::encode(digest)[..12].to_string();
    gen.config_json = raw;
    Ok(gen)
}

fn build_outbound(spec: &Spec, mode: Mode) -> Option<Value> {
    match &spec.detail {
        SpecDetail::Socks5(c) | SpecDetail::Http(c) => {
            let mut server = Map::new();
            server.insert("address".into(), spec.server.clone().into());
            server.insert("port".into(), spec.port.into());
            if !c.username.trim().is_empty() || !c.password.trim().is_empty() {
                server.insert(
                    "users".into(),
                    json!([{ "user": c.username, "pass": c.password }]),
                );
            }
            let protocol = match spec.detail {
                SpecDetail::Socks5(_) => "socks",
                _ => "http",
            };
            Some(json!({
                "tag": spec.id,
                "protocol": protocol,
                "settings": { "servers": [Value::Object(server)] },
            }))
        }

        SpecDetail::Shadowsocks(c) => Some(json!({
            "tag": spec.id,
            "protocol": "shadowsocks",
            "settings": {
                "servers": [{
                    "address": spec.server,
                    "port": spec.port,
                    "method": c.method,
                    "password": c.password,
                }],
            },
        })),

        SpecDetail::Trojan(c) => {
            let mut out = json!({
                "tag": spec.id,
                "protocol": "trojan",
                "settings": {
                    "servers": [{
                        "address": spec.server,
                        "port": spec.port,
                        "password": c.password,
                    }],
                },
            });
            out.as_object_mut().unwrap().insert(
                "streamSettings".into(),
                build_stream_settings(&c.stream, true, mode),
            );
            Some(out)
        }

        SpecDetail::Vmess(c) => {
            let user = json!({
                "id": c.uuid,
                "alterId": c.alter_id,
                "security": c.security,
            });
            let mut out = json!({
                "tag": spec.id,
                "protocol": "vmess",
                "settings": {
                    "vnext": [{
                        "address": spec.server,
                        "port": spec.port,
                        "users": [user],
                    }],
                },
            });
            out.as_object_mut().unwrap().insert(
                "streamSettings".into(),
                build_stream_settings(&c.stream, c.stream.tls, mode),
            );
            Some(out)
        }

        SpecDetail::Vless(c) => {
            let mut user = Map::new();
            user.insert("id".into(), c.uuid.clone().into());
            user.insert("encryption".into(), "none".into());
            if !c.flow.trim().is_empty() {
                user.insert("flow".into(), c.flow.clone().into());
            }
            let mut out = json!({
                "tag": spec.id,
                "protocol": "vless",
                "settings": {
                    "vnext": [{
                        "address": spec.server,
                        "port": spec.port,
                        "users": [Value::Object(user)],
                    }],
                },
            });
            out.as_object_mut().unwrap().insert(
                "streamSettings".into(),
                build_stream_settings(&c.stream, c.stream.tls, mode),
            );
            Some(out)
        }
    }
}

fn build_stream_settings(stream: &StreamConfig, tls_enabled: bool, mode: Mode) -> Value {
    let network = {
        let n = stream.network.trim().to_lowercase();
        if n.is_empty() {
            "tcp".to_string()
        } else {
            n
        }
    };

    let mut out = Map::new();
    out.insert("network".into(), network.clone().into());

    if network == "ws" {
        let mut ws = Map::new();
        ws.insert("path".into(), stream.ws_path.clone().into());
        if !stream.headers.is_empty() {
            let headers: Map<String, Value> = stream
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect();
            ws.insert("headers".into(), Value::Object(headers));
        }
        out.insert("wsSettings".into(), Value::Object(ws));
    }

    if tls_enabled {
        out.insert("security".into(), "tls".into());
        let allow_insecure = stream.skip_cert_verify || mode == Mode::Relaxed;
        let mut tls_settings = Map::new();
        tls_settings.insert("allowInsecure".into(), allow_insecure.into());
        if !stream.server_name.trim().is_empty() {
            tls_settings.insert("serverName".into(), stream.server_name.clone().into());
        }
        out.insert("tlsSettings".into(), Value::Object(tls_settings));
    }

    Value::Object(out)
}

fn host_part(addr: &str) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => host.to_string(),
        None => addr.to_string(),
    }
}

fn port_part(addr: &str) -> u16 {
    addr.rsplit_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(0)
}

fn default_secs(v: u64, def: u64) -> u64 {
    if v == 0 {
        def
    } else {
        v
    }
}
