//! Per-request routing policy: inbound credentials and the proprietary
//! control headers, all parsed before anything is forwarded upstream.

use base64::Engine as _;
use hyper::HeaderMap;

use crate::config::{AuthConfig, Failover, SelectionConfig};
use crate::error::{RotapoolError, RotapoolResult};

pub const HEADER_STICKY: &str = "x-easyproxypool-sticky";
pub const HEADER_FAILOVER: &str = "x-easyproxypool-failover";
pub const HEADER_UPSTREAM: &str = "x-easyproxypool-upstream";
pub const HEADER_SESSION: &str = "x-easyproxypool-session";

/// Inbound credential check shared by both fronts.
#[derive(Debug, Clone)]
pub enum CredentialStore {
    Basic { username: String, password: String },
    SharedPassword { password: String },
}

impl CredentialStore {
    /// None means auth is disabled.
    pub fn from_auth(auth: &AuthConfig) -> Option<Self> {
        match auth.effective_mode() {
            "basic" => Some(Self::Basic {
                username: auth.username.clone(),
                password: auth.password.clone(),
            }),
            "shared_password" => Some(Self::SharedPassword {
                password: auth.password.clone(),
            }),
            _ => None,
        }
    }

    pub fn valid(&self, username: &str, password: &str) -> bool {
        match self {
            Self::Basic {
                username: u,
                password: p,
            } => username == u && password == p,
            Self::SharedPassword { password: p } => password == p,
        }
    }
}

/// Decode a `Basic <base64(user:pass)>` credential value.
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct RequestPolicy {
    pub session_key: String,
    pub force_sticky: Option<bool>,
    pub failover: Failover,
    pub force_upstream: Option<String>,
}

/// Extract the routing policy from request headers. Control headers are only
/// honored when `sticky.header_override` allows; invalid values are client
/// protocol errors.
pub fn policy_from_request(
    selection: &SelectionConfig,
    headers: &HeaderMap,
) -> RotapoolResult<RequestPolicy> {
    let mut policy = RequestPolicy {
        failover: selection.sticky.failover,
        ..Default::default()
    };

    let header_override = selection.sticky.header_override_allowed();

    if header_override {
        if let Some(v) = header_str(headers, HEADER_SESSION) {
            policy.session_key = v.to_string();
        }
    }
    if policy.session_key.is_empty() {
        if let Some((user, _)) = headers
            .get(hyper::header::PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic_auth)
        {
            policy.session_key = user;
        }
    }
    if policy.session_key.is_empty() {
        if let Some(v) = header_str(headers, "traceparent") {
            if let Some(trace_id) = parse_trace_id(v) {
                policy.session_key = trace_id;
            }
        }
    }

    if !header_override {
        return Ok(policy);
    }

    if let Some(v) = header_str(headers, HEADER_UPSTREAM) {
        policy.force_upstream = Some(v.to_string());
    }

    if let Some(v) = header_str(headers, HEADER_STICKY) {
        match parse_bool_like(v) {
            Some(b) => policy.force_sticky = Some(b),
            None => {
                return Err(RotapoolError::proxy(
                    "invalid X-EasyProxyPool-Sticky (use on/off)",
                ))
            }
        }
    }

    if let Some(v) = header_str(headers, HEADER_FAILOVER) {
        match v.to_lowercase().as_str() {
            "soft" => policy.failover = Failover::Soft,
            "hard" => policy.failover = Failover::Hard,
            _ => {
                return Err(RotapoolError::proxy(
                    "invalid X-EasyProxyPool-Failover (use soft/hard)",
                ))
            }
        }
    }

    Ok(policy)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extract the trace-id from a W3C `traceparent` value: 32 lowercase hex
/// chars, all-zero rejected. Multiple comma-separated values take the first.
pub fn parse_trace_id(value: &str) -> Option<String> {
    let value = value.trim();
    let value = match value.find(',') {
        Some(idx) => value[..idx].trim(),
        None => value,
    };
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    let trace_id = parts[1].trim();
    if trace_id.len() != 32 {
        return None;
    }
    let mut all_zero = true;
    for c in trace_id.chars() {
        if !c.is_ascii_hexdigit() {
            return None;
        }
        if c != '0' {
            all_zero = false;
        }
    }
    if all_zero {
        return None;
    }
    Some(trace_id.to_lowercase())
}

pub fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}
