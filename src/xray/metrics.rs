//! Client for the xray expvar metrics endpoint.
//!
//! Node liveness comes from the `observatory` object in `/debug/vars`,
//! keyed by outbound tag. A build without the observatory enabled simply
//! yields an empty map.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{RotapoolError, RotapoolResult};

#[derive(Debug, Clone, Default)]
pub struct NodeHealth {
    pub alive: bool,
    pub delay: Duration,
    pub last_seen: Option<SystemTime>,
    pub last_try: Option<SystemTime>,
    pub outbound_tag: String,
}

pub fn parse_debug_vars(data: &[u8]) -> RotapoolResult<HashMap<String, NodeHealth>> {
    let root: Value = serde_json::from_slice(data)
        .map_err(|e| RotapoolError::adapter(format!("parse /debug/vars: {}", e)))?;

    let obs = match root.get("observatory").and_then(Value::as_object) {
        Some(o) => o,
        None => return Ok(HashMap::new()),
    };

    let mut out = HashMap::with_capacity(obs.len());
    for (tag, v) in obs {
        let m = match v.as_object() {
            Some(m) => m,
            None => continue,
        };
        out.insert(
            tag.clone(),
            NodeHealth {
                outbound_tag: tag.clone(),
                alive: m.get("alive").and_then(Value::as_bool).unwrap_or(false),
                delay: Duration::from_millis(
                    m.get("delay").and_then(Value::as_u64).unwrap_or(0),
                ),
                last_seen: from_unix_seconds(m.get("last_seen_time")),
                last_try: from_unix_seconds(m.get("last_try_time")),
            },
        );
    }
    Ok(out)
}

fn from_unix_seconds(v: Option<&Value>) -> Option<SystemTime> {
    let secs = v?.as_i64()?;
    if secs <= 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

pub struct MetricsClient {
    base: String,
    client: reqwest::Client,
}

impl MetricsClient {
    pub fn new(listen: impl AsRef<str>) -> Self {
        Self {
            base: format!("http://{}", listen.as_ref().trim()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn fetch(&self) -> RotapoolResult<HashMap<String, NodeHealth>> {
        let url = format!("{}/debug/vars", self.base);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RotapoolError::adapter(format!("fetch metrics: {}", e)))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(RotapoolError::adapter(format!(
                "unexpected status: {}",
                resp.status()
            )));
        }
        let data = resp
            .bytes()
            .await
            .map_err(|e| RotapoolError::adapter(format!("read metrics: {}", e)))?;
        parse_debug_vars(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_observatory() {
        let data = br#"{
            "observatory": {
                "n-abc123def456": {
                    "alive": true,
                    "delay": 230,
                    "outbound_tag": "n-abc123def456",
                    "last_seen_time": 1700000000,
                    "last_try_time": 1700000030
                },
                "n-dead00000000": {
                    "alive": false,
                    "delay": 99999
                }
            },
            "stats": {}
        }"#;
        let map = parse_debug_vars(data).unwrap();
        assert_eq!(map.len(), 2);

        let ok = &map["n-abc123def456"];
        assert!(ok.alive);
        assert_eq!(ok.delay, Duration::from_millis(230));
        assert!(ok.last_seen.is_some());

        let dead = &map["n-dead00000000"];
        assert!(!dead.alive);
        assert!(dead.last_seen.is_none());
    }

    #[test]
    fn test_missing_observatory_is_empty() {
        let map = parse_debug_vars(br#"{"stats": {}}"#).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_bad_json_is_error() {
        assert!(parse_debug_vars(b"not json").is_err());
    }
}
