use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Upstream selection strategy for non-sticky requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
}

/// What to do with a sticky session when its pinned upstream fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Failover {
    /// Rebind the session to the next ranked upstream.
    #[default]
    Soft,
    /// Keep the top-ranked choice; surface the failure instead.
    Hard,
}

/// Session-to-upstream binding mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyMode {
    /// Stateless highest-random-weight ranking over the eligible set.
    #[default]
    Rendezvous,
    /// TTL'd LRU table from session key to upstream id.
    Lru,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub retries: usize,
    #[serde(default)]
    pub failure_backoff_seconds: u64,
    #[serde(default)]
    pub max_backoff_seconds: u64,
    #[serde(default)]
    pub retry_non_idempotent: bool,
    #[serde(default)]
    pub sticky: StickyConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StickyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: StickyMode,
    #[serde(default)]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub max_entries: usize,
    /// None means allowed; explicit false disables the per-request
    /// X-EasyProxyPool-* control headers.
    #[serde(default)]
    pub header_override: Option<bool>,
    #[serde(default)]
    pub failover: Failover,
}

impl StickyConfig {
    pub fn header_override_allowed(&self) -> bool {
        self.header_override.unwrap_or(true)
    }
}

impl SelectionConfig {
    pub fn apply_defaults(&mut self) {
        if self.failure_backoff_seconds == 0 {
            self.failure_backoff_seconds = 30;
        }
        if self.max_backoff_seconds == 0 {
            self.max_backoff_seconds = 600;
        }
        if self.sticky.ttl_seconds == 0 {
            self.sticky.ttl_seconds = 600;
        }
        if self.sticky.max_entries == 0 {
            self.sticky.max_entries = 4096;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_backoff_seconds < self.failure_backoff_seconds {
            return Err(anyhow::anyhow!(
                "selection.max_backoff_seconds must be >= failure_backoff_seconds"
            ));
        }
        Ok(())
    }
}
