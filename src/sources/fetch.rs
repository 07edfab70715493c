use std::time::Duration;

use tracing::{info, warn};

use crate::error::{RotapoolError, RotapoolResult};

/// HTTP fetcher for source lists. Public proxy lists routinely sit behind
/// self-signed or expired certificates, so certificate errors are tolerated.
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Fetch newline-delimited proxy lists from every URL, skipping blank
    /// lines and `#` comments, stripping an optional `socks5://` prefix and
    /// deduplicating while preserving first-seen order. Individual URL
    /// failures are logged and skipped; only a fully empty result is an error.
    pub async fn fetch_lines(&self, urls: &[String]) -> RotapoolResult<Vec<String>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        info!(sources = urls.len(), "fetching proxy lists");
        for url in urls {
            let resp = match self.client.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %url, err = %e, "fetch failed");
                    continue;
                }
            };
            if resp.status() != reqwest::StatusCode::OK {
                warn!(url = %url, status = %resp.status(), "unexpected status");
                continue;
            }
            let body = match resp.text().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(url = %url, err = %e, "read body failed");
                    continue;
                }
            };

            let mut added = 0usize;
            for line in body.lines() {
                if let Some(addr) = normalize_line(line) {
                    if seen.insert(addr.clone()) {
                        out.push(addr);
                        added += 1;
                    }
                }
            }
            info!(url = %url, added, "fetched entries");
        }

        if out.is_empty() {
            return Err(RotapoolError::source("no proxies fetched from any source"));
        }
        Ok(out)
    }

    pub async fn fetch_bytes(&self, url: &str) -> RotapoolResult<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(RotapoolError::source(format!(
                "unexpected status: {}",
                resp.status()
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// One raw list line to a bare `host:port`, or None for comments and blanks.
pub fn normalize_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line.strip_prefix("socks5://").unwrap_or(line).to_string())
}
