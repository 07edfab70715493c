//! Source resolution: turns the configured source list into normalized
//! upstream specs.

pub mod clash;
pub mod fetch;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use crate::config::SourceConfig;
use crate::error::{RotapoolError, RotapoolResult};
use crate::upstream::{deduplicate, Spec, SpecDetail, UserPassConfig};

pub use fetch::Fetcher;

/// Aggregated result of one load pass over every configured source.
#[derive(Debug, Default)]
pub struct SourceOutcome {
    pub specs: Vec<Spec>,
    pub problems: Vec<String>,
    pub skipped_by_type: HashMap<String, usize>,
}

/// Seam between the updater and the source machinery.
#[async_trait]
pub trait SpecSource: Send + Sync {
    async fn load(&self) -> RotapoolResult<SourceOutcome>;
}

pub struct Loader {
    fetcher: Fetcher,
    sources: Vec<SourceConfig>,
    proxy_list_urls: Vec<String>,
}

impl Loader {
    pub fn new(sources: Vec<SourceConfig>, proxy_list_urls: Vec<String>) -> Self {
        Self {
            fetcher: Fetcher::new(),
            sources,
            proxy_list_urls,
        }
    }

    async fn load_raw_list(&self, src: &SourceConfig, out: &mut SourceOutcome) -> RotapoolResult<()> {
        let lines: Vec<String> = if !src.url.is_empty() {
            self.fetcher.fetch_lines(std::slice::from_ref(&src.url)).await?
        } else {
            let content = tokio::fs::read_to_string(&src.path)
                .await
                .map_err(|e| RotapoolError::source(format!("raw_list open file: {}", e)))?;
            content.lines().filter_map(fetch::normalize_line).collect()
        };

        for line in lines {
            match socks5_spec_from_addr(&line) {
                Some(spec) => out.specs.push(spec),
                None => out
                    .problems
                    .push(format!("raw_list: bad address {:?}", line)),
            }
        }
        Ok(())
    }

    async fn load_clash(&self, src: &SourceConfig, out: &mut SourceOutcome) -> RotapoolResult<()> {
        let data = if !src.url.is_empty() {
            self.fetcher.fetch_bytes(&src.url).await?
        } else {
            tokio::fs::read(&src.path)
                .await
                .map_err(|e| RotapoolError::source(format!("clash_yaml read file: {}", e)))?
        };
        let report = clash::parse_yaml(&data)?;
        out.problems.extend(report.problems);
        for (k, v) in report.skipped_by_type {
            *out.skipped_by_type.entry(k).or_insert(0) += v;
        }
        out.specs.extend(report.specs);
        Ok(())
    }
}

#[async_trait]
impl SpecSource for Loader {
    async fn load(&self) -> RotapoolResult<SourceOutcome> {
        let mut out = SourceOutcome::default();

        for src in &self.sources {
            match src.kind.trim().to_lowercase().as_str() {
                "raw_list" => self.load_raw_list(src, &mut out).await?,
                "clash_yaml" => self.load_clash(src, &mut out).await?,
                other => out.problems.push(format!(
                    "source(type={:?}): unsupported (use raw_list or clash_yaml)",
                    other
                )),
            }
        }

        if !self.proxy_list_urls.is_empty() {
            let lines = self.fetcher.fetch_lines(&self.proxy_list_urls).await?;
            for line in lines {
                match socks5_spec_from_addr(&line) {
                    Some(spec) => out.specs.push(spec),
                    None => out
                        .problems
                        .push(format!("proxy_list_urls: bad address {:?}", line)),
                }
            }
        }

        for p in &out.problems {
            warn!(msg = %p, "source problem");
        }

        out.specs = deduplicate(std::mem::take(&mut out.specs));
        if out.specs.is_empty() {
            return Err(RotapoolError::source("no usable entries from sources"));
        }
        Ok(out)
    }
}

/// Parse a bare `host:port` (optionally `socks5://`-prefixed) into an
/// unauthenticated SOCKS5 spec.
pub fn socks5_spec_from_addr(addr: &str) -> Option<Spec> {
    let addr = addr.trim().strip_prefix("socks5://").unwrap_or(addr.trim());
    let (host, port_str) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port_str.parse().ok().filter(|p| *p > 0)?;
    Some(Spec::new(
        "",
        host,
        port,
        SpecDetail::Socks5(UserPassConfig::default()),
    ))
}
