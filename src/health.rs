//! Single-upstream health probe: a TLS handshake to a canary target dialed
//! through the candidate SOCKS5 upstream.
//!
//! The probe doubles as a latency filter: a handshake that completes but
//! takes longer than the threshold still fails the check.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustls::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{RotapoolError, RotapoolResult};
use crate::proxy::dialer::{socks5_connect, split_host_port};
use crate::tls;

/// Seam between the updater and the probe, so refresh logic is testable
/// without the network.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, upstream_addr: &str, strict: bool) -> (bool, Duration);
}

pub struct HealthChecker {
    target_addr: String,
    server_name: String,
    total_timeout: Duration,
    threshold: Duration,
}

impl HealthChecker {
    pub fn new(
        target_addr: impl Into<String>,
        server_name: impl Into<String>,
        total_timeout: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            target_addr: target_addr.into(),
            server_name: server_name.into(),
            total_timeout,
            threshold,
        }
    }

    async fn dial_and_handshake(&self, upstream_addr: &str, strict: bool) -> RotapoolResult<Duration> {
        let (host, port) = split_host_port(&self.target_addr)?;
        let server_name = ServerName::try_from(self.server_name.as_str())
            .map_err(|e| RotapoolError::health(format!("bad server name: {}", e)))?;

        let start = Instant::now();
        // No upstream auth at this layer; the probe speaks plain SOCKS5.
        let stream = socks5_connect(upstream_addr, None, &host, port).await?;

        let connector = TlsConnector::from(tls::client_config(strict));
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| RotapoolError::health(format!("tls handshake: {}", e)))?;
        drop(tls_stream);

        Ok(start.elapsed())
    }

    /// A completed handshake still fails the check above the latency
    /// threshold; the measured latency is reported either way.
    fn judge(&self, latency: Duration) -> (bool, Duration) {
        (latency <= self.threshold, latency)
    }
}

#[async_trait]
impl HealthProbe for HealthChecker {
    async fn check(&self, upstream_addr: &str, strict: bool) -> (bool, Duration) {
        match tokio::time::timeout(self.total_timeout, self.dial_and_handshake(upstream_addr, strict))
            .await
        {
            Ok(Ok(latency)) => {
                let (ok, latency) = self.judge(latency);
                if !ok {
                    debug!(upstream = upstream_addr, ?latency, "handshake above threshold");
                }
                (ok, latency)
            }
            Ok(Err(e)) => {
                debug!(upstream = upstream_addr, strict, err = %e, "probe failed");
                (false, Duration::ZERO)
            }
            Err(_) => {
                debug!(upstream = upstream_addr, strict, "probe deadline exceeded");
                (false, Duration::ZERO)
            }
        }
    }
}
