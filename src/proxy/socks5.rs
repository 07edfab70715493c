//! SOCKS5 inbound front end.
//!
//! Accepts CONNECT requests, picks an upstream from the mode's pool, dials
//! the target through it and splices both directions. UDP ASSOCIATE and
//! BIND are refused with reply 0x07.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, SelectionConfig};
use crate::error::{RotapoolError, RotapoolResult};
use crate::pool::Pool;
use crate::proxy::dialer::dial_through_socks5;
use crate::proxy::policy::CredentialStore;
use crate::proxy::Mode;

const VER: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Socks5Proxy {
    mode: Mode,
    pool: Arc<Pool>,
    selection: SelectionConfig,
    creds: Option<CredentialStore>,
}

impl Socks5Proxy {
    pub fn new(mode: Mode, pool: Arc<Pool>, auth: &AuthConfig, selection: SelectionConfig) -> Self {
        Self {
            mode,
            pool,
            selection,
            creds: CredentialStore::from_auth(auth),
        }
    }

    /// Bind the listener and run the accept loop on its own task. Returns
    /// the bound address (useful with port 0) and the loop handle.
    pub async fn start(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> RotapoolResult<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(component = "socks5", mode = %self.mode, addr = %local_addr, "listening");

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_conn(stream).await {
                                    debug!(component = "socks5", mode = %this.mode, peer = %peer, err = %e, "connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(component = "socks5", err = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
            info!(component = "socks5", mode = %self.mode, addr = %local_addr, "listener closed");
        });

        Ok((local_addr, handle))
    }

    async fn handle_conn(&self, mut client: TcpStream) -> RotapoolResult<()> {
        let (host, port) = self.negotiate(&mut client).await?;

        let mut last_err: Option<RotapoolError> = None;
        for _attempt in 0..=self.selection.retries {
            let now = Instant::now();
            let entry = match self.pool.next(self.selection.strategy, now) {
                Some(e) => e,
                None => {
                    reply(&mut client, REP_GENERAL_FAILURE).await?;
                    return Err(RotapoolError::socks("no upstreams available"));
                }
            };

            match dial_through_socks5(&entry, &host, port, UPSTREAM_DIAL_TIMEOUT).await {
                Ok(mut upstream) => {
                    self.pool.mark_success(&entry.id);
                    reply(&mut client, REP_SUCCESS).await?;
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                    return Ok(());
                }
                Err(e) => {
                    self.pool.mark_failure(
                        &entry.id,
                        now,
                        Duration::from_secs(self.selection.failure_backoff_seconds),
                        Duration::from_secs(self.selection.max_backoff_seconds),
                    );
                    debug!(component = "socks5", upstream = %entry.id, err = %e, "upstream dial failed");
                    last_err = Some(e);
                }
            }
        }

        reply(&mut client, REP_GENERAL_FAILURE).await?;
        Err(last_err.unwrap_or_else(|| RotapoolError::socks("all attempts failed")))
    }

    /// Greeting, optional RFC 1929 auth, and the CONNECT request. Returns
    /// the decoded target.
    async fn negotiate(&self, client: &mut TcpStream) -> RotapoolResult<(String, u16)> {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await?;
        if head[0] != VER {
            return Err(RotapoolError::socks("not socks5"));
        }
        let mut methods = vec![0u8; head[1] as usize];
        client.read_exact(&mut methods).await?;

        match &self.creds {
            Some(store) => {
                if !methods.contains(&METHOD_USERPASS) {
                    client.write_all(&[VER, METHOD_UNACCEPTABLE]).await?;
                    return Err(RotapoolError::socks("client does not offer userpass auth"));
                }
                client.write_all(&[VER, METHOD_USERPASS]).await?;

                let mut ver_ulen = [0u8; 2];
                client.read_exact(&mut ver_ulen).await?;
                let mut user = vec![0u8; ver_ulen[1] as usize];
                client.read_exact(&mut user).await?;
                let mut plen = [0u8; 1];
                client.read_exact(&mut plen).await?;
                let mut pass = vec![0u8; plen[0] as usize];
                client.read_exact(&mut pass).await?;

                let user = String::from_utf8_lossy(&user);
                let pass = String::from_utf8_lossy(&pass);
                if !store.valid(&user, &pass) {
                    client.write_all(&[0x01, 0x01]).await?;
                    return Err(RotapoolError::socks("auth rejected"));
                }
                client.write_all(&[0x01, 0x00]).await?;
            }
            None => {
                client.write_all(&[VER, METHOD_NONE]).await?;
            }
        }

        let mut req = [0u8; 4];
        client.read_exact(&mut req).await?;
        if req[0] != VER {
            return Err(RotapoolError::socks("bad request version"));
        }
        if req[1] != CMD_CONNECT {
            reply(client, REP_COMMAND_NOT_SUPPORTED).await?;
            return Err(RotapoolError::socks("only CONNECT is supported"));
        }

        let host = match req[3] {
            0x01 => {
                let mut ip = [0u8; 4];
                client.read_exact(&mut ip).await?;
                std::net::Ipv4Addr::from(ip).to_string()
            }
            0x03 => {
                let mut len = [0u8; 1];
                client.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                client.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).to_string()
            }
            0x04 => {
                let mut ip = [0u8; 16];
                client.read_exact(&mut ip).await?;
                std::net::Ipv6Addr::from(ip).to_string()
            }
            _ => {
                reply(client, REP_ATYP_NOT_SUPPORTED).await?;
                return Err(RotapoolError::socks("bad atyp"));
            }
        };

        let mut port_buf = [0u8; 2];
        client.read_exact(&mut port_buf).await?;
        Ok((host, u16::from_be_bytes(port_buf)))
    }
}

async fn reply(client: &mut TcpStream, code: u8) -> RotapoolResult<()> {
    // BND.ADDR is 0.0.0.0:0; clients do not use it for CONNECT.
    client
        .write_all(&[VER, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use crate::pool::Entry;

    fn test_selection() -> SelectionConfig {
        let mut sel = SelectionConfig {
            strategy: Strategy::RoundRobin,
            retries: 1,
            ..Default::default()
        };
        sel.apply_defaults();
        sel
    }

    async fn socks5_client_connect(
        addr: SocketAddr,
        auth: Option<(&str, &str)>,
        host: &str,
        port: u16,
    ) -> RotapoolResult<TcpStream> {
        let entry = match auth {
            Some((u, p)) => Entry::new("front", addr.to_string()).with_credentials(u, p),
            None => Entry::new("front", addr.to_string()),
        };
        dial_through_socks5(&entry, host, port, Duration::from_secs(2)).await
    }

    #[tokio::test]
    async fn test_no_upstream_yields_general_failure() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let pool = Arc::new(Pool::new("strict"));
            let proxy = Arc::new(Socks5Proxy::new(
                Mode::Strict,
                pool,
                &AuthConfig::default(),
                test_selection(),
            ));
            let (_tx, rx) = watch::channel(false);
            let (addr, _handle) = proxy
                .start("127.0.0.1:0".parse().unwrap(), rx)
                .await
                .unwrap();

            let err = socks5_client_connect(addr, None, "example.com", 80)
                .await
                .unwrap_err();
            assert!(matches!(err, RotapoolError::Socks { .. }));
        })
        .await
        .expect("test_no_upstream_yields_general_failure timed out");
    }

    #[tokio::test]
    async fn test_auth_rejection() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let pool = Arc::new(Pool::new("strict"));
            let auth = AuthConfig {
                mode: "basic".into(),
                username: "u".into(),
                password: "p".into(),
            };
            let proxy = Arc::new(Socks5Proxy::new(Mode::Strict, pool, &auth, test_selection()));
            let (_tx, rx) = watch::channel(false);
            let (addr, _handle) = proxy
                .start("127.0.0.1:0".parse().unwrap(), rx)
                .await
                .unwrap();

            let err = socks5_client_connect(addr, Some(("u", "wrong")), "example.com", 80)
                .await
                .unwrap_err();
            assert!(matches!(err, RotapoolError::Socks { .. }));
        })
        .await
        .expect("test_auth_rejection timed out");
    }
}
