//! Loopback end-to-end tests: client -> front end -> fake SOCKS5 upstream
//! -> local target, with no real network involved.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use rotapool::config::{AuthConfig, SelectionConfig, Strategy};
use rotapool::pool::{Entry, Pool};
use rotapool::proxy::http::HttpProxy;
use rotapool::proxy::socks5::Socks5Proxy;
use rotapool::proxy::Mode;

/// A minimal no-auth SOCKS5 upstream that actually dials the requested
/// target and splices, so tunnels carry real bytes.
async fn spawn_fake_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut client, _) = match listener.accept().await {
                Ok(c) => c,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut head = [0u8; 2];
                client.read_exact(&mut head).await.ok()?;
                let mut methods = vec![0u8; head[1] as usize];
                client.read_exact(&mut methods).await.ok()?;
                client.write_all(&[0x05, 0x00]).await.ok()?;

                let mut req = [0u8; 4];
                client.read_exact(&mut req).await.ok()?;
                let host = match req[3] {
                    0x01 => {
                        let mut ip = [0u8; 4];
                        client.read_exact(&mut ip).await.ok()?;
                        std::net::Ipv4Addr::from(ip).to_string()
                    }
                    0x03 => {
                        let mut len = [0u8; 1];
                        client.read_exact(&mut len).await.ok()?;
                        let mut name = vec![0u8; len[0] as usize];
                        client.read_exact(&mut name).await.ok()?;
                        String::from_utf8_lossy(&name).to_string()
                    }
                    _ => return None,
                };
                let mut port = [0u8; 2];
                client.read_exact(&mut port).await.ok()?;
                let port = u16::from_be_bytes(port);

                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(mut target) => {
                        client
                            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                            .await
                            .ok()?;
                        let _ = tokio::io::copy_bidirectional(&mut client, &mut target).await;
                    }
                    Err(_) => {
                        client
                            .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                            .await
                            .ok()?;
                    }
                }
                Some(())
            });
        }
    });
    addr
}

/// Target that consumes its input to EOF, echoes it back, then closes.
/// Completes only if the tunnel forwards the client's half-close.
async fn spawn_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(c) => c,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if conn.read_to_end(&mut buf).await.is_ok() {
                    let _ = conn.write_all(&buf).await;
                }
            });
        }
    });
    addr
}

/// Plain HTTP/1.1 target answering every request with a fixed body.
async fn spawn_http_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(c) => c,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    seen.extend_from_slice(&buf[..n]);
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = conn
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nx-origin: target\r\nconnection: close\r\n\r\nhello",
                    )
                    .await;
            });
        }
    });
    addr
}

fn selection(retries: usize) -> SelectionConfig {
    let mut sel = SelectionConfig {
        strategy: Strategy::RoundRobin,
        retries,
        ..Default::default()
    };
    sel.apply_defaults();
    sel
}

fn single_entry_pool(name: &str, upstream: SocketAddr) -> Arc<Pool> {
    let pool = Arc::new(Pool::new(name.to_string()));
    pool.update(vec![Entry::new(upstream.to_string(), upstream.to_string())]);
    pool
}

async fn read_http_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

#[tokio::test]
async fn test_socks5_front_tunnels_and_forwards_half_close() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let upstream = spawn_fake_upstream().await;
        let echo = spawn_echo_target().await;
        let pool = single_entry_pool("relaxed", upstream);

        let front = Arc::new(Socks5Proxy::new(
            Mode::Relaxed,
            pool,
            &AuthConfig::default(),
            selection(0),
        ));
        let (_tx, rx) = watch::channel(false);
        let (front_addr, _handle) = front
            .start("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();

        // Speak SOCKS5 to the front by hand.
        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let ip = match echo.ip() {
            std::net::IpAddr::V4(v4) => v4.octets(),
            _ => panic!("expected v4"),
        };
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&ip);
        req.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00, "expected success reply");

        // Send payload, half-close, and expect the echo back: this only
        // works if every hop forwards the FIN instead of tearing down.
        client.write_all(b"ping-pong").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ping-pong");
    })
    .await
    .expect("test_socks5_front_tunnels_and_forwards_half_close timed out");
}

#[tokio::test]
async fn test_socks5_front_retries_to_next_upstream() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let good_upstream = spawn_fake_upstream().await;
        let echo = spawn_echo_target().await;

        // The dead upstream owns a bound-then-dropped port.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let pool = Arc::new(Pool::new("relaxed"));
        pool.update(vec![
            Entry::new(dead_addr.to_string(), dead_addr.to_string()),
            Entry::new(good_upstream.to_string(), good_upstream.to_string()),
        ]);

        let front = Arc::new(Socks5Proxy::new(
            Mode::Relaxed,
            Arc::clone(&pool),
            &AuthConfig::default(),
            selection(2),
        ));
        let (_tx, rx) = watch::channel(false);
        let (front_addr, _handle) = front
            .start("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();

        // Run a few connects; regardless of where the cursor starts, the
        // retry loop must land on the good upstream.
        for _ in 0..3 {
            let mut client = TcpStream::connect(front_addr).await.unwrap();
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut choice = [0u8; 2];
            client.read_exact(&mut choice).await.unwrap();

            let ip = match echo.ip() {
                std::net::IpAddr::V4(v4) => v4.octets(),
                _ => panic!("expected v4"),
            };
            let mut req = vec![0x05, 0x01, 0x00, 0x01];
            req.extend_from_slice(&ip);
            req.extend_from_slice(&echo.port().to_be_bytes());
            client.write_all(&req).await.unwrap();

            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[1], 0x00);

            client.write_all(b"x").await.unwrap();
            client.shutdown().await.unwrap();
            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).await.unwrap();
            assert_eq!(echoed, b"x");
        }
    })
    .await
    .expect("test_socks5_front_retries_to_next_upstream timed out");
}

#[tokio::test]
async fn test_http_connect_tunnel() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let upstream = spawn_fake_upstream().await;
        let echo = spawn_echo_target().await;
        let pool = single_entry_pool("relaxed", upstream);

        let front = Arc::new(HttpProxy::new(
            Mode::Relaxed,
            pool,
            &AuthConfig::default(),
            selection(0),
        ));
        let (_tx, rx) = watch::channel(false);
        let (front_addr, _handle) = front
            .start("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let connect = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
        client.write_all(connect.as_bytes()).await.unwrap();

        let head = read_http_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

        client.write_all(b"tunnel-bytes").await.unwrap();
        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"tunnel-bytes");
    })
    .await
    .expect("test_http_connect_tunnel timed out");
}

#[tokio::test]
async fn test_http_forward_request() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let upstream = spawn_fake_upstream().await;
        let target = spawn_http_target().await;
        let pool = single_entry_pool("relaxed", upstream);

        let front = Arc::new(HttpProxy::new(
            Mode::Relaxed,
            pool,
            &AuthConfig::default(),
            selection(0),
        ));
        let (_tx, rx) = watch::channel(false);
        let (front_addr, _handle) = front
            .start("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let request = format!(
            "GET http://{target}/hello HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
        assert!(response.contains("x-origin: target"));
        assert!(response.ends_with("hello"));
    })
    .await
    .expect("test_http_forward_request timed out");
}

#[tokio::test]
async fn test_http_forward_no_upstream_is_503() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let pool = Arc::new(Pool::new("relaxed"));
        let front = Arc::new(HttpProxy::new(
            Mode::Relaxed,
            pool,
            &AuthConfig::default(),
            selection(1),
        ));
        let (_tx, rx) = watch::channel(false);
        let (front_addr, _handle) = front
            .start("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(
                b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 503"), "got: {response}");
    })
    .await
    .expect("test_http_forward_no_upstream_is_503 timed out");
}

#[tokio::test]
async fn test_http_unknown_forced_upstream_is_400() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let upstream = spawn_fake_upstream().await;
        let pool = single_entry_pool("relaxed", upstream);
        let front = Arc::new(HttpProxy::new(
            Mode::Relaxed,
            pool,
            &AuthConfig::default(),
            selection(1),
        ));
        let (_tx, rx) = watch::channel(false);
        let (front_addr, _handle) = front
            .start("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(
                b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nX-EasyProxyPool-Upstream: no-such-node\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
    })
    .await
    .expect("test_http_unknown_forced_upstream_is_400 timed out");
}

#[tokio::test]
async fn test_http_auth_challenge() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let pool = Arc::new(Pool::new("relaxed"));
        let auth = AuthConfig {
            mode: "basic".into(),
            username: "u".into(),
            password: "p".into(),
        };
        let front = Arc::new(HttpProxy::new(Mode::Relaxed, pool, &auth, selection(0)));
        let (_tx, rx) = watch::channel(false);
        let (front_addr, _handle) = front
            .start("127.0.0.1:0".parse().unwrap(), rx)
            .await
            .unwrap();

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(
                b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 407"), "got: {response}");
        assert!(response.to_lowercase().contains("proxy-authenticate"));
    })
    .await
    .expect("test_http_auth_challenge timed out");
}
