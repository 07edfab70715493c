//! HTTP forward-proxy front end: CONNECT tunnels and plain forward
//! requests, with per-request upstream selection, sticky session binding
//! and retry under idempotence rules.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::HttpBody as _;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION};
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode, Uri};
use rustls::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, Failover, SelectionConfig, StickyMode};
use crate::error::{RotapoolError, RotapoolResult};
use crate::pool::{pick_rendezvous, Entry, Pool};
use crate::proxy::dialer::{dial_through_socks5, split_host_port};
use crate::proxy::policy::{
    parse_basic_auth, policy_from_request, CredentialStore, RequestPolicy, HEADER_FAILOVER,
    HEADER_SESSION, HEADER_STICKY, HEADER_UPSTREAM,
};
use crate::proxy::Mode;
use crate::sticky::StickyMap;
use crate::tls;

const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const UPSTREAM_TLS_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpProxy {
    mode: Mode,
    pool: Arc<Pool>,
    selection: SelectionConfig,
    creds: Option<CredentialStore>,
    sticky: Option<StickyMap>,
}

impl HttpProxy {
    pub fn new(mode: Mode, pool: Arc<Pool>, auth: &AuthConfig, selection: SelectionConfig) -> Self {
        let sticky = if selection.sticky.enabled && selection.sticky.mode == StickyMode::Lru {
            Some(StickyMap::new(
                Duration::from_secs(selection.sticky.ttl_seconds),
                selection.sticky.max_entries,
            ))
        } else {
            None
        };
        Self {
            mode,
            pool,
            creds: CredentialStore::from_auth(auth),
            selection,
            sticky,
        }
    }

    /// Bind and serve on a background task; returns the bound address and
    /// the server handle.
    pub async fn start(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> RotapoolResult<(SocketAddr, JoinHandle<()>)> {
        let incoming = AddrIncoming::bind(&addr)?;
        let local_addr = incoming.local_addr();
        info!(component = "http", mode = %self.mode, addr = %local_addr, "listening");

        let this = Arc::clone(&self);
        let make_service = make_service_fn(move |_conn: &AddrStream| {
            let this = Arc::clone(&this);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let this = Arc::clone(&this);
                    async move { Ok::<_, Infallible>(this.handle(req).await) }
                }))
            }
        });

        let server = Server::builder(incoming)
            .serve(make_service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });

        let mode = self.mode;
        let handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                warn!(component = "http", mode = %mode, err = %e, "server error");
            }
            info!(component = "http", mode = %mode, addr = %local_addr, "listener closed");
        });

        Ok((local_addr, handle))
    }

    async fn handle(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        if let Some(challenge) = self.authorize(req.headers()) {
            return challenge;
        }

        let start = Instant::now();
        if req.method() == Method::CONNECT {
            let host = req.uri().authority().map(|a| a.to_string());
            let resp = self.handle_connect(req).await;
            debug!(
                component = "http",
                mode = %self.mode,
                host = host.as_deref().unwrap_or(""),
                status = resp.status().as_u16(),
                took = ?start.elapsed(),
                "connect"
            );
            resp
        } else {
            let method = req.method().clone();
            let resp = self.handle_forward(req).await;
            debug!(
                component = "http",
                mode = %self.mode,
                method = %method,
                status = resp.status().as_u16(),
                took = ?start.elapsed(),
                "request"
            );
            resp
        }
    }

    /// Check inbound proxy credentials; Some(response) is the 407 challenge.
    fn authorize(&self, headers: &HeaderMap) -> Option<Response<Body>> {
        let store = self.creds.as_ref()?;
        let ok = headers
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic_auth)
            .map(|(user, pass)| store.valid(&user, &pass))
            .unwrap_or(false);
        if ok {
            return None;
        }
        let mut resp = status_response(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "Proxy authentication required",
        );
        resp.headers_mut().insert(
            hyper::header::PROXY_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"rotapool\""),
        );
        Some(resp)
    }

    async fn handle_connect(&self, req: Request<Body>) -> Response<Body> {
        let policy = match policy_from_request(&self.selection, req.headers()) {
            Ok(p) => p,
            Err(e) => return status_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let mut target = match req.uri().authority() {
            Some(a) => a.to_string(),
            None => return status_response(StatusCode::BAD_REQUEST, "missing CONNECT authority"),
        };
        if !target.contains(':') {
            target.push_str(":443");
        }
        let (host, port) = match split_host_port(&target) {
            Ok(hp) => hp,
            Err(e) => return status_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let mut selector = Selector::new(self, &policy);
        let mut last_err: Option<RotapoolError> = None;

        for _attempt in 0..=self.selection.retries {
            let now = Instant::now();
            let entry = match selector.select(now) {
                Selected::Entry(e) => e,
                Selected::UnknownForced => {
                    return status_response(StatusCode::BAD_REQUEST, "Unknown upstream")
                }
                Selected::NoUpstream => {
                    return status_response(StatusCode::SERVICE_UNAVAILABLE, "No available proxies")
                }
            };

            match dial_through_socks5(&entry, &host, port, UPSTREAM_DIAL_TIMEOUT).await {
                Ok(mut upstream) => {
                    self.pool.mark_success(&entry.id);
                    tokio::spawn(async move {
                        match hyper::upgrade::on(req).await {
                            Ok(mut client) => {
                                // Half-closes are forwarded; the tunnel ends
                                // when both directions have finished.
                                let _ =
                                    tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                            }
                            Err(e) => debug!(err = %e, "connect upgrade failed"),
                        }
                    });
                    return Response::builder()
                        .status(StatusCode::OK)
                        .body(Body::empty())
                        .unwrap_or_else(|_| Response::new(Body::empty()));
                }
                Err(e) => {
                    self.mark_failed(&entry, now);
                    selector.note_failure(&entry, now);
                    debug!(component = "http", upstream = %entry.id, err = %e, "connect dial failed");
                    last_err = Some(e);
                }
            }
        }

        let msg = last_err
            .map(|e| format!("CONNECT failed: {}", e))
            .unwrap_or_else(|| "CONNECT failed".to_string());
        status_response(StatusCode::BAD_GATEWAY, &msg)
    }

    async fn handle_forward(&self, req: Request<Body>) -> Response<Body> {
        let policy = match policy_from_request(&self.selection, req.headers()) {
            Ok(p) => p,
            Err(e) => return status_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let (parts, body) = req.into_parts();

        // Absolute-form URL, or origin-form plus Host header.
        let scheme = parts.uri.scheme_str().unwrap_or("http").to_string();
        let authority = match parts.uri.authority().map(|a| a.to_string()).or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        }) {
            Some(a) => a,
            None => return status_response(StatusCode::BAD_REQUEST, "missing target host"),
        };
        let https = scheme.eq_ignore_ascii_case("https");
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if p.parse::<u16>().is_ok() => (
                h.trim_start_matches('[').trim_end_matches(']').to_string(),
                p.parse().unwrap(),
            ),
            _ => (authority.clone(), if https { 443 } else { 80 }),
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let out_uri: Uri = match path_and_query.parse() {
            Ok(u) => u,
            Err(_) => return status_response(StatusCode::BAD_REQUEST, "bad request path"),
        };

        let mut out_headers = parts.headers.clone();
        strip_hop_by_hop_headers(&mut out_headers);
        for h in [HEADER_STICKY, HEADER_FAILOVER, HEADER_UPSTREAM, HEADER_SESSION] {
            out_headers.remove(h);
        }
        match HeaderValue::from_str(&authority) {
            Ok(v) => {
                out_headers.insert(HOST, v);
            }
            Err(_) => return status_response(StatusCode::BAD_REQUEST, "bad host header"),
        }

        let body_empty = body.size_hint().exact() == Some(0);
        let retryable = is_retryable_request(
            &parts.method,
            body_empty,
            self.selection.retry_non_idempotent,
        );
        let mut body_slot = Some(body);

        let mut selector = Selector::new(self, &policy);
        let mut last_err: Option<RotapoolError> = None;

        for attempt in 0..=self.selection.retries {
            let now = Instant::now();
            let entry = match selector.select(now) {
                Selected::Entry(e) => e,
                Selected::UnknownForced => {
                    return status_response(StatusCode::BAD_REQUEST, "Unknown upstream")
                }
                Selected::NoUpstream => {
                    return status_response(StatusCode::SERVICE_UNAVAILABLE, "No available proxies")
                }
            };

            let attempt_body = if body_empty {
                Body::empty()
            } else {
                match body_slot.take() {
                    Some(b) => b,
                    None => break,
                }
            };
            let mut out_req = Request::builder()
                .method(parts.method.clone())
                .uri(out_uri.clone())
                .body(attempt_body)
                .unwrap_or_else(|_| Request::new(Body::empty()));
            *out_req.headers_mut() = out_headers.clone();

            match self.forward_once(&entry, &host, port, https, out_req).await {
                Ok(resp) => {
                    self.pool.mark_success(&entry.id);
                    let (mut rparts, rbody) = resp.into_parts();
                    strip_hop_by_hop_headers(&mut rparts.headers);
                    return Response::from_parts(rparts, rbody);
                }
                Err(e) => {
                    self.mark_failed(&entry, now);
                    selector.note_failure(&entry, now);
                    debug!(component = "http", upstream = %entry.id, err = %e, "forward failed");
                    last_err = Some(e);
                    if !(retryable && attempt < self.selection.retries) {
                        break;
                    }
                }
            }
        }

        let msg = last_err
            .map(|e| format!("Proxy request failed: {}", e))
            .unwrap_or_else(|| "Proxy request failed".to_string());
        status_response(StatusCode::BAD_GATEWAY, &msg)
    }

    async fn forward_once(
        &self,
        entry: &Entry,
        host: &str,
        port: u16,
        https: bool,
        req: Request<Body>,
    ) -> RotapoolResult<Response<Body>> {
        let stream = dial_through_socks5(entry, host, port, UPSTREAM_DIAL_TIMEOUT).await?;
        if https {
            let server_name = ServerName::try_from(host)
                .map_err(|e| RotapoolError::proxy(format!("bad server name: {}", e)))?;
            let connector = TlsConnector::from(tls::client_config(self.mode.is_strict()));
            let tls_stream = tokio::time::timeout(
                UPSTREAM_TLS_TIMEOUT,
                connector.connect(server_name, stream),
            )
            .await
            .map_err(|_| RotapoolError::timeout("upstream tls handshake"))?
            .map_err(|e| RotapoolError::proxy(format!("tls handshake: {}", e)))?;
            send_via(tls_stream, req).await
        } else {
            send_via(stream, req).await
        }
    }

    fn mark_failed(&self, entry: &Entry, now: Instant) {
        self.pool.mark_failure(
            &entry.id,
            now,
            Duration::from_secs(self.selection.failure_backoff_seconds),
            Duration::from_secs(self.selection.max_backoff_seconds),
        );
    }
}

async fn send_via<S>(stream: S, req: Request<Body>) -> RotapoolResult<Response<Body>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::Builder::new()
        .handshake::<S, Body>(stream)
        .await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(err = %e, "upstream connection error");
        }
    });
    let resp = tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, sender.send_request(req))
        .await
        .map_err(|_| RotapoolError::timeout("upstream response"))??;
    Ok(resp)
}

enum Selected {
    Entry(Entry),
    NoUpstream,
    UnknownForced,
}

/// Per-request selection state across retry attempts. Soft failover walks
/// the rendezvous ranking (or rebinds the LRU mapping); hard failover keeps
/// hammering the first choice.
struct Selector<'a> {
    proxy: &'a HttpProxy,
    policy: &'a RequestPolicy,
    sticky_on: bool,
    tried: HashSet<String>,
    pinned: Option<Entry>,
    lru_mapped: Option<String>,
}

impl<'a> Selector<'a> {
    fn new(proxy: &'a HttpProxy, policy: &'a RequestPolicy) -> Self {
        let mut sticky_on = proxy.selection.sticky.enabled;
        if let Some(force) = policy.force_sticky {
            sticky_on = force;
        }
        sticky_on = sticky_on && !policy.session_key.is_empty();

        let lru_mapped = if sticky_on {
            proxy
                .sticky
                .as_ref()
                .and_then(|m| m.get(&policy.session_key, Instant::now()))
        } else {
            None
        };

        Self {
            proxy,
            policy,
            sticky_on,
            tried: HashSet::new(),
            pinned: None,
            lru_mapped,
        }
    }

    fn select(&mut self, now: Instant) -> Selected {
        if let Some(forced) = &self.policy.force_upstream {
            return match self.proxy.pool.get(forced, now) {
                Some(e) => Selected::Entry(e),
                None => Selected::UnknownForced,
            };
        }

        if self.sticky_on {
            return match &self.proxy.sticky {
                Some(map) => self.select_lru(map, now),
                None => self.select_rendezvous(now),
            };
        }

        match self.proxy.pool.next(self.proxy.selection.strategy, now) {
            Some(e) => Selected::Entry(e),
            None => Selected::NoUpstream,
        }
    }

    fn select_rendezvous(&mut self, now: Instant) -> Selected {
        if self.policy.failover == Failover::Hard {
            if let Some(e) = &self.pinned {
                return Selected::Entry(e.clone());
            }
            let candidates = self.proxy.pool.snapshot_active(now);
            return match pick_rendezvous(&candidates, &self.policy.session_key, None) {
                Some(e) => {
                    self.pinned = Some(e.clone());
                    Selected::Entry(e.clone())
                }
                None => Selected::NoUpstream,
            };
        }

        let candidates = self.proxy.pool.snapshot_active(now);
        match pick_rendezvous(&candidates, &self.policy.session_key, Some(&self.tried)) {
            Some(e) => Selected::Entry(e.clone()),
            None => Selected::NoUpstream,
        }
    }

    fn select_lru(&mut self, map: &StickyMap, now: Instant) -> Selected {
        if let Some(id) = self.lru_mapped.clone() {
            if let Some(e) = self.proxy.pool.get(&id, now) {
                return Selected::Entry(e);
            }
            // Mapped upstream vanished from the pool; fall through.
        }
        match self.proxy.pool.next(self.proxy.selection.strategy, now) {
            Some(e) => {
                self.lru_mapped = Some(e.id.clone());
                map.set(&self.policy.session_key, &e.id, now);
                Selected::Entry(e)
            }
            None => Selected::NoUpstream,
        }
    }

    fn note_failure(&mut self, entry: &Entry, now: Instant) {
        self.tried.insert(entry.id.clone());
        if !self.sticky_on
            || self.policy.failover != Failover::Soft
            || self.policy.force_upstream.is_some()
        {
            return;
        }
        if let Some(map) = &self.proxy.sticky {
            match self.proxy.pool.next(self.proxy.selection.strategy, now) {
                Some(replacement) => {
                    self.lru_mapped = Some(replacement.id.clone());
                    map.set(&self.policy.session_key, &replacement.id, now);
                }
                None => {
                    self.lru_mapped = None;
                    map.delete(&self.policy.session_key);
                }
            }
        }
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(format!("{}\n", message)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// A request may be replayed against another upstream only when its body is
/// empty and either the method is safe or non-idempotent retries are
/// explicitly enabled.
fn is_retryable_request(method: &Method, body_empty: bool, retry_non_idempotent: bool) -> bool {
    if retry_non_idempotent {
        return body_empty;
    }
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    ) && body_empty
}

/// Remove the standard hop-by-hop headers and anything the Connection
/// header names.
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_tokens: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ] {
        headers.remove(name);
    }
    for name in connection_tokens {
        headers.remove(name.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use base64::Engine as _;

    #[test]
    fn test_is_retryable_request() {
        assert!(is_retryable_request(&Method::GET, true, false));
        assert!(is_retryable_request(&Method::HEAD, true, false));
        assert!(!is_retryable_request(&Method::GET, false, false));
        assert!(!is_retryable_request(&Method::POST, true, false));
        assert!(is_retryable_request(&Method::POST, true, true));
        assert!(!is_retryable_request(&Method::POST, false, true));
    }

    #[test]
    fn test_strip_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-custom-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-custom-hop", HeaderValue::from_static("drop-me"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-keep", HeaderValue::from_static("stay"));

        strip_hop_by_hop_headers(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("x-keep").unwrap(), "stay");
    }

    fn proxy_with_auth(auth: AuthConfig) -> HttpProxy {
        let mut selection = SelectionConfig {
            strategy: Strategy::RoundRobin,
            ..Default::default()
        };
        selection.apply_defaults();
        HttpProxy::new(
            Mode::Relaxed,
            Arc::new(Pool::new("relaxed")),
            &auth,
            selection,
        )
    }

    #[test]
    fn test_authorize_disabled() {
        let proxy = proxy_with_auth(AuthConfig::default());
        assert!(proxy.authorize(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_authorize_basic() {
        let proxy = proxy_with_auth(AuthConfig {
            mode: "basic".into(),
            username: "u".into(),
            password: "p".into(),
        });

        let mut headers = HeaderMap::new();
        let cred = base64::engine::general_purpose::STANDARD.encode("u:p");
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", cred)).unwrap(),
        );
        assert!(proxy.authorize(&headers).is_none());

        let bad = base64::engine::general_purpose::STANDARD.encode("u:bad");
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", bad)).unwrap(),
        );
        let challenge = proxy.authorize(&headers).unwrap();
        assert_eq!(challenge.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert!(challenge
            .headers()
            .get(hyper::header::PROXY_AUTHENTICATE)
            .is_some());
    }

    #[test]
    fn test_authorize_shared_password() {
        let proxy = proxy_with_auth(AuthConfig {
            mode: "shared_password".into(),
            username: String::new(),
            password: "p".into(),
        });
        let mut headers = HeaderMap::new();
        let cred = base64::engine::general_purpose::STANDARD.encode("whoever:p");
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", cred)).unwrap(),
        );
        assert!(proxy.authorize(&headers).is_none());
    }

    #[test]
    fn test_selector_rendezvous_soft_walks_ranking() {
        let pool = Arc::new(Pool::new("relaxed"));
        pool.update(vec![
            Entry::new("n1", "n1"),
            Entry::new("n2", "n2"),
            Entry::new("n3", "n3"),
        ]);
        let mut selection = SelectionConfig::default();
        selection.sticky.enabled = true;
        selection.apply_defaults();
        let proxy = HttpProxy::new(Mode::Relaxed, pool, &AuthConfig::default(), selection);

        let policy = RequestPolicy {
            session_key: "sess".into(),
            failover: Failover::Soft,
            ..Default::default()
        };
        let mut selector = Selector::new(&proxy, &policy);
        let now = Instant::now();

        let first = match selector.select(now) {
            Selected::Entry(e) => e,
            _ => panic!("expected entry"),
        };
        // Same session, same pick.
        let again = match selector.select(now) {
            Selected::Entry(e) => e,
            _ => panic!("expected entry"),
        };
        assert_eq!(first.id, again.id);

        selector.note_failure(&first, now);
        let second = match selector.select(now) {
            Selected::Entry(e) => e,
            _ => panic!("expected entry"),
        };
        assert_ne!(second.id, first.id);
    }

    #[test]
    fn test_selector_rendezvous_hard_pins_choice() {
        let pool = Arc::new(Pool::new("relaxed"));
        pool.update(vec![Entry::new("n1", "n1"), Entry::new("n2", "n2")]);
        let mut selection = SelectionConfig::default();
        selection.sticky.enabled = true;
        selection.apply_defaults();
        let proxy = HttpProxy::new(Mode::Relaxed, pool.clone(), &AuthConfig::default(), selection);

        let policy = RequestPolicy {
            session_key: "sess".into(),
            failover: Failover::Hard,
            ..Default::default()
        };
        let mut selector = Selector::new(&proxy, &policy);
        let now = Instant::now();

        let first = match selector.select(now) {
            Selected::Entry(e) => e,
            _ => panic!("expected entry"),
        };
        // Even after the entry is disabled, hard failover stays on it.
        pool.mark_failure(&first.id, now, Duration::from_secs(60), Duration::from_secs(600));
        selector.note_failure(&first, now);
        let second = match selector.select(now) {
            Selected::Entry(e) => e,
            _ => panic!("expected entry"),
        };
        assert_eq!(second.id, first.id);
    }

    #[test]
    fn test_selector_lru_rebinds_on_soft_failure() {
        let pool = Arc::new(Pool::new("relaxed"));
        pool.update(vec![Entry::new("n1", "n1"), Entry::new("n2", "n2")]);
        let mut selection = SelectionConfig::default();
        selection.sticky.enabled = true;
        selection.sticky.mode = StickyMode::Lru;
        selection.apply_defaults();
        let proxy = HttpProxy::new(Mode::Relaxed, pool.clone(), &AuthConfig::default(), selection);
        assert!(proxy.sticky.is_some());

        let policy = RequestPolicy {
            session_key: "sess".into(),
            failover: Failover::Soft,
            ..Default::default()
        };
        let now = Instant::now();

        let mut selector = Selector::new(&proxy, &policy);
        let first = match selector.select(now) {
            Selected::Entry(e) => e,
            _ => panic!("expected entry"),
        };
        // The binding is persisted for later requests of the same session.
        assert_eq!(
            proxy.sticky.as_ref().unwrap().get("sess", now).as_deref(),
            Some(first.id.as_str())
        );

        // Soft failover rebinds the session to a replacement.
        pool.mark_failure(&first.id, now, Duration::from_secs(60), Duration::from_secs(600));
        selector.note_failure(&first, now);
        let second = match selector.select(now) {
            Selected::Entry(e) => e,
            _ => panic!("expected entry"),
        };
        assert_ne!(second.id, first.id);
        assert_eq!(
            proxy.sticky.as_ref().unwrap().get("sess", now).as_deref(),
            Some(second.id.as_str())
        );
    }

    #[test]
    fn test_selector_forced_upstream() {
        let pool = Arc::new(Pool::new("relaxed"));
        pool.update(vec![Entry::new("n1", "n1")]);
        let mut selection = SelectionConfig::default();
        selection.apply_defaults();
        let proxy = HttpProxy::new(Mode::Relaxed, pool, &AuthConfig::default(), selection);

        let policy = RequestPolicy {
            force_upstream: Some("n1".into()),
            ..Default::default()
        };
        let mut selector = Selector::new(&proxy, &policy);
        assert!(matches!(selector.select(Instant::now()), Selected::Entry(_)));

        let policy = RequestPolicy {
            force_upstream: Some("ghost".into()),
            ..Default::default()
        };
        let mut selector = Selector::new(&proxy, &policy);
        assert!(matches!(
            selector.select(Instant::now()),
            Selected::UnknownForced
        ));
    }
}
