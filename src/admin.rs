//! Read-only admin surface: liveness and a status snapshot. It observes the
//! pools and the updater status and has no write path into either.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::RotapoolResult;
use crate::pool::Pool;
use crate::updater::UpdaterStatus;

pub struct AdminServer {
    strict_pool: Arc<Pool>,
    relaxed_pool: Arc<Pool>,
    status: Arc<UpdaterStatus>,
}

impl AdminServer {
    pub fn new(
        strict_pool: Arc<Pool>,
        relaxed_pool: Arc<Pool>,
        status: Arc<UpdaterStatus>,
    ) -> Self {
        Self {
            strict_pool,
            relaxed_pool,
            status,
        }
    }

    pub async fn start(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> RotapoolResult<(SocketAddr, JoinHandle<()>)> {
        let incoming = AddrIncoming::bind(&addr)?;
        let local_addr = incoming.local_addr();
        info!(component = "admin", addr = %local_addr, "listening");

        let this = Arc::clone(&self);
        let make_service = make_service_fn(move |_conn: &AddrStream| {
            let this = Arc::clone(&this);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let this = Arc::clone(&this);
                    async move { Ok::<_, Infallible>(this.handle(req)) }
                }))
            }
        });

        let server = Server::builder(incoming)
            .serve(make_service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });

        let handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                warn!(component = "admin", err = %e, "server error");
            }
        });

        Ok((local_addr, handle))
    }

    fn handle(&self, req: Request<Body>) -> Response<Body> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/healthz") => self.healthz(),
            (&Method::GET, "/status") => self.status_json(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Not Found"))
                .unwrap_or_else(|_| Response::new(Body::empty())),
        }
    }

    fn healthz(&self) -> Response<Body> {
        let now = Instant::now();
        let healthy = self.strict_pool.stats(now).has_any_active
            || self.relaxed_pool.stats(now).has_any_active;
        let (code, body) = if healthy {
            (StatusCode::OK, "ok")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "no active upstreams")
        };
        Response::builder()
            .status(code)
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    fn status_json(&self) -> Response<Body> {
        let now = Instant::now();
        let snap = self.status.snapshot();

        let pool_json = |pool: &Pool| {
            let stats = pool.stats(now);
            json!({
                "total": stats.total,
                "disabled": stats.disabled,
                "has_any_active": stats.has_any_active,
                "last_checked": stats.last_checked.map(rfc3339),
            })
        };

        let mut body = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "pools": {
                "strict": pool_json(&self.strict_pool),
                "relaxed": pool_json(&self.relaxed_pool),
            },
            "updater": {
                "last_start": snap.last_start.map(rfc3339),
                "last_end": snap.last_end.map(rfc3339),
                "last_error": snap.last_error,
                "fetched": snap.fetched,
                "strict": snap.strict,
                "relaxed": snap.relaxed,
                "details": {
                    "adapter": snap.details.adapter,
                    "problems_count": snap.details.problems_count,
                    "skipped_by_type": snap.details.skipped_by_type,
                    "strict_hash": snap.details.strict_hash,
                    "relaxed_hash": snap.details.relaxed_hash,
                },
            },
        });

        if let Some(at) = snap.relaxed_node_health_at {
            let alive = snap
                .relaxed_node_health
                .values()
                .filter(|h| h.alive)
                .count();
            body.as_object_mut().unwrap().insert(
                "relaxed_node_health".into(),
                json!({
                    "checked_at": rfc3339(at),
                    "alive": alive,
                    "total": snap.relaxed_node_health.len(),
                }),
            );
        }

        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

fn rfc3339(t: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Entry;
    use crate::updater::UpdateDetails;

    fn make_admin() -> AdminServer {
        AdminServer::new(
            Arc::new(Pool::new("strict")),
            Arc::new(Pool::new("relaxed")),
            Arc::new(UpdaterStatus::new()),
        )
    }

    #[tokio::test]
    async fn test_healthz_reflects_pool_state() {
        let admin = make_admin();
        let req = Request::builder()
            .method("GET")
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(admin.handle(req).status(), StatusCode::SERVICE_UNAVAILABLE);

        admin.strict_pool.update(vec![Entry::new("a:1", "a:1")]);
        let req = Request::builder()
            .method("GET")
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(admin.handle(req).status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_document_shape() {
        let admin = make_admin();
        admin.relaxed_pool.update(vec![Entry::new("a:1", "a:1")]);
        admin.status.set_end(
            SystemTime::now(),
            7,
            2,
            5,
            None,
            UpdateDetails {
                adapter: "direct".into(),
                ..Default::default()
            },
        );

        let req = Request::builder()
            .method("GET")
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let resp = admin.handle(req);
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["updater"]["fetched"], 7);
        assert_eq!(v["pools"]["relaxed"]["total"], 1);
        assert_eq!(v["updater"]["details"]["adapter"], "direct");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let admin = make_admin();
        let req = Request::builder()
            .method("GET")
            .uri("/admin/secret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(admin.handle(req).status(), StatusCode::NOT_FOUND);
    }
}
