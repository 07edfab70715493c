//! Periodic refresh orchestration.
//!
//! One refresh at a time: a CAS gate on the strict pool admits a run, late
//! ticks are dropped rather than queued. A refresh loads specs from every
//! source, probes candidates under bounded concurrency (strict first, then
//! relaxed), and republishes the pools. A pool whose new set would be empty
//! keeps its stale set instead.

pub mod status;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::config::Config;
use crate::health::HealthProbe;
use crate::pool::{Entry, Pool};
use crate::proxy::Mode;
use crate::sources::SpecSource;
use crate::upstream::SpecDetail;
use crate::xray::{self, GenerateOptions, Instance, MetricsClient};

pub use status::{StatusSnapshot, UpdateDetails, UpdaterStatus};

/// The two supervised xray children plus their metrics clients.
pub struct XrayHandles {
    pub strict: Instance,
    pub relaxed: Instance,
    pub metrics_strict: MetricsClient,
    pub metrics_relaxed: MetricsClient,
}

impl XrayHandles {
    pub fn from_config(cfg: &crate::config::XrayConfig) -> Self {
        let timeout = Duration::from_secs(cfg.start_timeout_seconds);
        Self {
            strict: Instance::new(
                Mode::Strict,
                cfg.binary_path.clone(),
                cfg.work_dir.clone(),
                cfg.socks_listen_strict.clone(),
                cfg.metrics_listen_strict.clone(),
                timeout,
                Box::new(xray::OsRunner),
            ),
            relaxed: Instance::new(
                Mode::Relaxed,
                cfg.binary_path.clone(),
                cfg.work_dir.clone(),
                cfg.socks_listen_relaxed.clone(),
                cfg.metrics_listen_relaxed.clone(),
                timeout,
                Box::new(xray::OsRunner),
            ),
            metrics_strict: MetricsClient::new(&cfg.metrics_listen_strict),
            metrics_relaxed: MetricsClient::new(&cfg.metrics_listen_relaxed),
        }
    }
}

#[derive(Clone)]
struct Candidate {
    id: String,
    dial_addr: String,
    username: Option<String>,
    password: Option<String>,
}

struct ProbeHit {
    candidate: Candidate,
    strict: bool,
    latency: Duration,
}

pub struct Updater {
    cfg: Config,
    strict_pool: Arc<Pool>,
    relaxed_pool: Arc<Pool>,
    status: Arc<UpdaterStatus>,
    sources: Arc<dyn SpecSource>,
    probe: Arc<dyn HealthProbe>,
    xray: Option<XrayHandles>,
}

impl Updater {
    pub fn new(
        cfg: Config,
        strict_pool: Arc<Pool>,
        relaxed_pool: Arc<Pool>,
        status: Arc<UpdaterStatus>,
        sources: Arc<dyn SpecSource>,
        probe: Arc<dyn HealthProbe>,
        xray: Option<XrayHandles>,
    ) -> Self {
        Self {
            cfg,
            strict_pool,
            relaxed_pool,
            status,
            sources,
            probe,
            xray,
        }
    }

    /// Run one refresh immediately, then tick every `update_interval_minutes`
    /// until shutdown.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_once().await;

            let period = Duration::from_secs(self.cfg.update_interval_minutes * 60);
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => self.run_once().await,
                }
            }
            info!("updater loop stopped");
        })
    }

    /// Tear down any owned child processes.
    pub async fn stop(&self) {
        if let Some(x) = &self.xray {
            if let Err(e) = x.strict.stop().await {
                warn!(err = %e, "stop xray strict");
            }
            if let Err(e) = x.relaxed.stop().await {
                warn!(err = %e, "stop xray relaxed");
            }
        }
    }

    pub async fn run_once(&self) {
        if !self.strict_pool.updating_cas() {
            info!("update already in progress; skipping");
            return;
        }

        let start = SystemTime::now();
        let started = Instant::now();
        self.status.set_start(start);
        info!("updating proxy pools");

        match &self.xray {
            Some(handles) => self.run_once_xray(handles).await,
            None => self.run_once_direct().await,
        }
        info!(took = ?started.elapsed(), "update finished");

        self.strict_pool.updating_clear();
    }

    async fn run_once_direct(&self) {
        let outcome = match self.sources.load().await {
            Ok(o) => o,
            Err(e) => {
                warn!(err = %e, "fetch failed");
                self.status.set_end(
                    SystemTime::now(),
                    0,
                    0,
                    0,
                    Some(e.to_string()),
                    UpdateDetails {
                        adapter: "direct".into(),
                        ..Default::default()
                    },
                );
                return;
            }
        };

        // Only SOCKS5 nodes are dialable without the tunnel adapter. The
        // pool id for a directly dialed upstream is its address.
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for spec in &outcome.specs {
            if let SpecDetail::Socks5(creds) = &spec.detail {
                let addr = format!("{}:{}", spec.server, spec.port);
                if !seen.insert(addr.clone()) {
                    continue;
                }
                let has_creds =
                    !creds.username.trim().is_empty() || !creds.password.trim().is_empty();
                candidates.push(Candidate {
                    id: addr.clone(),
                    dial_addr: addr,
                    username: has_creds.then(|| creds.username.clone()),
                    password: has_creds.then(|| creds.password.clone()),
                });
            }
        }
        let fetched = candidates.len();

        let sem = Arc::new(Semaphore::new(self.cfg.health_check_concurrency.max(1)));
        let mut probes: JoinSet<Vec<ProbeHit>> = JoinSet::new();
        for candidate in candidates {
            let sem = Arc::clone(&sem);
            let probe = Arc::clone(&self.probe);
            probes.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return Vec::new(),
                };

                let (ok, latency) = probe.check(&candidate.dial_addr, true).await;
                if ok {
                    return vec![
                        ProbeHit {
                            candidate: candidate.clone(),
                            strict: true,
                            latency,
                        },
                        ProbeHit {
                            candidate,
                            strict: false,
                            latency,
                        },
                    ];
                }

                let (ok, latency) = probe.check(&candidate.dial_addr, false).await;
                if ok {
                    vec![ProbeHit {
                        candidate,
                        strict: false,
                        latency,
                    }]
                } else {
                    Vec::new()
                }
            });
        }

        // Results arrive in completion order; pool order is first-seen id.
        let now = SystemTime::now();
        let mut seen_strict = HashSet::new();
        let mut seen_relaxed = HashSet::new();
        let mut strict_entries = Vec::new();
        let mut relaxed_entries = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let hits = match joined {
                Ok(h) => h,
                Err(e) => {
                    warn!(err = %e, "probe task failed");
                    continue;
                }
            };
            for hit in hits {
                let seen = if hit.strict {
                    &mut seen_strict
                } else {
                    &mut seen_relaxed
                };
                if !seen.insert(hit.candidate.id.clone()) {
                    continue;
                }
                let mut entry = Entry::new(hit.candidate.id.clone(), hit.candidate.dial_addr.clone())
                    .with_latency(hit.latency, now);
                if let (Some(u), Some(p)) = (&hit.candidate.username, &hit.candidate.password) {
                    entry = entry.with_credentials(u.clone(), p.clone());
                }
                if hit.strict {
                    strict_entries.push(entry);
                } else {
                    relaxed_entries.push(entry);
                }
            }
        }

        let (strict_count, relaxed_count) = (strict_entries.len(), relaxed_entries.len());
        self.publish(strict_entries, relaxed_entries);
        self.status.set_end(
            SystemTime::now(),
            fetched,
            strict_count,
            relaxed_count,
            None,
            UpdateDetails {
                adapter: "direct".into(),
                problems_count: outcome.problems.len(),
                skipped_by_type: outcome.skipped_by_type,
                ..Default::default()
            },
        );
        info!(
            fetched,
            strict = strict_count,
            relaxed = relaxed_count,
            "update complete"
        );
    }

    async fn run_once_xray(&self, x: &XrayHandles) {
        let xcfg = &self.cfg.adapters.xray;

        let outcome = match self.sources.load().await {
            Ok(o) => o,
            Err(e) => {
                warn!(err = %e, "load specs failed");
                self.set_end_error(0, e.to_string(), UpdateDetails::default());
                return;
            }
        };
        let fetched = outcome.specs.len();

        let gen = |mode: Mode| GenerateOptions {
            mode,
            socks_listen: if mode.is_strict() {
                xcfg.socks_listen_strict.clone()
            } else {
                xcfg.socks_listen_relaxed.clone()
            },
            metrics_listen: if mode.is_strict() {
                xcfg.metrics_listen_strict.clone()
            } else {
                xcfg.metrics_listen_relaxed.clone()
            },
            user_password: xcfg.user_password.clone(),
            max_nodes: xcfg.max_nodes,
            observatory: xcfg.observatory.clone(),
        };

        let gen_strict = match xray::generate(&outcome.specs, &gen(Mode::Strict)) {
            Ok(g) => g,
            Err(e) => {
                warn!(err = %e, "xray config (strict) failed");
                self.set_end_error(fetched, e.to_string(), UpdateDetails::default());
                return;
            }
        };
        let gen_relaxed = match xray::generate(&outcome.specs, &gen(Mode::Relaxed)) {
            Ok(g) => g,
            Err(e) => {
                warn!(err = %e, "xray config (relaxed) failed");
                self.set_end_error(fetched, e.to_string(), UpdateDetails::default());
                return;
            }
        };

        let mut details = UpdateDetails {
            adapter: "xray".into(),
            problems_count: outcome.problems.len(),
            skipped_by_type: outcome.skipped_by_type.clone(),
            strict_hash: gen_strict.hash.clone(),
            relaxed_hash: gen_relaxed.hash.clone(),
        };
        for (k, v) in gen_strict.skipped.iter().chain(gen_relaxed.skipped.iter()) {
            *details.skipped_by_type.entry(k.clone()).or_insert(0) += v;
        }

        if let Err(e) = x.strict.ensure(&gen_strict.config_json, &gen_strict.hash).await {
            warn!(err = %e, "xray ensure strict failed");
            self.set_end_error(fetched, e.to_string(), details);
            return;
        }
        if let Err(e) = x
            .relaxed
            .ensure(&gen_relaxed.config_json, &gen_relaxed.hash)
            .await
        {
            warn!(err = %e, "xray ensure relaxed failed");
            self.set_end_error(fetched, e.to_string(), details);
            return;
        }

        let health_strict = match x.metrics_strict.fetch().await {
            Ok(h) => h,
            Err(e) => {
                warn!(err = %e, "metrics strict failed");
                self.set_end_error(fetched, e.to_string(), details);
                return;
            }
        };
        let health_relaxed = match x.metrics_relaxed.fetch().await {
            Ok(h) => h,
            Err(e) => {
                warn!(err = %e, "metrics relaxed failed");
                self.set_end_error(fetched, e.to_string(), details);
                return;
            }
        };

        let now = SystemTime::now();
        let build = |included: &[String],
                     health: &std::collections::HashMap<String, xray::NodeHealth>,
                     listen: &str| {
            included
                .iter()
                .filter_map(|id| {
                    let h = health.get(id)?;
                    if !h.alive {
                        return None;
                    }
                    Some(
                        Entry::new(id.clone(), listen.to_string())
                            .with_credentials(id.clone(), xcfg.user_password.clone())
                            .with_latency(h.delay, now),
                    )
                })
                .collect::<Vec<_>>()
        };
        let strict_entries = build(&gen_strict.included, &health_strict, &xcfg.socks_listen_strict);
        let relaxed_entries = build(
            &gen_relaxed.included,
            &health_relaxed,
            &xcfg.socks_listen_relaxed,
        );

        self.status.set_relaxed_node_health(now, health_relaxed);

        let (strict_count, relaxed_count) = (strict_entries.len(), relaxed_entries.len());
        self.publish(strict_entries, relaxed_entries);
        self.status
            .set_end(SystemTime::now(), fetched, strict_count, relaxed_count, None, details);
        info!(
            adapter = "xray",
            nodes = fetched,
            strict = strict_count,
            relaxed = relaxed_count,
            "update complete"
        );
    }

    /// Non-empty results replace the pool; an empty result keeps the stale
    /// set, since stale upstreams beat none at all.
    fn publish(&self, strict_entries: Vec<Entry>, relaxed_entries: Vec<Entry>) {
        if !strict_entries.is_empty() {
            self.strict_pool.update(strict_entries);
        } else {
            warn!(pool = "strict", "no healthy upstreams; keeping existing");
        }
        if !relaxed_entries.is_empty() {
            self.relaxed_pool.update(relaxed_entries);
        } else {
            warn!(pool = "relaxed", "no healthy upstreams; keeping existing");
        }
    }

    fn set_end_error(&self, fetched: usize, error: String, mut details: UpdateDetails) {
        if details.adapter.is_empty() {
            details.adapter = "xray".into();
        }
        self.status
            .set_end(SystemTime::now(), fetched, 0, 0, Some(error), details);
    }
}
