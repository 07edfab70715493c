use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use rotapool::config::{listen_addr, Config};
use rotapool::health::HealthChecker;
use rotapool::pool::Pool;
use rotapool::proxy::http::HttpProxy;
use rotapool::proxy::socks5::Socks5Proxy;
use rotapool::proxy::Mode;
use rotapool::sources::Loader;
use rotapool::updater::{Updater, UpdaterStatus, XrayHandles};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "rotapool")]
#[command(about = "Rotating SOCKS5/HTTP forward-proxy gateway with health-checked upstream pools")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::from_file(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    // LOG_LEVEL overrides the configured level, nothing else does.
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(format!("rotapool={}", level))
        .init();

    info!(
        config = %args.config,
        update_every_minutes = config.update_interval_minutes,
        "starting rotapool"
    );

    let strict_pool = Arc::new(Pool::new("strict"));
    let relaxed_pool = Arc::new(Pool::new("relaxed"));
    let status = Arc::new(UpdaterStatus::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let checker = HealthChecker::new(
        config.health_check.target_address.clone(),
        config.health_check.target_server_name.clone(),
        Duration::from_secs(config.health_check.total_timeout_seconds),
        Duration::from_secs(config.health_check.tls_handshake_threshold_seconds),
    );
    let loader = Loader::new(config.sources.clone(), config.proxy_list_urls.clone());
    let xray = config
        .adapters
        .xray
        .enabled
        .then(|| XrayHandles::from_config(&config.adapters.xray));

    let updater = Arc::new(Updater::new(
        config.clone(),
        Arc::clone(&strict_pool),
        Arc::clone(&relaxed_pool),
        Arc::clone(&status),
        Arc::new(loader),
        Arc::new(checker),
        xray,
    ));
    let updater_handle = Arc::clone(&updater).start(shutdown_rx.clone());

    let mut listener_handles: Vec<JoinHandle<()>> = Vec::new();

    if config.admin.enabled && !config.admin.addr.is_empty() {
        let admin = Arc::new(rotapool::admin::AdminServer::new(
            Arc::clone(&strict_pool),
            Arc::clone(&relaxed_pool),
            Arc::clone(&status),
        ));
        let (_addr, handle) = admin
            .start(listen_addr(&config.admin.addr)?, shutdown_rx.clone())
            .await?;
        listener_handles.push(handle);
    }

    for (port, mode, pool) in [
        (&config.ports.socks5_strict, Mode::Strict, &strict_pool),
        (&config.ports.socks5_relaxed, Mode::Relaxed, &relaxed_pool),
    ] {
        if port.is_empty() {
            continue;
        }
        let front = Arc::new(Socks5Proxy::new(
            mode,
            Arc::clone(pool),
            &config.auth,
            config.selection.clone(),
        ));
        let (_addr, handle) = front
            .start(listen_addr(port)?, shutdown_rx.clone())
            .await?;
        listener_handles.push(handle);
    }

    for (port, mode, pool) in [
        (&config.ports.http_strict, Mode::Strict, &strict_pool),
        (&config.ports.http_relaxed, Mode::Relaxed, &relaxed_pool),
    ] {
        if port.is_empty() {
            continue;
        }
        let front = Arc::new(HttpProxy::new(
            mode,
            Arc::clone(pool),
            &config.auth,
            config.selection.clone(),
        ));
        let (_addr, handle) = front
            .start(listen_addr(port)?, shutdown_rx.clone())
            .await?;
        listener_handles.push(handle);
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Listeners close first; in-flight work gets the deadline window.
    let drain = async {
        let _ = updater_handle.await;
        for handle in listener_handles {
            let _ = handle.await;
        }
        updater.stop().await;
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        warn!("shutdown deadline exceeded; exiting anyway");
    }

    info!("rotapool shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
