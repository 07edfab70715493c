//! Supervision of one xray child process per verification mode.
//!
//! The config hash is the identity of the running configuration: `ensure`
//! is a no-op while the hash matches, and any change means kill-and-restart.
//! The child is never asked to reload in place.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{RotapoolError, RotapoolResult};
use crate::proxy::Mode;

/// Seam over process spawning so supervision logic can be exercised with a
/// fake in tests.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn start(
        &self,
        binary: &str,
        args: &[String],
        work_dir: &Path,
    ) -> RotapoolResult<Box<dyn ChildProcess>>;
}

#[async_trait]
pub trait ChildProcess: Send + Sync {
    async fn kill(&mut self) -> RotapoolResult<()>;
}

/// Production runner backed by tokio::process.
pub struct OsRunner;

#[async_trait]
impl ProcessRunner for OsRunner {
    async fn start(
        &self,
        binary: &str,
        args: &[String],
        work_dir: &Path,
    ) -> RotapoolResult<Box<dyn ChildProcess>> {
        let child = tokio::process::Command::new(binary)
            .args(args)
            .current_dir(work_dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RotapoolError::adapter(format!("start xray: {}", e)))?;
        Ok(Box::new(OsChild { child }))
    }
}

struct OsChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildProcess for OsChild {
    async fn kill(&mut self) -> RotapoolResult<()> {
        self.child
            .kill()
            .await
            .map_err(|e| RotapoolError::adapter(format!("kill xray: {}", e)))
    }
}

struct InstanceState {
    proc: Option<Box<dyn ChildProcess>>,
    last_hash: String,
}

pub struct Instance {
    mode: Mode,
    binary: String,
    work_dir: PathBuf,
    socks_listen: String,
    metrics_listen: String,
    start_timeout: Duration,
    runner: Box<dyn ProcessRunner>,
    state: Mutex<InstanceState>,
    ready_client: reqwest::Client,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: Mode,
        binary: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        socks_listen: impl Into<String>,
        metrics_listen: impl Into<String>,
        start_timeout: Duration,
        runner: Box<dyn ProcessRunner>,
    ) -> Self {
        let start_timeout = if start_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            start_timeout
        };
        Self {
            mode,
            binary: binary.into(),
            work_dir: work_dir.into(),
            socks_listen: socks_listen.into(),
            metrics_listen: metrics_listen.into(),
            start_timeout,
            runner,
            state: Mutex::new(InstanceState {
                proc: None,
                last_hash: String::new(),
            }),
            ready_client: reqwest::Client::builder()
                .timeout(Duration::from_millis(500))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Bring the child in line with the given configuration. No-op when a
    /// process is already running with the same hash.
    pub async fn ensure(&self, config_json: &[u8], hash: &str) -> RotapoolResult<()> {
        let mut state = self.state.lock().await;

        if state.proc.is_some() && state.last_hash == hash {
            return Ok(());
        }

        if let Some(mut proc) = state.proc.take() {
            let _ = proc.kill().await;
        }

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| RotapoolError::adapter(format!("create work_dir: {}", e)))?;

        let config_path = self.work_dir.join(format!("xray-{}.json", self.mode));
        tokio::fs::write(&config_path, config_json)
            .await
            .map_err(|e| RotapoolError::adapter(format!("write xray config: {}", e)))?;

        let args = vec![
            "run".to_string(),
            "-c".to_string(),
            config_path.to_string_lossy().into_owned(),
        ];
        let proc = self.runner.start(&self.binary, &args, &self.work_dir).await?;
        state.proc = Some(proc);

        if let Err(e) = self.wait_ready().await {
            if let Some(mut proc) = state.proc.take() {
                let _ = proc.kill().await;
            }
            state.last_hash.clear();
            return Err(e);
        }

        state.last_hash = hash.to_string();
        info!(
            mode = %self.mode,
            hash,
            socks = %self.socks_listen,
            metrics = %self.metrics_listen,
            "xray ready"
        );
        Ok(())
    }

    pub async fn stop(&self) -> RotapoolResult<()> {
        let mut state = self.state.lock().await;
        state.last_hash.clear();
        if let Some(mut proc) = state.proc.take() {
            proc.kill().await?;
        }
        Ok(())
    }

    /// Poll until the SOCKS port accepts TCP and the metrics endpoint
    /// answers 200, or the start timeout expires.
    async fn wait_ready(&self) -> RotapoolResult<()> {
        let deadline = tokio::time::Instant::now() + self.start_timeout;
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(RotapoolError::adapter("xray not ready before timeout"));
            }
            ticker.tick().await;

            let socks_ok = matches!(
                tokio::time::timeout(
                    Duration::from_millis(300),
                    TcpStream::connect(&self.socks_listen),
                )
                .await,
                Ok(Ok(_))
            );
            if !socks_ok {
                continue;
            }

            let url = format!("http://{}/debug/vars", self.metrics_listen);
            match self.ready_client.get(&url).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => return Ok(()),
                Ok(resp) => debug!(mode = %self.mode, status = %resp.status(), "metrics not ready"),
                Err(e) => debug!(mode = %self.mode, err = %e, "metrics not ready"),
            }
        }
    }
}
