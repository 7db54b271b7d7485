//! Tor subprocess launcher

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, trace, warn};

use super::{DaemonProcess, Launcher};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::instance::InstanceSpec;

/// How long a daemon that closed its output gets to exit before it is killed
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Command-line configuration for one daemon
///
/// Tor accepts any torrc option as `--Key value`. The torrc path points into
/// the private data directory so a system-wide torrc is never picked up.
pub fn launch_args(spec: &InstanceSpec) -> Vec<OsString> {
    let torrc = spec.data_dir.join("torrc");
    vec![
        "-f".into(),
        torrc.into_os_string(),
        "--ignore-missing-torrc".into(),
        "--SOCKSPort".into(),
        spec.proxy_addr().to_string().into(),
        "--ControlPort".into(),
        spec.control_addr().to_string().into(),
        "--DataDirectory".into(),
        spec.data_dir.clone().into_os_string(),
        "--HashedControlPassword".into(),
        spec.credentials.hashed_password().into(),
        "--CookieAuthentication".into(),
        "1".into(),
        "--Log".into(),
        "notice stdout".into(),
    ]
}

/// [`Launcher`] that runs the Tor binary
#[derive(Debug, Clone)]
pub struct TorLauncher {
    tor_binary: PathBuf,
    ready_marker: String,
    bootstrap_timeout: Duration,
}

impl TorLauncher {
    pub fn new(tor_binary: impl Into<PathBuf>) -> Self {
        let defaults = PoolConfig::default();
        Self {
            tor_binary: tor_binary.into(),
            ready_marker: defaults.ready_marker,
            bootstrap_timeout: defaults.bootstrap_timeout,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            tor_binary: config.tor_binary.clone(),
            ready_marker: config.ready_marker.clone(),
            bootstrap_timeout: config.bootstrap_timeout,
        }
    }

    pub fn with_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = marker.into();
        self
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }
}

#[async_trait]
impl Launcher for TorLauncher {
    #[instrument(skip(self, spec), fields(index = spec.index, socks = %spec.proxy_addr()))]
    async fn launch(&self, spec: &InstanceSpec) -> Result<Box<dyn DaemonProcess>> {
        let index = spec.index;
        let launch_error = |reason: String| PoolError::Launch { index, reason };

        let mut child = Command::new(&self.tor_binary)
            .args(launch_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_error(format!("cannot start {}: {e}", self.tor_binary.display())))?;

        if let Some(stderr) = child.stderr.take() {
            forward_output(index, "stderr", BufReader::new(stderr).lines());
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut last_line = None;
        let waited = tokio::time::timeout(
            self.bootstrap_timeout,
            wait_for_marker(&mut lines, &self.ready_marker, &mut last_line),
        )
        .await;

        match waited {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                let status = reap(&mut child, EXIT_GRACE).await;
                return Err(launch_error(format!(
                    "exited before becoming ready ({status}); last output: {}",
                    last_line.as_deref().unwrap_or("<none>")
                )));
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(launch_error(format!("reading output: {e}")));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(launch_error(format!(
                    "not ready after {:?}; last output: {}",
                    self.bootstrap_timeout,
                    last_line.as_deref().unwrap_or("<none>")
                )));
            }
        }

        forward_output(index, "stdout", lines);

        info!(pid = ?child.id(), "Tor instance ready");
        Ok(Box::new(TorProcess { index, child }))
    }
}

/// Read lines until one contains `marker`; `false` on end of output
async fn wait_for_marker<R>(
    lines: &mut Lines<R>,
    marker: &str,
    last_line: &mut Option<String>,
) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        trace!(%line, "tor");
        let ready = line.contains(marker);
        *last_line = Some(line);
        if ready {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Describe how `child` ended, killing it if it outlives `grace`
async fn reap(child: &mut Child, grace: Duration) -> String {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(_) => {
            let _ = child.kill().await;
            format!("closed its output but still running after {grace:?}, killed")
        }
    }
}

/// Keep draining a pipe so the daemon never blocks on a full buffer
fn forward_output<R>(index: usize, stream: &'static str, mut lines: Lines<BufReader<R>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(index, stream, %line, "tor");
        }
    });
}

/// A Tor daemon started by [`TorLauncher`]
#[derive(Debug)]
pub struct TorProcess {
    index: usize,
    child: Child,
}

#[async_trait]
impl DaemonProcess for TorProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> Result<()> {
        match self.child.try_wait()? {
            Some(status) => {
                warn!(index = self.index, %status, "Tor instance had already exited");
                Ok(())
            }
            None => {
                self.child.kill().await?;
                debug!(index = self.index, "Tor instance terminated");
                Ok(())
            }
        }
    }
}
