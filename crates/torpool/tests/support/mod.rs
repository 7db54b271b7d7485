//! Stub daemon for pool tests
//!
//! `StubLauncher` stands in for Tor: each "process" is a task serving the
//! control protocol on the instance's control port. It accepts any password
//! (unless told to reject), answers NEWNYM with a configurable delay notice
//! and records what happened so tests can assert on it.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use torpool::{DaemonProcess, InstanceSpec, Launcher, PasswordHasher, PoolError, Result};

#[derive(Debug, Default)]
pub struct StubState {
    launches: AtomicUsize,
    running: AtomicUsize,
    terminated: Mutex<Vec<usize>>,
    rotations: Mutex<Vec<usize>>,
}

impl StubState {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> Vec<usize> {
        let mut terminated = self.terminated.lock().unwrap().clone();
        terminated.sort_unstable();
        terminated
    }

    /// Instance index of every NEWNYM received, in arrival order
    pub fn rotations(&self) -> Vec<usize> {
        self.rotations.lock().unwrap().clone()
    }

    pub fn rotations_for(&self, index: usize) -> usize {
        self.rotations().iter().filter(|&&i| i == index).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StubLauncher {
    pub state: Arc<StubState>,
    fail_on_call: Option<usize>,
    hang_on_call: Option<usize>,
    reject_auth: bool,
    newnym_delay_secs: u64,
}

impl StubLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`-th launch (1-based)
    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Never finish the `call`-th launch (1-based)
    pub fn hanging_on(mut self, call: usize) -> Self {
        self.hang_on_call = Some(call);
        self
    }

    pub fn rejecting_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    pub fn with_newnym_delay(mut self, secs: u64) -> Self {
        self.newnym_delay_secs = secs;
        self
    }
}

#[async_trait]
impl Launcher for StubLauncher {
    async fn launch(&self, spec: &InstanceSpec) -> Result<Box<dyn DaemonProcess>> {
        let call = self.state.launches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(PoolError::Launch {
                index: spec.index,
                reason: "injected failure".to_string(),
            });
        }
        if self.hang_on_call == Some(call) {
            return std::future::pending().await;
        }

        let listener = TcpListener::bind(spec.control_addr())
            .await
            .map_err(|e| PoolError::Launch {
                index: spec.index,
                reason: e.to_string(),
            })?;

        let index = spec.index;
        let state = Arc::clone(&self.state);
        let reject_auth = self.reject_auth;
        let delay = self.newnym_delay_secs;

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&state);
                tokio::spawn(serve_control(stream, index, state, reject_auth, delay));
            }
        });

        self.state.running.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubProcess {
            index,
            task,
            state: Arc::clone(&self.state),
            alive: AtomicBool::new(true),
        }))
    }
}

async fn serve_control(
    stream: TcpStream,
    index: usize,
    state: Arc<StubState>,
    reject_auth: bool,
    delay: u64,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let response = if line.starts_with("AUTHENTICATE") {
            if reject_auth {
                "515 Authentication failed\r\n".to_string()
            } else {
                "250 OK\r\n".to_string()
            }
        } else if line == "SIGNAL NEWNYM" {
            state.rotations.lock().unwrap().push(index);
            // Tor acknowledges first and logs the rate limit afterwards.
            format!(
                "250 OK\r\n650 NOTICE Rate limiting NEWNYM request: delaying by {delay} second(s)\r\n"
            )
        } else if line == "QUIT" {
            let _ = write.write_all(b"250 closing connection\r\n").await;
            break;
        } else {
            "250 OK\r\n".to_string()
        };

        if write.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[derive(Debug)]
pub struct StubProcess {
    index: usize,
    task: JoinHandle<()>,
    state: Arc<StubState>,
    alive: AtomicBool,
}

impl StubProcess {
    fn stop(&self) -> bool {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.task.abort();
            self.state.running.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl DaemonProcess for StubProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.stop() {
            self.state.terminated.lock().unwrap().push(self.index);
        }
        Ok(())
    }
}

impl Drop for StubProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hashes by prefixing, like Tor's `16:` tokens
#[derive(Debug, Clone, Default)]
pub struct StubHasher {
    pub fail: bool,
}

#[async_trait]
impl PasswordHasher for StubHasher {
    async fn hash(&self, password: &str) -> Result<String> {
        if self.fail {
            return Err(PoolError::HashGeneration("stub hasher failure".to_string()));
        }
        Ok(format!("16:{:0>58}", password.len()))
    }
}

/// Entries directly under `dir`
pub fn dir_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
