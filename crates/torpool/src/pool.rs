//! Pool supervisor
//!
//! Owns every daemon, port and data directory of the pool. Opening is
//! all-or-nothing: either every instance is up, or everything that was
//! started is torn down again before the error is returned, or when the
//! `open` future is dropped halfway. Shutdown is
//! best-effort and total, and also runs (synchronously) on drop.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{join_all, try_join_all};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::control;
use crate::credentials::{Credentials, PasswordHasher, TorPasswordHasher};
use crate::error::{PoolError, Result};
use crate::instance::{InstanceHandle, InstanceSpec};
use crate::launcher::{Launcher, TorLauncher};
use crate::ports::PortAssignment;
use crate::retry::RetryPolicy;
use crate::session::{RandomUserAgent, TorSession, UserAgentSource};

/// Assembles a [`TorPool`] with optional replacement components
///
/// # Example
///
/// ```ignore
/// use torpool::{PoolConfig, TorPool};
///
/// let pool = TorPool::builder(PoolConfig::new("/usr/bin/tor", 4))
///     .user_agents(MyAgents::load()?)
///     .open()
///     .await?;
/// ```
pub struct PoolBuilder {
    config: PoolConfig,
    launcher: Option<Arc<dyn Launcher>>,
    hasher: Option<Arc<dyn PasswordHasher>>,
    user_agents: Option<Arc<dyn UserAgentSource>>,
}

impl PoolBuilder {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            launcher: None,
            hasher: None,
            user_agents: None,
        }
    }

    /// Replace the Tor subprocess launcher
    pub fn launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    /// Replace `tor --hash-password`
    pub fn hasher(mut self, hasher: impl PasswordHasher + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    /// Replace the built-in user-agent list
    pub fn user_agents(mut self, source: impl UserAgentSource + 'static) -> Self {
        self.user_agents = Some(Arc::new(source));
        self
    }

    /// Bring up every instance
    #[instrument(skip(self), fields(instances = self.config.instances))]
    pub async fn open(self) -> Result<TorPool> {
        let config = self.config;
        config.validate()?;

        let hasher: Arc<dyn PasswordHasher> = match self.hasher {
            Some(hasher) => hasher,
            None => Arc::new(TorPasswordHasher::new(
                config.tor_binary.clone(),
                config.hash_regex()?,
            )),
        };
        let launcher: Arc<dyn Launcher> = match self.launcher {
            Some(launcher) => launcher,
            None => Arc::new(TorLauncher::from_config(&config)),
        };
        let user_agents: Arc<dyn UserAgentSource> = match self.user_agents {
            Some(source) => source,
            None => Arc::new(RandomUserAgent::default()),
        };

        info!(
            tor_binary = %config.tor_binary.display(),
            instances = config.instances,
            data_root = %config.data_root.display(),
            "Opening Tor pool"
        );

        let credentials = try_join_all(
            (0..config.instances)
                .map(|_| Credentials::generate(config.password_length(), hasher.as_ref())),
        )
        .await?;

        let ports = PortAssignment::allocate(config.host, config.instances)?;

        // Removes the directories if setup fails or this future is dropped.
        let mut dir_guard = DataDirGuard::new(!config.keep_data_dirs);
        create_data_dirs(&config.data_root, config.instances, &mut dir_guard).await?;

        let specs: Vec<InstanceSpec> = credentials
            .into_iter()
            .zip(dir_guard.dirs.iter().cloned())
            .enumerate()
            .map(|(index, (credentials, data_dir))| InstanceSpec {
                index,
                host: config.host,
                proxy_port: ports.proxy[index],
                control_port: ports.control[index],
                data_dir,
                credentials,
            })
            .collect();

        // Launched processes are dropped, and killed, if this future is.
        let launched = join_all(specs.iter().map(|spec| launcher.launch(spec))).await;

        let mut handles = Vec::with_capacity(specs.len());
        let mut first_error = None;
        for (index, result) in launched.into_iter().enumerate() {
            match result {
                Ok(process) => handles.push(InstanceHandle { index, process }),
                Err(e) => {
                    warn!(index, error = %e, "Instance failed to launch");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(err) = first_error {
            warn!(
                started = handles.len(),
                "Aborting pool startup, tearing down started instances"
            );
            terminate_all(handles).await;
            return Err(err);
        }

        dir_guard.disarm();
        info!(instances = specs.len(), "Tor pool ready");

        let rotation_locks = specs.iter().map(|_| tokio::sync::Mutex::new(())).collect();
        Ok(TorPool {
            config,
            specs,
            handles: Mutex::new(handles),
            rotation_locks,
            user_agents,
            open: true,
        })
    }
}

/// A running pool of Tor daemons
///
/// # Example
///
/// ```ignore
/// use torpool::{PoolConfig, TorPool};
///
/// let mut pool = TorPool::open(PoolConfig::new("/usr/bin/tor", 3)).await?;
///
/// pool.renew_identity(0).await?;
/// let body = pool.session(0)?.get("https://check.torproject.org/api/ip").send().await?;
///
/// pool.shutdown().await;
/// ```
pub struct TorPool {
    config: PoolConfig,
    specs: Vec<InstanceSpec>,
    handles: Mutex<Vec<InstanceHandle>>,
    rotation_locks: Vec<tokio::sync::Mutex<()>>,
    user_agents: Arc<dyn UserAgentSource>,
    open: bool,
}

impl TorPool {
    /// Open a pool with the default Tor launcher and hasher
    pub async fn open(config: PoolConfig) -> Result<Self> {
        PoolBuilder::new(config).open().await
    }

    pub fn builder(config: PoolConfig) -> PoolBuilder {
        PoolBuilder::new(config)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Every instance, index-aligned
    pub fn instances(&self) -> &[InstanceSpec] {
        &self.specs
    }

    pub fn instance(&self, index: usize) -> Result<&InstanceSpec> {
        self.specs.get(index).ok_or(PoolError::InstanceOutOfRange {
            index,
            count: self.specs.len(),
        })
    }

    /// Process ids of the running daemons
    pub fn pids(&self) -> Vec<Option<u32>> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|h| h.process.id())
            .collect()
    }

    fn open_instance(&self, index: usize) -> Result<&InstanceSpec> {
        if !self.open {
            return Err(PoolError::Closed);
        }
        self.instance(index)
    }

    /// HTTP session routed through instance `index`, with a fresh user agent
    pub fn session(&self, index: usize) -> Result<TorSession> {
        let spec = self.open_instance(index)?;
        TorSession::new(spec, self.user_agents.next_user_agent())
    }

    /// Give instance `index` a new identity and wait out the cooldown
    ///
    /// Concurrent calls for the same instance run one after another.
    #[instrument(skip(self))]
    pub async fn renew_identity(&self, index: usize) -> Result<std::time::Duration> {
        let spec = self.open_instance(index)?;
        let _guard = self.rotation_locks[index].lock().await;

        let cooldown = control::rotate_identity(
            spec.control_addr(),
            spec.credentials.password(),
            self.config.control_timeout,
            self.config.newnym_interval,
        )
        .await?;

        debug!(index, ?cooldown, "Identity renewed");
        Ok(cooldown)
    }

    /// [`renew_identity`](Self::renew_identity) under a retry policy
    pub async fn renew_identity_with_retry(
        &self,
        index: usize,
        policy: &RetryPolicy,
    ) -> Result<std::time::Duration> {
        policy.run(|_| self.renew_identity(index)).await
    }

    /// Stop every daemon, remove data directories and clear credentials
    ///
    /// Every step is attempted; failures are logged, never returned.
    /// Calling this more than once is harmless.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        info!(instances = self.specs.len(), "Shutting down Tor pool");

        let handles = std::mem::take(
            self.handles
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        terminate_all(handles).await;
        remove_data_dirs(&self.specs, self.config.keep_data_dirs).await;

        for spec in &mut self.specs {
            spec.credentials.clear();
        }

        info!("Tor pool stopped");
    }
}

impl Drop for TorPool {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        warn!("Tor pool dropped without shutdown, cleaning up");

        // Daemons are spawned with kill-on-drop.
        self.handles
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        for spec in &mut self.specs {
            if !self.config.keep_data_dirs {
                remove_dir_now(&spec.data_dir);
            }
            spec.credentials.clear();
        }
    }
}

/// Data directories created during setup, removed on drop while armed
struct DataDirGuard {
    dirs: Vec<PathBuf>,
    armed: bool,
}

impl DataDirGuard {
    fn new(armed: bool) -> Self {
        Self {
            dirs: Vec::new(),
            armed,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DataDirGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for dir in &self.dirs {
            remove_dir_now(dir);
        }
    }
}

fn remove_dir_now(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove data directory");
        }
    }
}

async fn create_data_dirs(root: &Path, count: usize, guard: &mut DataDirGuard) -> Result<()> {
    for index in 0..count {
        let dir = root.join(format!("instance-{index}-{}", Uuid::now_v7().simple()));
        guard.dirs.push(dir.clone());
        create_private_dir(&dir).await?;
    }
    Ok(())
}

async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

async fn terminate_all(handles: Vec<InstanceHandle>) {
    let results = join_all(handles.into_iter().map(|mut handle| async move {
        let result = handle.process.terminate().await;
        (handle.index, result)
    }))
    .await;

    for (index, result) in results {
        match result {
            Ok(()) => debug!(index, "Instance terminated"),
            Err(e) => warn!(index, error = %e, "Failed to terminate instance"),
        }
    }
}

async fn remove_data_dirs(specs: &[InstanceSpec], keep: bool) {
    for spec in specs {
        if keep {
            info!(index = spec.index, dir = %spec.data_dir.display(), "Keeping data directory");
            continue;
        }
        match tokio::fs::remove_dir_all(&spec.data_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(index = spec.index, error = %e, "Failed to remove data directory"),
        }
    }
}
