//! Daemon launching
//!
//! This module provides:
//! - [`Launcher`] - starts one daemon for an [`InstanceSpec`]
//! - [`DaemonProcess`] - a started daemon that can be terminated
//! - [`TorLauncher`] - the real implementation, spawning the Tor binary
//!
//! The pool only talks to these traits, which keeps startup and teardown
//! testable without a Tor binary.

mod tor;

pub use tor::{launch_args, TorLauncher, TorProcess};

use async_trait::async_trait;

use crate::error::Result;
use crate::instance::InstanceSpec;

/// Starts daemons
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a daemon bound to exactly `spec`'s endpoints and data directory
    ///
    /// Returns once the daemon is ready to serve. An error means nothing is
    /// left running for this spec.
    async fn launch(&self, spec: &InstanceSpec) -> Result<Box<dyn DaemonProcess>>;
}

/// A started daemon
#[async_trait]
pub trait DaemonProcess: Send {
    /// OS process id, if there is one
    fn id(&self) -> Option<u32>;

    /// Stop the daemon and wait for it to exit
    async fn terminate(&mut self) -> Result<()>;
}
