//! Per-instance state
//!
//! An [`InstanceSpec`] is everything one daemon needs to run in isolation.
//! An [`InstanceHandle`] is the running daemon, owned by the pool.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::credentials::Credentials;
use crate::launcher::DaemonProcess;

/// Ports, data directory and credentials of one pool slot
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub index: usize,
    pub host: IpAddr,
    pub proxy_port: u16,
    pub control_port: u16,
    pub data_dir: PathBuf,
    pub credentials: Credentials,
}

impl InstanceSpec {
    /// SOCKS5 endpoint
    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.proxy_port)
    }

    /// Control-port endpoint
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.control_port)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Proxy URL with remote DNS resolution, so hostnames resolve at the exit
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}", self.proxy_addr())
    }
}

/// A running daemon and the slot it belongs to
pub struct InstanceHandle {
    pub index: usize,
    pub process: Box<dyn DaemonProcess>,
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("index", &self.index)
            .field("pid", &self.process.id())
            .finish()
    }
}
