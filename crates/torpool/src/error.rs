//! Error types for the pool
//!
//! Setup errors (`HashGeneration`, `PortAllocation`, `Launch`) abort
//! [`TorPool::open`](crate::TorPool::open). Everything else is local to one
//! instance and surfaces as that item's result during dispatch.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the pool and its components
#[derive(Debug, Error)]
pub enum PoolError {
    /// The daemon could not hash a control password
    #[error("password hash generation failed: {0}")]
    HashGeneration(String),

    /// Not enough free local ports could be reserved
    #[error("port allocation failed: {0}")]
    PortAllocation(#[source] std::io::Error),

    /// A daemon failed to start or exited before it became ready
    #[error("instance {index} failed to launch: {reason}")]
    Launch { index: usize, reason: String },

    /// The control port refused or dropped the connection
    #[error("cannot connect to control port {addr}: {source}")]
    ControlConnect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The daemon rejected the control password
    #[error("control authentication rejected: {0}")]
    Authentication(String),

    /// The control channel answered with something unexpected
    #[error("control protocol error: {0}")]
    Control(String),

    /// A request made by a work function failed
    #[error("request failed: {0}")]
    Request(String),

    /// An operation did not complete within its bound
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An instance index outside the pool was used
    #[error("instance {index} out of range (pool has {count} instances)")]
    InstanceOutOfRange { index: usize, count: usize },

    /// The pool configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The pool was used after shutdown
    #[error("pool has been shut down")]
    Closed,

    /// Filesystem or socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for PoolError {
    fn from(err: reqwest::Error) -> Self {
        PoolError::Request(err.to_string())
    }
}

impl PoolError {
    /// Short machine-readable name, matched against
    /// [`RetryPolicy::non_retryable_errors`](crate::RetryPolicy)
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::HashGeneration(_) => "HASH_GENERATION",
            PoolError::PortAllocation(_) => "PORT_ALLOCATION",
            PoolError::Launch { .. } => "LAUNCH",
            PoolError::ControlConnect { .. } => "CONTROL_CONNECT",
            PoolError::Authentication(_) => "AUTHENTICATION",
            PoolError::Control(_) => "CONTROL",
            PoolError::Request(_) => "REQUEST",
            PoolError::Timeout(_) => "TIMEOUT",
            PoolError::InstanceOutOfRange { .. } => "INSTANCE_OUT_OF_RANGE",
            PoolError::InvalidConfig(_) => "INVALID_CONFIG",
            PoolError::Closed => "CLOSED",
            PoolError::Io(_) => "IO",
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = PoolError> = std::result::Result<T, E>;
