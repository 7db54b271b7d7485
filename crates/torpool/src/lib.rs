//! # torpool
//!
//! Supervises a pool of Tor daemons and routes batches of work through them,
//! rotating each daemon's identity along the way.
//!
//! ## Features
//!
//! - **Isolated instances**: every daemon gets its own SOCKS port, control
//!   port, control password and data directory
//! - **All-or-nothing startup**: daemons launch concurrently; if one fails,
//!   the others are torn down before the error is returned
//! - **Identity rotation**: authenticated `SIGNAL NEWNYM` with the
//!   daemon-mandated cooldown
//! - **Batch dispatch**: items are split into balanced, ordered batches, one
//!   concurrent worker per instance, results returned by batch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TorPool                              │
//! │  (credentials, ports, data dirs, handles, teardown)         │
//! └─────────────────────────────────────────────────────────────┘
//!          │ launch                          │ dispatch
//!          ▼                                 ▼
//! ┌──────────────────────┐      ┌──────────────────────────────┐
//! │  Launcher (tor)      │      │  Worker 0 .. Worker N-1       │
//! │  one per instance    │      │  session → NEWNYM → work fn   │
//! └──────────────────────┘      └──────────────────────────────┘
//!                                            │
//!                                            ▼
//!                         control port (NEWNYM), SOCKS5 port (requests)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use torpool::prelude::*;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl WorkFunction<u32> for Echo {
//!     type Output = (usize, u32);
//!
//!     async fn call(&self, ctx: &WorkContext<'_>, item: u32) -> Result<Self::Output, PoolError> {
//!         Ok((ctx.index(), item))
//!     }
//! }
//!
//! let mut pool = TorPool::open(PoolConfig::new("/usr/bin/tor", 3)).await?;
//! let batches = pool.dispatch((0..9).collect(), &Echo).await;
//! pool.shutdown().await;
//! ```

pub mod config;
pub mod control;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod launcher;
pub mod pool;
pub mod ports;
pub mod retry;
pub mod session;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{DispatchConfig, PoolConfig, RotationPolicy};
    pub use crate::dispatch::{BatchResult, WorkContext, WorkFunction};
    pub use crate::error::PoolError;
    pub use crate::pool::TorPool;
    pub use crate::retry::RetryPolicy;
    pub use crate::session::TorSession;
}

// Re-export key types at crate root
pub use config::{DispatchConfig, PoolConfig, RotationPolicy};
pub use credentials::{Credentials, PasswordHasher, TorPasswordHasher};
pub use dispatch::{flatten, partition, BatchResult, WorkContext, WorkFunction};
pub use error::{PoolError, Result};
pub use instance::{InstanceHandle, InstanceSpec};
pub use launcher::{DaemonProcess, Launcher, TorLauncher};
pub use pool::{PoolBuilder, TorPool};
pub use ports::{allocate_ports, PortAssignment};
pub use retry::RetryPolicy;
pub use session::{RandomUserAgent, TorSession, UserAgentSource};
