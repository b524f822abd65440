//! Phase 2: end-to-end probing through a locally spawned tunnel
//!
//! - `config` renders the per-probe tunnel configuration
//! - `ports` partitions loopback ports between concurrent probes
//! - `session` owns one tunnel process and its config file
//! - `prober` drives a session through allocate, spawn, probe and teardown

pub mod config;
pub mod ports;
pub mod prober;
pub mod session;

pub use ports::{PortLease, PortPool};
pub use prober::TunnelProber;
pub use session::{SessionSettings, TunnelSession};

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures while setting up or using a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("no free tunnel port slot")]
    PortsExhausted,
    #[error("local port {0} already in use")]
    PortInUse(u16),
    #[error("cannot build tunnel config: {0}")]
    InvalidDescriptor(String),
    #[error("failed to write tunnel config: {0}")]
    ConfigWrite(String),
    #[error("tunnel binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),
    #[error("failed to spawn tunnel: {0}")]
    Spawn(String),
    #[error("tunnel exited before becoming ready: {0}")]
    ProcessExited(String),
    #[error("tunnel not ready after {0:?}")]
    ReadyTimeout(Duration),
    #[error("failed to build probe client: {0}")]
    Client(String),
    #[error("probe request failed: {0}")]
    Request(String),
    #[error("probe returned HTTP status {0}")]
    Status(u16),
    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),
}

impl TunnelError {
    /// Errors that may go away on a different local port
    pub fn is_port_related(&self) -> bool {
        matches!(self, TunnelError::PortInUse(_) | TunnelError::ProcessExited(_))
    }
}
