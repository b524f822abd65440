//! Phase 1: raw TCP reachability checks

use crate::proxy::checker::{CheckerConfig, TransportProbe};
use crate::proxy::models::{EndpointDescriptor, ProbeOutcome};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Connects directly to each endpoint and closes the socket straight away
#[derive(Debug, Clone)]
pub struct TransportProber {
    timeout: Duration,
}

impl TransportProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &CheckerConfig) -> Self {
        Self::new(config.connect_timeout())
    }
}

#[async_trait]
impl TransportProbe for TransportProber {
    async fn probe(&self, descriptor: &EndpointDescriptor) -> ProbeOutcome {
        let addr = descriptor.address();
        let start = Instant::now();

        // The timeout covers name resolution as well as the handshake.
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => {
                let elapsed = start.elapsed().as_millis() as u64;
                drop(stream);
                debug!(%addr, elapsed_ms = elapsed, "transport reachable");
                ProbeOutcome::Reachable(elapsed)
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "transport unreachable");
                ProbeOutcome::Unreachable
            }
            Err(_) => {
                debug!(%addr, "transport connect timed out");
                ProbeOutcome::Unreachable
            }
        }
    }
}
