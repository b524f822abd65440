//! Tunnel prober: one real request through a fresh tunnel per endpoint

use crate::proxy::checker::{CheckerConfig, TunnelProbe};
use crate::proxy::models::{EndpointDescriptor, ProbeOutcome};
use crate::proxy::tunnel::ports::{port_is_free, PortPool};
use crate::proxy::tunnel::session::{SessionSettings, TunnelSession};
use crate::proxy::tunnel::TunnelError;
use async_trait::async_trait;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Spawns a tunnel per endpoint and times a request routed through it
pub struct TunnelProber {
    settings: SessionSettings,
    ports: Arc<PortPool>,
    port_attempts: usize,
    probe_timeout: Duration,
    test_url: String,
}

impl TunnelProber {
    /// Build a prober whose port pool matches the tunnel concurrency
    pub fn with_config(config: &CheckerConfig) -> Self {
        Self {
            settings: SessionSettings {
                binary: config.tunnel_binary.clone(),
                config_dir: config.config_dir.clone(),
                ready_timeout: config.ready_timeout,
                ready_poll_interval: config.ready_poll_interval,
                kill_grace: config.kill_grace,
            },
            ports: PortPool::new(config.base_port, config.tunnel_concurrency),
            port_attempts: config.port_attempts,
            probe_timeout: config.probe_timeout(),
            test_url: config.test_url.clone(),
        }
    }

    async fn probe_inner(&self, descriptor: &EndpointDescriptor) -> Result<u64, TunnelError> {
        let lease = self.ports.lease().ok_or(TunnelError::PortsExhausted)?;

        let mut last_error = TunnelError::PortsExhausted;
        for attempt in 0..self.port_attempts {
            let Some(port) = lease.port(attempt) else {
                break;
            };
            if !port_is_free(port) {
                debug!(port, "tunnel port busy, trying next");
                last_error = TunnelError::PortInUse(port);
                continue;
            }

            match self.run_session(descriptor, port).await {
                Err(e) if e.is_port_related() => {
                    debug!(port, error = %e, "tunnel failed to start, retrying on another port");
                    last_error = e;
                }
                other => return other,
            }
        }
        Err(last_error)
    }

    /// Open a session, probe through it, and always shut it down
    async fn run_session(&self, descriptor: &EndpointDescriptor, port: u16) -> Result<u64, TunnelError> {
        let mut session = TunnelSession::open(descriptor, port, &self.settings).await?;
        let result = self.probe_session(&mut session).await;
        session.shutdown().await;
        result
    }

    async fn probe_session(&self, session: &mut TunnelSession) -> Result<u64, TunnelError> {
        session
            .wait_ready(self.settings.ready_timeout, self.settings.ready_poll_interval)
            .await?;

        let client = self.create_client(&session.proxy_url())?;
        let start = Instant::now();
        match tokio::time::timeout(self.probe_timeout, client.get(&self.test_url).send()).await {
            Ok(Ok(response)) => {
                let elapsed = start.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    Ok(elapsed)
                } else {
                    Err(TunnelError::Status(response.status().as_u16()))
                }
            }
            Ok(Err(e)) => Err(TunnelError::Request(e.to_string())),
            Err(_) => Err(TunnelError::ProbeTimeout(self.probe_timeout)),
        }
    }

    /// Create a reqwest client routed through the tunnel's SOCKS listener
    ///
    /// The request deadline is enforced by the caller.
    fn create_client(&self, proxy_url: &str) -> Result<Client, TunnelError> {
        let proxy = ReqwestProxy::all(proxy_url).map_err(|e| TunnelError::Client(e.to_string()))?;

        Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|e| TunnelError::Client(e.to_string()))
    }
}

#[async_trait]
impl TunnelProbe for TunnelProber {
    async fn probe(&self, descriptor: &EndpointDescriptor) -> ProbeOutcome {
        match self.probe_inner(descriptor).await {
            Ok(elapsed) => {
                debug!(identity = %descriptor.identity(), elapsed_ms = elapsed, "tunnel probe succeeded");
                ProbeOutcome::Reachable(elapsed)
            }
            Err(e) => {
                debug!(identity = %descriptor.identity(), error = %e, "tunnel probe failed");
                ProbeOutcome::TunnelFailure(e.to_string())
            }
        }
    }
}
