//! Checker configuration and the probe interfaces used by the pipeline

use crate::proxy::models::{EndpointDescriptor, ProbeOutcome};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Default latency threshold in milliseconds
pub const DEFAULT_THRESHOLD_MS: u64 = 150;

/// Slack added to the threshold when deriving timeouts
const TIMEOUT_SLACK_MS: u64 = 500;

/// Default number of concurrent transport checks
const DEFAULT_TRANSPORT_CONCURRENCY: usize = 50;

/// Default number of concurrent tunnel checks
const DEFAULT_TUNNEL_CONCURRENCY: usize = 8;

/// Default URL to fetch through each tunnel
const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Default tunnel executable, resolved through `PATH`
const DEFAULT_TUNNEL_BINARY: &str = "xray";

/// First local port handed to tunnel listeners
const DEFAULT_BASE_PORT: u16 = 20800;

/// Ordering applied to the final result list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Lexicographic by output line
    #[default]
    Descriptor,
    /// Fastest first, ties broken by output line
    Latency,
}

/// Configuration for a triage run
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Results must be strictly faster than this
    pub threshold: Duration,
    /// Transport connect timeout; derived from `threshold` when unset
    pub connect_timeout: Option<Duration>,
    /// Tunnel request timeout; derived from `threshold` when unset
    pub probe_timeout: Option<Duration>,
    pub transport_concurrency: usize,
    pub tunnel_concurrency: usize,
    /// URL to fetch through each tunnel
    pub test_url: String,
    /// Path to MMDB file for geolocation (optional)
    pub mmdb_path: Option<PathBuf>,
    pub tunnel_binary: PathBuf,
    pub base_port: u16,
    /// Ports tried per tunnel probe before giving up
    pub port_attempts: usize,
    /// How long a spawned tunnel has to start listening
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL on teardown
    pub kill_grace: Duration,
    /// Directory for generated tunnel configs
    pub config_dir: PathBuf,
    pub sort_order: SortOrder,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_millis(DEFAULT_THRESHOLD_MS),
            connect_timeout: None,
            probe_timeout: None,
            transport_concurrency: DEFAULT_TRANSPORT_CONCURRENCY,
            tunnel_concurrency: DEFAULT_TUNNEL_CONCURRENCY,
            test_url: DEFAULT_TEST_URL.to_string(),
            mmdb_path: None,
            tunnel_binary: PathBuf::from(DEFAULT_TUNNEL_BINARY),
            base_port: DEFAULT_BASE_PORT,
            port_attempts: 3,
            ready_timeout: Duration::from_secs(3),
            ready_poll_interval: Duration::from_millis(50),
            kill_grace: Duration::from_secs(1),
            config_dir: std::env::temp_dir(),
            sort_order: SortOrder::default(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn with_transport_concurrency(mut self, concurrency: usize) -> Self {
        self.transport_concurrency = concurrency.max(1);
        self
    }

    pub fn with_tunnel_concurrency(mut self, concurrency: usize) -> Self {
        self.tunnel_concurrency = concurrency.max(1);
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_mmdb_path(mut self, path: PathBuf) -> Self {
        self.mmdb_path = Some(path);
        self
    }

    pub fn with_tunnel_binary(mut self, path: PathBuf) -> Self {
        self.tunnel_binary = path;
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_port_attempts(mut self, attempts: usize) -> Self {
        self.port_attempts = attempts.max(1);
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_config_dir(mut self, dir: PathBuf) -> Self {
        self.config_dir = dir;
        self
    }

    pub fn with_sort_order(mut self, order: SortOrder) -> Self {
        self.sort_order = order;
        self
    }

    fn derived_timeout(&self) -> Duration {
        self.threshold + Duration::from_millis(TIMEOUT_SLACK_MS)
    }

    /// Effective transport connect timeout
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or_else(|| self.derived_timeout())
    }

    /// Effective tunnel request timeout
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout.unwrap_or_else(|| self.derived_timeout())
    }

    pub fn threshold_ms(&self) -> u64 {
        u64::try_from(self.threshold.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Phase 1: raw reachability check
#[async_trait]
pub trait TransportProbe: Send + Sync {
    /// Returns `Reachable` or `Unreachable`, never `TunnelFailure`
    async fn probe(&self, descriptor: &EndpointDescriptor) -> ProbeOutcome;
}

/// Phase 2: end-to-end check through a real tunnel
#[async_trait]
pub trait TunnelProbe: Send + Sync {
    /// Returns `Reachable` with the measured latency or `TunnelFailure`
    async fn probe(&self, descriptor: &EndpointDescriptor) -> ProbeOutcome;
}

/// Country lookup for a descriptor host
#[async_trait]
pub trait CountryLookup: Send + Sync {
    /// ISO country code, or [`UNKNOWN_COUNTRY`](crate::proxy::models::UNKNOWN_COUNTRY)
    async fn lookup_country(&self, host: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checker_config_default() {
        let config = CheckerConfig::default();
        assert_eq!(config.threshold, Duration::from_millis(DEFAULT_THRESHOLD_MS));
        assert_eq!(config.transport_concurrency, DEFAULT_TRANSPORT_CONCURRENCY);
        assert_eq!(config.tunnel_concurrency, DEFAULT_TUNNEL_CONCURRENCY);
        assert!(config.tunnel_concurrency < config.transport_concurrency);
        assert_eq!(config.test_url, DEFAULT_TEST_URL);
        assert_eq!(config.sort_order, SortOrder::Descriptor);
    }

    #[test]
    fn test_timeouts_derive_from_threshold() {
        let config = CheckerConfig::new().with_threshold(Duration::from_millis(300));
        assert_eq!(config.connect_timeout(), Duration::from_millis(800));
        assert_eq!(config.probe_timeout(), Duration::from_millis(800));
        assert_eq!(config.threshold_ms(), 300);
    }

    #[test]
    fn test_timeouts_independent_when_set() {
        let config = CheckerConfig::new()
            .with_threshold(Duration::from_millis(300))
            .with_connect_timeout(Duration::from_secs(2))
            .with_probe_timeout(Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_checker_config_builder() {
        let config = CheckerConfig::new()
            .with_transport_concurrency(0)
            .with_tunnel_concurrency(4)
            .with_test_url("http://example.com".to_string())
            .with_sort_order(SortOrder::Latency);

        assert_eq!(config.transport_concurrency, 1);
        assert_eq!(config.tunnel_concurrency, 4);
        assert_eq!(config.test_url, "http://example.com");
        assert_eq!(config.sort_order, SortOrder::Latency);
    }
}
