//! Pipeline driver: parse, deduplicate, probe twice, annotate, rank

use crate::proxy::aggregate::ResultAggregator;
use crate::proxy::checker::{CheckerConfig, CountryLookup, TransportProbe, TunnelProbe};
use crate::proxy::dedup::IdentitySet;
use crate::proxy::geo::GeoAnnotator;
use crate::proxy::models::{AnnotatedResult, EndpointDescriptor};
use crate::proxy::parser::DescriptorParser;
use crate::proxy::transport::TransportProber;
use crate::proxy::tunnel::TunnelProber;
use crate::Result;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Per-phase counts and the final ordered results of one run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Descriptors that parsed successfully
    pub parsed: usize,
    /// Candidate lines that failed to parse
    pub rejected: usize,
    /// Descriptors left after dropping repeated identities
    pub unique: usize,
    /// Unique descriptors that accepted a transport connection
    pub reachable: usize,
    /// Reachable descriptors whose tunnel probe succeeded
    pub tunneled: usize,
    pub results: Vec<AnnotatedResult>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Parsed:       {} ({} rejected)", self.parsed, self.rejected)?;
        writeln!(f, "Unique:       {}", self.unique)?;
        writeln!(f, "Reachable:    {}", self.reachable)?;
        writeln!(f, "Tunnel OK:    {}", self.tunneled)?;
        write!(f, "Under limit:  {}", self.results.len())
    }
}

/// Two-phase checker over a batch of descriptors
pub struct Pipeline<T, U, G> {
    config: CheckerConfig,
    transport: T,
    tunnel: U,
    geo: G,
}

impl Pipeline<TransportProber, TunnelProber, GeoAnnotator> {
    /// Pipeline with the real probers and the configured geolocation database
    pub fn with_config(config: CheckerConfig) -> Self {
        let transport = TransportProber::from_config(&config);
        let tunnel = TunnelProber::with_config(&config);
        let geo = GeoAnnotator::open_or_disabled(config.mmdb_path.as_deref())
            .with_resolve_timeout(config.probe_timeout());
        Self::new(config, transport, tunnel, geo)
    }
}

impl<T, U, G> Pipeline<T, U, G>
where
    T: TransportProbe,
    U: TunnelProbe,
    G: CountryLookup,
{
    pub fn new(config: CheckerConfig, transport: T, tunnel: U, geo: G) -> Self {
        Self {
            config,
            transport,
            tunnel,
            geo,
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Run on the descriptors in `path`
    pub async fn run_file<P: AsRef<Path>>(&self, path: P) -> Result<RunReport> {
        let batch = DescriptorParser::parse_file(path)?;
        let mut report = self.run(batch.descriptors).await;
        report.rejected = batch.rejected;
        Ok(report)
    }

    /// Run on raw descriptor text, one descriptor per line
    pub async fn run_lines(&self, content: &str) -> RunReport {
        let batch = DescriptorParser::parse_string(content);
        let mut report = self.run(batch.descriptors).await;
        report.rejected = batch.rejected;
        report
    }

    /// Run on already parsed descriptors
    pub async fn run(&self, descriptors: Vec<EndpointDescriptor>) -> RunReport {
        let parsed = descriptors.len();
        info!(
            descriptors = parsed,
            threshold_ms = self.config.threshold_ms(),
            "starting triage"
        );

        let seen = IdentitySet::new();
        let survivors = self.transport_phase(descriptors, &seen).await;
        let unique = seen.len();
        let reachable = survivors.len();
        info!(unique, reachable, "transport phase done");

        let mut aggregator = ResultAggregator::new(self.config.threshold_ms(), self.config.sort_order);
        let passed = self.tunnel_phase(survivors, &aggregator).await;
        let tunneled = passed.len();
        info!(tunneled, "tunnel phase done");

        for (descriptor, latency, country) in passed {
            match country {
                Some(country) => {
                    aggregator.push(descriptor, latency, country);
                }
                None => debug!(
                    identity = %descriptor.identity(),
                    latency_ms = latency,
                    "dropping result over threshold"
                ),
            }
        }
        let results = aggregator.finish();
        info!(results = results.len(), "triage finished");

        RunReport {
            parsed,
            rejected: 0,
            unique,
            reachable,
            tunneled,
            results,
        }
    }

    /// Phase 1: drop repeated identities, then keep what accepts a connection
    async fn transport_phase(
        &self,
        descriptors: Vec<EndpointDescriptor>,
        seen: &IdentitySet,
    ) -> Vec<EndpointDescriptor> {
        stream::iter(descriptors)
            .map(|descriptor| async move {
                if !seen.try_accept(&descriptor.identity()) {
                    debug!(identity = %descriptor.identity(), "duplicate identity dropped");
                    return None;
                }
                if self.transport.probe(&descriptor).await.is_reachable() {
                    Some(descriptor)
                } else {
                    None
                }
            })
            .buffer_unordered(self.config.transport_concurrency)
            .filter_map(|d| async move { d })
            .collect()
            .await
    }

    /// Phase 2: tunnel probe each survivor and annotate the successes
    ///
    /// Returns `(descriptor, latency, country)` for every successful probe.
    /// Only results under the threshold are looked up, the rest carry `None`.
    async fn tunnel_phase(
        &self,
        descriptors: Vec<EndpointDescriptor>,
        aggregator: &ResultAggregator,
    ) -> Vec<(EndpointDescriptor, u64, Option<String>)> {
        stream::iter(descriptors)
            .map(|descriptor| async move {
                let outcome = self.tunnel.probe(&descriptor).await;
                let latency = outcome.latency_ms()?;
                let country = match aggregator.accepted_latency(&outcome) {
                    Some(_) => Some(self.geo.lookup_country(&descriptor.host).await),
                    None => None,
                };
                Some((descriptor, latency, country))
            })
            .buffer_unordered(self.config.tunnel_concurrency)
            .filter_map(|r| async move { r })
            .collect()
            .await
    }
}
