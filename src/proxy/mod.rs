//! Proxy module for triaging endpoint descriptors
//!
//! This module provides functionality for:
//! - Parsing `vless://` descriptors into structured endpoints
//! - Dropping repeated servers by `(host, port)` identity
//! - Cheap TCP reachability checks (phase 1)
//! - End-to-end latency checks through a spawned tunnel (phase 2)
//! - Country annotation from an offline MMDB database
//! - Threshold filtering and deterministic ordering of results

pub mod aggregate;
pub mod checker;
pub mod dedup;
pub mod geo;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod transport;
pub mod tunnel;

pub use aggregate::ResultAggregator;
pub use checker::{CheckerConfig, CountryLookup, SortOrder, TransportProbe, TunnelProbe};
pub use dedup::IdentitySet;
pub use geo::{GeoAnnotator, GeoLocator};
pub use models::{
    AnnotatedResult, EndpointDescriptor, ProbeOutcome, SecurityMode, ServerIdentity,
    StreamParams, TransportType, UNKNOWN_COUNTRY,
};
pub use parser::{DescriptorParser, ParseError, ParsedBatch};
pub use pipeline::{Pipeline, RunReport};
pub use transport::TransportProber;
pub use tunnel::{TunnelError, TunnelProber};
