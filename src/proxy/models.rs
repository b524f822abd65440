//! Endpoint data models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;

/// Country code used when geolocation cannot be determined
pub const UNKNOWN_COUNTRY: &str = "??";

/// Port assumed when a descriptor omits one
pub const DEFAULT_PORT: u16 = 443;

/// Transport used between the tunnel and the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransportType {
    /// Plain TCP stream
    #[default]
    Tcp,
    WebSocket,
    Grpc,
    H2,
    HttpUpgrade,
}

impl TransportType {
    /// Parse the `type=` query value of a descriptor
    pub fn from_query(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" | "raw" => Some(TransportType::Tcp),
            "ws" | "websocket" => Some(TransportType::WebSocket),
            "grpc" => Some(TransportType::Grpc),
            "h2" | "http" => Some(TransportType::H2),
            "httpupgrade" => Some(TransportType::HttpUpgrade),
            _ => None,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::WebSocket => write!(f, "ws"),
            TransportType::Grpc => write!(f, "grpc"),
            TransportType::H2 => write!(f, "http"),
            TransportType::HttpUpgrade => write!(f, "httpupgrade"),
        }
    }
}

/// Security layer negotiated on top of the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecurityMode {
    #[default]
    None,
    Tls,
    /// TLS camouflaged as a handshake with a third-party site
    Reality,
}

impl SecurityMode {
    /// Parse the `security=` query value of a descriptor
    pub fn from_query(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "none" => Some(SecurityMode::None),
            "tls" => Some(SecurityMode::Tls),
            "reality" => Some(SecurityMode::Reality),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::None => write!(f, "none"),
            SecurityMode::Tls => write!(f, "tls"),
            SecurityMode::Reality => write!(f, "reality"),
        }
    }
}

/// Mode-dependent connection parameters taken from the descriptor query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamParams {
    /// Server name indication; defaults to the descriptor host
    pub sni: String,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub path: Option<String>,
    pub fingerprint: Option<String>,
    pub flow: Option<String>,
    /// Host header for websocket / h2 transports
    pub host_header: Option<String>,
    pub service_name: Option<String>,
    pub alpn: Option<String>,
    pub spider_x: Option<String>,
}

/// The `(host, port)` pair that identifies a physical server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    /// IPv6 literals are reduced to their compressed lower-case form
    pub fn new(host: &str, port: u16) -> Self {
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            Self(format!("[{}]:{}", ip, port))
        } else if host.contains(':') {
            Self(format!("[{}]:{}", host, port))
        } else {
            Self(format!("{}:{}", host.to_ascii_lowercase(), port))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed proxy endpoint descriptor
///
/// `canonical` is the descriptor text with surrounding whitespace and the
/// `#label` fragment removed; it is what gets re-emitted in results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub credential_id: String,
    /// Hostname or IP literal, IPv6 without brackets
    pub host: String,
    pub port: u16,
    pub transport: TransportType,
    pub security: SecurityMode,
    pub params: StreamParams,
    pub canonical: String,
}

impl EndpointDescriptor {
    /// Deduplication key for this descriptor
    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::new(&self.host, self.port)
    }

    /// Host in a form usable inside `host:port` strings
    pub fn host_for_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host:port` socket address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host_for_addr(), self.port)
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Result of a single probe attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Unreachable,
    /// Probe succeeded after the given number of milliseconds
    Reachable(u64),
    TunnelFailure(String),
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable(_))
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self {
            ProbeOutcome::Reachable(ms) => Some(*ms),
            _ => None,
        }
    }
}

/// A surviving endpoint annotated with its country and latency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedResult {
    pub descriptor: EndpointDescriptor,
    pub latency_ms: Option<u64>,
    pub country_code: String,
}

impl AnnotatedResult {
    pub fn new(descriptor: EndpointDescriptor, latency_ms: Option<u64>, country_code: String) -> Self {
        Self {
            descriptor,
            latency_ms,
            country_code,
        }
    }

    /// Output line: canonical descriptor followed by the annotation label
    pub fn to_line(&self) -> String {
        match self.latency_ms {
            Some(ms) => format!("{}#{}-{}ms", self.descriptor.canonical, self.country_code, ms),
            None => format!("{}#{}", self.descriptor.canonical, self.country_code),
        }
    }
}

impl fmt::Display for AnnotatedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}
