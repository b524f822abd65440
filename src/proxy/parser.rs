//! Descriptor parser for `vless://` style endpoint strings

use crate::proxy::models::{
    EndpointDescriptor, SecurityMode, StreamParams, TransportType, DEFAULT_PORT,
};
use crate::Result;
use anyhow::Context;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::fs;
use std::net::Ipv6Addr;
use std::path::Path;
use thiserror::Error;

/// Schemes the tunnel prober knows how to drive
const SUPPORTED_SCHEMES: &[&str] = &["vless"];

/// `scheme://credential@host[:port][/path][?query]`, fragment already removed
static DESCRIPTOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([A-Za-z][A-Za-z0-9+.\-]*)://([^@/?#]*)@(\[[^\]/?#]*\]|[^:/?#\[\]@]*)(?::([^/?#]*))?(/[^?#]*)?(?:\?([^#]*))?$",
    )
    .expect("Invalid descriptor regex")
});

/// Reasons a descriptor line is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing scheme prefix")]
    MissingScheme,
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("malformed descriptor")]
    Malformed,
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("unsupported security mode: {0}")]
    UnsupportedSecurity(String),
    #[error("unsupported transport type: {0}")]
    UnsupportedTransport(String),
}

/// Descriptors parsed from a batch of lines
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    pub descriptors: Vec<EndpointDescriptor>,
    /// Candidate lines that failed to parse
    pub rejected: usize,
}

/// Descriptor parser for parsing endpoints from strings and files
pub struct DescriptorParser;

impl DescriptorParser {
    /// Parse a single descriptor line
    ///
    /// Whitespace around the line is ignored and the `#label` fragment is
    /// dropped before anything else is looked at.
    pub fn parse_line(line: &str) -> std::result::Result<EndpointDescriptor, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let canonical = match line.split_once('#') {
            Some((base, _label)) => base.trim_end(),
            None => line,
        };

        let Some((scheme, _)) = canonical.split_once("://") else {
            return Err(ParseError::MissingScheme);
        };
        if !SUPPORTED_SCHEMES
            .iter()
            .any(|s| s.eq_ignore_ascii_case(scheme))
        {
            return Err(ParseError::UnsupportedScheme(scheme.to_string()));
        }

        let caps = DESCRIPTOR_REGEX
            .captures(canonical)
            .ok_or(ParseError::Malformed)?;

        let credential_id = caps[2].to_string();
        if credential_id.is_empty() {
            return Err(ParseError::MissingCredential);
        }

        let host = Self::parse_host(&caps[3])?;
        let port = match caps.get(4) {
            Some(m) => Self::parse_port(m.as_str())?,
            None => DEFAULT_PORT,
        };

        let mut security = SecurityMode::default();
        let mut transport = TransportType::default();
        let mut params = StreamParams {
            sni: host.clone(),
            ..Default::default()
        };

        let query = caps.get(6).map_or("", |m| m.as_str());
        for (key, value) in Self::query_pairs(query) {
            if value.is_empty() {
                continue;
            }
            match key {
                "security" => {
                    security = SecurityMode::from_query(&value)
                        .ok_or_else(|| ParseError::UnsupportedSecurity(value.clone()))?;
                }
                "type" => {
                    transport = TransportType::from_query(&value)
                        .ok_or_else(|| ParseError::UnsupportedTransport(value.clone()))?;
                }
                "sni" => params.sni = value,
                "pbk" => params.public_key = Some(value),
                "sid" => params.short_id = Some(value),
                "path" => params.path = Some(value),
                "fp" => params.fingerprint = Some(value),
                "flow" => params.flow = Some(value),
                "host" => params.host_header = Some(value),
                "serviceName" => params.service_name = Some(value),
                "alpn" => params.alpn = Some(value),
                "spx" => params.spider_x = Some(value),
                _ => {}
            }
        }

        Ok(EndpointDescriptor {
            credential_id,
            host,
            port,
            transport,
            security,
            params,
            canonical: canonical.to_string(),
        })
    }

    fn parse_host(raw: &str) -> std::result::Result<String, ParseError> {
        if let Some(inner) = raw.strip_prefix('[') {
            let inner = inner.strip_suffix(']').unwrap_or(inner);
            return inner
                .parse::<Ipv6Addr>()
                .map(|_| inner.to_string())
                .map_err(|_| ParseError::InvalidHost(raw.to_string()));
        }
        if raw.is_empty() {
            return Err(ParseError::InvalidHost(raw.to_string()));
        }
        Ok(raw.to_string())
    }

    fn parse_port(raw: &str) -> std::result::Result<u16, ParseError> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidPort(raw.to_string()));
        }
        match raw.parse::<u16>() {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(ParseError::InvalidPort(raw.to_string())),
        }
    }

    fn query_pairs(query: &str) -> impl Iterator<Item = (&str, String)> {
        query.split('&').filter(|p| !p.is_empty()).map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key, percent_decode_str(value).decode_utf8_lossy().into_owned())
        })
    }

    /// Whether a line should be handed to the parser at all
    ///
    /// Blank lines and `#` comments are skipped silently.
    pub fn is_candidate(line: &str) -> bool {
        let line = line.trim();
        !line.is_empty() && !line.starts_with('#')
    }

    /// Parse descriptors from a string (multiple lines)
    pub fn parse_string(content: &str) -> ParsedBatch {
        let mut batch = ParsedBatch::default();
        for line in content.lines().filter(|l| Self::is_candidate(l)) {
            match Self::parse_line(line) {
                Ok(descriptor) => batch.descriptors.push(descriptor),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping descriptor line");
                    batch.rejected += 1;
                }
            }
        }
        batch
    }

    /// Parse descriptors from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<ParsedBatch> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        Ok(Self::parse_string(&content))
    }

    /// Save canonical descriptors to a file, one per line
    pub fn save_to_file<P: AsRef<Path>>(descriptors: &[EndpointDescriptor], path: P) -> Result<()> {
        let mut content: String = descriptors
            .iter()
            .map(|d| d.canonical.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let d = DescriptorParser::parse_line("vless://abc@example.com").unwrap();
        assert_eq!(d.credential_id, "abc");
        assert_eq!(d.host, "example.com");
        assert_eq!(d.port, 443);
        assert_eq!(d.transport, TransportType::Tcp);
        assert_eq!(d.security, SecurityMode::None);
        assert_eq!(d.params.sni, "example.com");
    }

    #[test]
    fn test_parse_full_reality() {
        let line = "  vless://uuid-1@1.2.3.4:8443?security=reality&type=tcp&sni=www.apple.com&pbk=PUBKEY&sid=ab12&fp=chrome&flow=xtls-rprx-vision#My%20Server  ";
        let d = DescriptorParser::parse_line(line).unwrap();
        assert_eq!(d.host, "1.2.3.4");
        assert_eq!(d.port, 8443);
        assert_eq!(d.security, SecurityMode::Reality);
        assert_eq!(d.params.sni, "www.apple.com");
        assert_eq!(d.params.public_key.as_deref(), Some("PUBKEY"));
        assert_eq!(d.params.short_id.as_deref(), Some("ab12"));
        assert_eq!(d.params.fingerprint.as_deref(), Some("chrome"));
        assert_eq!(d.params.flow.as_deref(), Some("xtls-rprx-vision"));
        assert!(!d.canonical.contains('#'));
        assert!(!d.canonical.contains("My"));
    }

    #[test]
    fn test_label_excluded_from_identity_and_canonical() {
        let a = DescriptorParser::parse_line("vless://id@h.example:443?security=tls#one").unwrap();
        let b = DescriptorParser::parse_line("vless://id@h.example:443?security=tls#two").unwrap();
        assert_eq!(a.canonical, "vless://id@h.example:443?security=tls");
        assert_eq!(a.canonical, b.canonical);
        assert_eq!(a.identity(), b.identity());
        assert!(!a.identity().as_str().contains("one"));
    }

    #[test]
    fn test_parse_ipv6() {
        let d = DescriptorParser::parse_line("vless://id@[2001:db8::1]:2053?type=ws&path=%2Fws").unwrap();
        assert_eq!(d.host, "2001:db8::1");
        assert_eq!(d.port, 2053);
        assert_eq!(d.transport, TransportType::WebSocket);
        assert_eq!(d.params.path.as_deref(), Some("/ws"));
        assert_eq!(d.identity().as_str(), "[2001:db8::1]:2053");

        let d = DescriptorParser::parse_line("vless://id@[::1]").unwrap();
        assert_eq!(d.port, 443);
    }

    #[test]
    fn test_ipv6_spellings_share_identity() {
        let batch = DescriptorParser::parse_string(
            "vless://a@[2001:DB8::1]:443\nvless://b@[2001:db8::1]:443\nvless://c@[2001:db8:0:0::1]:443\n",
        );
        assert_eq!(batch.descriptors.len(), 3);

        let seen = crate::proxy::dedup::IdentitySet::new();
        let accepted = batch
            .descriptors
            .iter()
            .filter(|d| seen.try_accept(&d.identity()))
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_parse_trailing_slash() {
        let d = DescriptorParser::parse_line("vless://id@host.example:80/?type=grpc&serviceName=svc").unwrap();
        assert_eq!(d.port, 80);
        assert_eq!(d.transport, TransportType::Grpc);
        assert_eq!(d.params.service_name.as_deref(), Some("svc"));
    }

    #[test]
    fn test_empty_query_values_use_defaults() {
        let d = DescriptorParser::parse_line("vless://id@h:443?security=&sni=&type=").unwrap();
        assert_eq!(d.security, SecurityMode::None);
        assert_eq!(d.transport, TransportType::Tcp);
        assert_eq!(d.params.sni, "h");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(DescriptorParser::parse_line("   "), Err(ParseError::Empty));
        assert_eq!(
            DescriptorParser::parse_line("id@1.2.3.4:443"),
            Err(ParseError::MissingScheme)
        );
        assert_eq!(
            DescriptorParser::parse_line("vmess://id@1.2.3.4:443"),
            Err(ParseError::UnsupportedScheme("vmess".to_string()))
        );
        assert_eq!(
            DescriptorParser::parse_line("vless://1.2.3.4:443"),
            Err(ParseError::Malformed)
        );
        assert_eq!(
            DescriptorParser::parse_line("vless://@1.2.3.4:443"),
            Err(ParseError::MissingCredential)
        );
        assert!(matches!(
            DescriptorParser::parse_line("vless://id@1.2.3.4:99999"),
            Err(ParseError::InvalidPort(_))
        ));
        assert!(matches!(
            DescriptorParser::parse_line("vless://id@1.2.3.4:0"),
            Err(ParseError::InvalidPort(_))
        ));
        assert!(matches!(
            DescriptorParser::parse_line("vless://id@1.2.3.4:"),
            Err(ParseError::InvalidPort(_))
        ));
        for port in ["+443", "-443", " 443", "44_3"] {
            assert_eq!(
                DescriptorParser::parse_line(&format!("vless://id@h.example:{}", port)),
                Err(ParseError::InvalidPort(port.to_string()))
            );
        }
        assert!(matches!(
            DescriptorParser::parse_line("vless://id@[not-v6]:443"),
            Err(ParseError::InvalidHost(_))
        ));
        assert!(matches!(
            DescriptorParser::parse_line("vless://id@h:443?security=xtls"),
            Err(ParseError::UnsupportedSecurity(_))
        ));
        assert!(matches!(
            DescriptorParser::parse_line("vless://id@h:443?type=kcp"),
            Err(ParseError::UnsupportedTransport(_))
        ));
    }

    #[test]
    fn test_parse_string_counts_rejects() {
        let content = r#"
# subscription header
vless://a@1.1.1.1:443
garbage line
vless://b@2.2.2.2?security=tls#label

vmess://c@3.3.3.3
"#;
        let batch = DescriptorParser::parse_string(content);
        assert_eq!(batch.descriptors.len(), 2);
        assert_eq!(batch.rejected, 2);
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let batch = DescriptorParser::parse_string("vless://a@1.1.1.1:443#x\nvless://b@2.2.2.2#y");
        DescriptorParser::save_to_file(&batch.descriptors, &path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "vless://a@1.1.1.1:443\nvless://b@2.2.2.2\n");
    }
}
