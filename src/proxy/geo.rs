//! Geolocation module for annotating endpoints with a country code using MMDB

use crate::proxy::checker::CountryLookup;
use crate::proxy::models::UNKNOWN_COUNTRY;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// GeoLocator for looking up IP addresses in MMDB databases
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    /// Create a new GeoLocator from an MMDB file path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = Reader::open_readfile(path)
            .with_context(|| format!("failed to open geolocation database {}", path.display()))?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the ISO country code for an IpAddr
    ///
    /// Works with both country and city databases, which share the
    /// `country` record layout.
    pub fn country_code(&self, ip: IpAddr) -> Result<Option<String>> {
        let lookup_result = self.reader.lookup(ip)?;
        let country: Option<geoip2::Country> = lookup_result.decode()?;
        Ok(country.and_then(|c| c.country.iso_code.map(String::from)))
    }
}

impl Clone for GeoLocator {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

/// Upper bound on resolving a hostname before giving up on it
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Best-effort host to country resolution
///
/// Without a database every lookup yields [`UNKNOWN_COUNTRY`].
#[derive(Clone)]
pub struct GeoAnnotator {
    locator: Option<GeoLocator>,
    resolve_timeout: Duration,
}

impl Default for GeoAnnotator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl GeoAnnotator {
    pub fn new(locator: Option<GeoLocator>) -> Self {
        Self {
            locator,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Open the database at `path`, degrading to no database on failure
    pub fn open_or_disabled(path: Option<&Path>) -> Self {
        let locator = path.and_then(|p| match GeoLocator::from_path(p) {
            Ok(locator) => Some(locator),
            Err(e) => {
                warn!(error = %e, "geolocation disabled");
                None
            }
        });
        Self::new(locator)
    }

    pub fn is_enabled(&self) -> bool {
        self.locator.is_some()
    }

    /// Resolve `host` to its first address within the resolve timeout
    pub async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        match tokio::time::timeout(self.resolve_timeout, tokio::net::lookup_host((host, 0))).await {
            Ok(Ok(mut addrs)) => addrs.next().map(|a| a.ip()),
            Ok(Err(e)) => {
                debug!(host, error = %e, "name resolution failed");
                None
            }
            Err(_) => {
                debug!(host, timeout = ?self.resolve_timeout, "name resolution timed out");
                None
            }
        }
    }
}

#[async_trait]
impl CountryLookup for GeoAnnotator {
    async fn lookup_country(&self, host: &str) -> String {
        let Some(locator) = &self.locator else {
            return UNKNOWN_COUNTRY.to_string();
        };
        let Some(ip) = self.resolve(host).await else {
            return UNKNOWN_COUNTRY.to_string();
        };

        match locator.country_code(ip) {
            Ok(Some(code)) => code,
            Ok(None) => UNKNOWN_COUNTRY.to_string(),
            Err(e) => {
                debug!(%ip, error = %e, "geolocation lookup failed");
                UNKNOWN_COUNTRY.to_string()
            }
        }
    }
}
