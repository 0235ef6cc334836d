//! IP to location resolution.
//!
//! Resolution is pluggable through [`GeoResolver`]. The engine ships only a
//! static CIDR table; events whose record already names a country keep it.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    #[error("invalid CIDR `{0}`")]
    InvalidCidr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoSource {
    /// Country came from the log record itself.
    Record,
    /// Country was looked up from the source IP.
    Resolver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO-style country code, upper-cased.
    pub country: String,
    pub city: Option<String>,
    pub source: GeoSource,
}

/// Resolve a source IP to a location. Implementations must be deterministic.
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<GeoLocation>;
}

/// Parse `addr/prefix`. A bare address is a host route.
pub fn parse_cidr(cidr: &str) -> Result<IpNet, GeoError> {
    let cidr = cidr.trim();
    if let Ok(net) = cidr.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    cidr.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| GeoError::InvalidCidr(cidr.to_string()))
}

#[derive(Debug, Clone)]
struct Range {
    net: IpNet,
    country: String,
}

/// Longest-prefix-match table of CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoResolver {
    ranges: Vec<Range>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, cidr: &str, country: &str) -> Result<Self, GeoError> {
        let net = parse_cidr(cidr)?;
        self.ranges.push(Range {
            net,
            country: country.trim().to_ascii_uppercase(),
        });
        // Longest prefix first; ties keep insertion order.
        self.ranges
            .sort_by(|a, b| b.net.prefix_len().cmp(&a.net.prefix_len()));
        Ok(self)
    }

    /// Build from the `normalizer.geo_ranges` table.
    pub fn from_table(table: &BTreeMap<String, String>) -> Result<Self, GeoError> {
        table
            .iter()
            .try_fold(Self::new(), |r, (cidr, country)| r.with_range(cidr, country))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl GeoResolver for StaticGeoResolver {
    fn resolve(&self, ip: IpAddr) -> Option<GeoLocation> {
        self.ranges
            .iter()
            .find(|r| r.net.contains(&ip))
            .map(|r| GeoLocation {
                country: r.country.clone(),
                city: None,
                source: GeoSource::Resolver,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let r = StaticGeoResolver::new()
            .with_range("10.0.0.0/8", "us")
            .unwrap()
            .with_range("10.1.0.0/16", "DE")
            .unwrap();
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        assert_eq!(r.resolve(ip("10.1.2.3")).unwrap().country, "DE");
        assert_eq!(r.resolve(ip("10.2.2.3")).unwrap().country, "US");
        assert_eq!(r.resolve(ip("192.168.0.1")), None);
        assert_eq!(r.resolve(ip("::1")), None);
    }

    #[test]
    fn rejects_bad_cidr() {
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("nonsense/8").is_err());
        assert_eq!(parse_cidr("2001:db8::1").unwrap().prefix_len(), 128);
        assert_eq!(parse_cidr(" 192.0.2.77/24 ").unwrap().to_string(), "192.0.2.0/24");
    }

    #[test]
    fn zero_prefix_matches_family() {
        let r = StaticGeoResolver::new().with_range("0.0.0.0/0", "ZZ").unwrap();
        assert!(r.resolve("8.8.8.8".parse().unwrap()).is_some());
        assert!(r.resolve("2001:db8::1".parse().unwrap()).is_none());
    }
}
