//! Proxy data models

use crate::error::ProbeFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Longest hostname accepted in a candidate address
const MAX_HOSTNAME_LEN: usize = 253;

/// A proxy endpoint in `host:port` form, not yet known to work.
///
/// The string is kept as supplied; it is only checked when a probe
/// needs to connect through it, so malformed entries surface as
/// [`ProbeFailure::AddressMalformed`] instead of being dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateAddress(String);

impl CandidateAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the address into host and port, validating both
    pub fn endpoint(&self) -> Result<(String, u16), ProbeFailure> {
        let malformed = || ProbeFailure::AddressMalformed(self.0.clone());

        let (host, port) = self.0.rsplit_once(':').ok_or_else(malformed)?;
        let port: u16 = port.parse().map_err(|_| malformed())?;
        if port == 0 {
            return Err(malformed());
        }

        // Bracketed IPv6 literal, e.g. [::1]:8080
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.parse::<IpAddr>().is_ok() || is_valid_hostname(host) {
            Ok((host.to_string(), port))
        } else {
            Err(malformed())
        }
    }

    pub fn is_valid(&self) -> bool {
        self.endpoint().is_ok()
    }

    /// URL of the endpoint used as an HTTP forward proxy
    pub fn proxy_url(&self) -> Result<String, ProbeFailure> {
        let (host, port) = self.endpoint()?;
        if host.contains(':') {
            Ok(format!("http://[{}]:{}", host, port))
        } else {
            Ok(format!("http://{}:{}", host, port))
        }
    }
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    // A dotted-quad that failed IP parsing is a bad IP, not a hostname
    if host.split('.').all(|label| label.chars().all(|c| c.is_ascii_digit())) {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

impl fmt::Display for CandidateAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CandidateAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for CandidateAddress {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

/// Outcome of probing one candidate address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub address: CandidateAddress,
    pub is_working: bool,
    /// Elapsed time from dispatch to response headers, or to the failure
    pub latency: Duration,
    /// Present iff `is_working` is false
    pub failure: Option<ProbeFailure>,
    pub status_code: Option<u16>,
    pub response_size: Option<usize>,
    pub tested_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn working(
        address: CandidateAddress,
        latency: Duration,
        status_code: u16,
        response_size: usize,
    ) -> Self {
        Self {
            address,
            is_working: true,
            latency,
            failure: None,
            status_code: Some(status_code),
            response_size: Some(response_size),
            tested_at: Utc::now(),
        }
    }

    pub fn failed(address: CandidateAddress, latency: Duration, failure: ProbeFailure) -> Self {
        let status_code = match &failure {
            ProbeFailure::HttpStatus { status, .. } => Some(*status),
            _ => None,
        };

        Self {
            address,
            is_working: false,
            latency,
            failure: Some(failure),
            status_code,
            response_size: None,
            tested_at: Utc::now(),
        }
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            None => write!(
                f,
                "{} - {}ms - HTTP {} - {} bytes",
                self.address,
                self.latency_ms(),
                self.status_code.unwrap_or_default(),
                self.response_size.unwrap_or_default()
            ),
            Some(failure) => write!(f, "{} - {}", self.address, failure),
        }
    }
}

/// A proxy in the working set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingProxy {
    pub address: CandidateAddress,
    /// Latency of the last successful probe; unknown for pools loaded from storage
    pub latency: Option<Duration>,
}

/// Ranked, capacity-bounded set of addresses believed to work.
///
/// Addresses are unique and ordered fastest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSet {
    entries: Vec<WorkingProxy>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a working set from stored addresses, keeping the first occurrence of each
    pub fn from_addresses<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = CandidateAddress>,
    {
        let mut seen = HashSet::new();
        let entries = addresses
            .into_iter()
            .filter(|address| seen.insert(address.clone()))
            .map(|address| WorkingProxy {
                address,
                latency: None,
            })
            .collect();

        Self { entries }
    }

    /// Entries must already be unique and ranked
    pub(crate) fn from_ranked(entries: Vec<WorkingProxy>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkingProxy> {
        self.entries.iter()
    }

    pub fn addresses(&self) -> Vec<CandidateAddress> {
        self.entries.iter().map(|e| e.address.clone()).collect()
    }

    pub fn contains(&self, address: &CandidateAddress) -> bool {
        self.entries.iter().any(|e| &e.address == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_endpoint() {
        let address = CandidateAddress::new("127.0.0.1:8080");
        assert_eq!(address.endpoint().unwrap(), ("127.0.0.1".to_string(), 8080));
        assert_eq!(address.proxy_url().unwrap(), "http://127.0.0.1:8080");

        let address = CandidateAddress::new("proxy.example.com:3128");
        assert_eq!(
            address.endpoint().unwrap(),
            ("proxy.example.com".to_string(), 3128)
        );

        let address = CandidateAddress::new("[::1]:1080");
        assert_eq!(address.proxy_url().unwrap(), "http://[::1]:1080");
    }

    #[test]
    fn test_candidate_trims_whitespace() {
        let address = CandidateAddress::new("  10.0.0.1:80 \n");
        assert_eq!(address.as_str(), "10.0.0.1:80");
    }

    #[test]
    fn test_candidate_malformed() {
        for raw in [
            "bad-address",
            "10.0.0.1",
            "10.0.0.1:0",
            "10.0.0.1:70000",
            "10.0.0.1:abc",
            "999.1.1.1:8080",
            ":8080",
            "bad host:8080",
            "-leading.example.com:80",
        ] {
            let address = CandidateAddress::new(raw);
            assert!(!address.is_valid(), "{} should be malformed", raw);
            assert_eq!(
                address.endpoint().unwrap_err(),
                ProbeFailure::AddressMalformed(raw.to_string())
            );
        }
    }

    #[test]
    fn test_probe_result_constructors() {
        let address = CandidateAddress::new("127.0.0.1:8080");

        let result =
            ProbeResult::working(address.clone(), Duration::from_millis(120), 200, 42);
        assert!(result.is_working);
        assert!(result.failure.is_none());
        assert_eq!(result.latency_ms(), 120);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.response_size, Some(42));

        let result = ProbeResult::failed(
            address.clone(),
            Duration::from_millis(5),
            ProbeFailure::http_status(403, b"forbidden"),
        );
        assert!(!result.is_working);
        assert_eq!(result.status_code, Some(403));
        assert_eq!(result.to_string(), "127.0.0.1:8080 - HTTP 403: forbidden");

        let result = ProbeResult::failed(address, Duration::ZERO, ProbeFailure::Timeout);
        assert_eq!(result.status_code, None);
        assert_eq!(result.failure, Some(ProbeFailure::Timeout));
    }

    #[test]
    fn test_working_set_from_addresses_dedups() {
        let set = WorkingSet::from_addresses(vec![
            CandidateAddress::new("10.0.0.2:80"),
            CandidateAddress::new("10.0.0.1:80"),
            CandidateAddress::new("10.0.0.2:80"),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.addresses(),
            vec![
                CandidateAddress::new("10.0.0.2:80"),
                CandidateAddress::new("10.0.0.1:80"),
            ]
        );
        assert!(set.contains(&CandidateAddress::new("10.0.0.1:80")));
        assert!(set.iter().all(|e| e.latency.is_none()));
    }

    #[test]
    fn test_empty_working_set() {
        let set = WorkingSet::new();
        assert!(set.is_empty());
        assert!(set.addresses().is_empty());
    }
}
