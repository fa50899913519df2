//! Proxy list parsing and proxy list files

use crate::proxy::models::CandidateAddress;
use crate::Result;
use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

static URL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i:https?|socks[45])://([^/\s]+?)/?$").expect("Invalid proxy URL regex")
});

/// Proxy parser for parsing proxy addresses from strings and files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - HOST:PORT
    /// - scheme://IP:PORT
    ///
    /// Blank lines, `#` comments and entries that are not a valid
    /// `host:port` yield `None`.
    pub fn parse_line(line: &str) -> Option<CandidateAddress> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let raw = match URL_FORMAT.captures(line) {
            Some(caps) => caps.get(1)?.as_str(),
            None => line,
        };

        let address = CandidateAddress::new(raw);
        address.is_valid().then_some(address)
    }

    /// Parse proxies from a string (multiple lines)
    pub fn parse_string(content: &str) -> Vec<CandidateAddress> {
        content.lines().filter_map(Self::parse_line).collect()
    }

    /// Parse proxies from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<CandidateAddress>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("error opening proxy file {}", path.display()))?;
        Ok(Self::parse_string(&content))
    }

    /// Save proxies to a file, one per line
    pub fn save_to_file<P: AsRef<Path>>(proxies: &[CandidateAddress], path: P) -> Result<()> {
        let path = path.as_ref();
        let content: String = proxies
            .iter()
            .map(|p| format!("{}\n", p))
            .collect();

        fs::write(path, content)
            .with_context(|| format!("error writing proxy file {}", path.display()))?;
        Ok(())
    }
}
