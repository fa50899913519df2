//! Proxy crawler module for fetching candidate proxies from public lists
//!
//! This module provides functionality for:
//! - Fetching proxy lists from many sources concurrently
//! - Parsing plain-text and JSON list formats
//! - Merging, deduplicating and validating the extracted addresses

use crate::proxy::cycle::CandidateSource;
use crate::proxy::models::CandidateAddress;
use crate::Result;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Default number of sources fetched at once
const DEFAULT_MAX_WORKERS: usize = 10;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Regex pattern to match IP:PORT patterns in text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})").expect("Invalid IP:PORT regex")
});

/// How a source publishes its list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Free text containing `ip:port` pairs
    Text,
    /// JSON API returning `{ip, port}` items
    Json,
}

/// Proxy source representing a URL that provides a proxy list
#[derive(Debug, Clone)]
pub struct ProxySource {
    pub url: String,
    pub format: SourceFormat,
}

impl ProxySource {
    pub fn text(url: &str) -> Self {
        Self {
            url: url.to_string(),
            format: SourceFormat::Text,
        }
    }

    pub fn json(url: &str) -> Self {
        Self {
            url: url.to_string(),
            format: SourceFormat::Json,
        }
    }
}

/// Result of crawling a single source
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// The source that was crawled
    pub source: String,
    /// Proxies extracted from the source
    pub proxies: Vec<CandidateAddress>,
    /// Error message if crawling failed
    pub error: Option<String>,
}

impl CrawlResult {
    /// Create a successful crawl result
    pub fn success(source: String, proxies: Vec<CandidateAddress>) -> Self {
        Self {
            source,
            proxies,
            error: None,
        }
    }

    /// Create a failed crawl result
    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            proxies: Vec::new(),
            error: Some(error),
        }
    }

    /// Check if the crawl was successful
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Configuration for proxy crawler
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Timeout for HTTP requests
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
    /// Number of sources fetched concurrently
    pub max_workers: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl CrawlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProxyResponse {
    #[serde(default)]
    data: Vec<ProxyItem>,
    #[serde(default)]
    proxies: Vec<ProxyItem>,
}

#[derive(Debug, Deserialize)]
struct ProxyItem {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    port: Option<PortValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

impl ProxyItem {
    fn address(&self) -> Option<CandidateAddress> {
        let port = match self.port.as_ref()? {
            PortValue::Number(n) => n.to_string(),
            PortValue::Text(s) => s.trim().to_string(),
        };
        if self.ip.is_empty() || port.is_empty() {
            return None;
        }
        Some(CandidateAddress::new(format!("{}:{}", self.ip.trim(), port)))
    }
}

/// Proxy crawler for fetching proxies from public lists
pub struct ProxyCrawler {
    config: CrawlerConfig,
    client: Client,
    sources: Vec<ProxySource>,
}

impl ProxyCrawler {
    /// Create a new proxy crawler with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(CrawlerConfig::default())
    }

    /// Create a new proxy crawler with custom configuration
    pub fn with_config(config: CrawlerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            config,
            client,
            sources: Self::get_common_sources(),
        })
    }

    /// Replace the built-in source table
    pub fn with_sources(mut self, sources: Vec<ProxySource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn sources(&self) -> &[ProxySource] {
        &self.sources
    }

    /// Fetch and parse proxies from a single source
    pub async fn crawl_source(&self, source: &ProxySource) -> Result<Vec<CandidateAddress>> {
        let response = self.client.get(&source.url).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            bail!("HTTP {}", status.as_u16());
        }

        let content = response.text().await?;
        Ok(Self::parse_proxies(&content, source.format))
    }

    /// Fetch every source concurrently, returning results for each
    pub async fn crawl_sources_with_results(&self) -> Vec<CrawlResult> {
        let crawls: Vec<_> = self
            .sources
            .iter()
            .map(|source| async move {
                match self.crawl_source(source).await {
                    Ok(proxies) => {
                        debug!("✓ {}: {} proxies", source.url, proxies.len());
                        CrawlResult::success(source.url.clone(), proxies)
                    }
                    Err(e) => {
                        debug!("✗ {}: {}", source.url, e);
                        CrawlResult::failure(source.url.clone(), e.to_string())
                    }
                }
            })
            .collect();
        stream::iter(crawls)
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await
    }

    /// Crawl all sources and return the merged, validated, sorted addresses.
    ///
    /// Individual source failures are tolerated; the crawl only fails when
    /// no source could be fetched at all.
    pub async fn crawl_proxies(&self) -> Result<Vec<CandidateAddress>> {
        let started = Instant::now();
        info!("Crawling proxies from {} sources", self.sources.len());

        let results = self.crawl_sources_with_results().await;
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        if !results.is_empty() && succeeded == 0 {
            return Err(anyhow!("all {} proxy sources failed", results.len()));
        }

        let mut found = 0;
        let mut merged = BTreeSet::new();
        for result in results {
            found += result.proxies.len();
            merged.extend(result.proxies);
        }

        let valid: Vec<CandidateAddress> = merged.into_iter().filter(is_ip_endpoint).collect();

        info!(
            "Crawl finished in {:.2}s: {}/{} sources ok, {} found, {} unique valid",
            started.elapsed().as_secs_f64(),
            succeeded,
            self.sources.len(),
            found,
            valid.len()
        );
        if valid.is_empty() {
            warn!("Crawl produced no valid proxies");
        }

        Ok(valid)
    }

    /// Parse proxies from a response body
    pub fn parse_proxies(body: &str, format: SourceFormat) -> Vec<CandidateAddress> {
        match format {
            SourceFormat::Text => Self::extract_proxies_with_regex(body),
            SourceFormat::Json => {
                let proxies = Self::parse_json_proxies(body);
                // Several "JSON" APIs answer in plain text
                if proxies.is_empty() {
                    Self::extract_proxies_with_regex(body)
                } else {
                    proxies
                }
            }
        }
    }

    fn parse_json_proxies(body: &str) -> Vec<CandidateAddress> {
        let items = match serde_json::from_str::<ProxyResponse>(body) {
            Ok(response) if !response.data.is_empty() => response.data,
            Ok(response) => response.proxies,
            Err(_) => serde_json::from_str::<Vec<ProxyItem>>(body).unwrap_or_default(),
        };

        items.iter().filter_map(ProxyItem::address).collect()
    }

    /// Extract proxies using regex pattern matching
    fn extract_proxies_with_regex(content: &str) -> Vec<CandidateAddress> {
        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| {
                let ip = cap.get(1)?.as_str();
                let port = cap.get(2)?.as_str();
                Some(CandidateAddress::new(format!("{}:{}", ip, port)))
            })
            .collect()
    }

    /// Get the built-in list of public proxy sources
    pub fn get_common_sources() -> Vec<ProxySource> {
        let text = [
            "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
            "https://github.com/zloi-user/hideip.me/raw/refs/heads/master/http.txt",
            "https://github.com/zloi-user/hideip.me/raw/refs/heads/master/https.txt",
            "https://github.com/zloi-user/hideip.me/raw/refs/heads/master/connect.txt",
            "https://raw.githubusercontent.com/ErcinDedeoglu/proxies/main/proxies/http.txt",
            "https://raw.githubusercontent.com/ErcinDedeoglu/proxies/main/proxies/https.txt",
            "https://raw.githubusercontent.com/vakhov/fresh-proxy-list/master/http.txt",
            "https://raw.githubusercontent.com/vakhov/fresh-proxy-list/master/https.txt",
            "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/main/http.txt",
            "https://raw.githubusercontent.com/jetkai/proxy-list/main/online-proxies/txt/proxies-http.txt",
            "https://raw.githubusercontent.com/jetkai/proxy-list/main/online-proxies/txt/proxies-https.txt",
            "https://raw.githubusercontent.com/ShiftyTR/Proxy-List/master/http.txt",
            "https://raw.githubusercontent.com/ShiftyTR/Proxy-List/master/https.txt",
            "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/http.txt",
            "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/https.txt",
            "https://raw.githubusercontent.com/roosterkid/openproxylist/main/HTTPS_RAW.txt",
            "https://raw.githubusercontent.com/roosterkid/openproxylist/main/HTTP_RAW.txt",
            "https://raw.githubusercontent.com/hookzof/socks5_list/master/proxy.txt",
            "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt",
            "https://raw.githubusercontent.com/sunny9577/proxy-scraper/master/proxies.txt",
            "https://raw.githubusercontent.com/zevtyardt/proxy-list/main/http.txt",
            "https://raw.githubusercontent.com/zevtyardt/proxy-list/main/https.txt",
            "https://raw.githubusercontent.com/almroot/proxylist/master/list.txt",
            "https://raw.githubusercontent.com/rdavydov/proxy-list/main/proxies_anonymous/http.txt",
            "https://raw.githubusercontent.com/rdavydov/proxy-list/main/proxies_anonymous/https.txt",
            "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks4.txt",
            "https://github.com/zloi-user/hideip.me/raw/refs/heads/master/socks4.txt",
            "https://raw.githubusercontent.com/ErcinDedeoglu/proxies/main/proxies/socks4.txt",
            "https://raw.githubusercontent.com/vakhov/fresh-proxy-list/master/socks4.txt",
            "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/socks4.txt",
            "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks5.txt",
            "https://github.com/zloi-user/hideip.me/raw/refs/heads/master/socks5.txt",
            "https://raw.githubusercontent.com/ErcinDedeoglu/proxies/main/proxies/socks5.txt",
            "https://raw.githubusercontent.com/vakhov/fresh-proxy-list/master/socks5.txt",
            "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/socks5.txt",
        ];
        let json = [
            "https://proxylist.geonode.com/api/proxy-list?limit=500&page=1&sort_by=lastChecked&sort_type=desc&filterUpTime=90&protocols=http%2Chttps%2Csocks4%2Csocks5",
            "https://api.proxyscrape.com/v2/?request=get&protocol=http&timeout=10000&country=all&ssl=all&anonymity=all",
            "https://api.proxyscrape.com/v2/?request=get&protocol=socks4&timeout=10000&country=all&ssl=all&anonymity=all",
            "https://api.proxyscrape.com/v2/?request=get&protocol=socks5&timeout=10000&country=all&ssl=all&anonymity=all",
        ];

        text.iter()
            .map(|url| ProxySource::text(url))
            .chain(json.iter().map(|url| ProxySource::json(url)))
            .collect()
    }
}

#[async_trait]
impl CandidateSource for ProxyCrawler {
    async fn fetch_candidates(&self) -> Result<Vec<CandidateAddress>> {
        self.crawl_proxies().await
    }
}

/// Crawled entries must be an IP literal with a port in 1..=65535
fn is_ip_endpoint(address: &CandidateAddress) -> bool {
    address
        .endpoint()
        .map(|(host, _)| host.parse::<IpAddr>().is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::{spawn_fake_proxy, unused_local_address, FakeProxy};

    fn names(proxies: &[CandidateAddress]) -> Vec<&str> {
        proxies.iter().map(|p| p.as_str()).collect()
    }

    #[test]
    fn test_crawler_config_builder() {
        let config = CrawlerConfig::new()
            .with_timeout(Duration::from_secs(60))
            .with_user_agent("Custom Agent".to_string())
            .with_max_workers(3);

        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.user_agent, "Custom Agent");
        assert_eq!(config.max_workers, 3);
    }

    #[test]
    fn test_crawl_result_success_and_failure() {
        let result = CrawlResult::success(
            "test-source".to_string(),
            vec![CandidateAddress::new("192.168.1.1:8080")],
        );
        assert!(result.is_success());
        assert_eq!(result.proxies.len(), 1);

        let result =
            CrawlResult::failure("test-source".to_string(), "Connection failed".to_string());
        assert!(!result.is_success());
        assert!(result.proxies.is_empty());
        assert_eq!(result.error, Some("Connection failed".to_string()));
    }

    #[test]
    fn test_parse_text_proxies() {
        let content = r#"
192.168.1.1:8080
# comment
<td>Some text with 10.0.0.1:3128 embedded</td>
"#;
        let proxies = ProxyCrawler::parse_proxies(content, SourceFormat::Text);
        assert_eq!(names(&proxies), vec!["192.168.1.1:8080", "10.0.0.1:3128"]);
    }

    #[test]
    fn test_parse_json_data_and_proxies_keys() {
        let body = r#"{"data":[{"ip":"1.1.1.1","port":"80"},{"ip":"2.2.2.2","port":8080}]}"#;
        let proxies = ProxyCrawler::parse_proxies(body, SourceFormat::Json);
        assert_eq!(names(&proxies), vec!["1.1.1.1:80", "2.2.2.2:8080"]);

        let body = r#"{"proxies":[{"ip":"3.3.3.3","port":"3128"}]}"#;
        let proxies = ProxyCrawler::parse_proxies(body, SourceFormat::Json);
        assert_eq!(names(&proxies), vec!["3.3.3.3:3128"]);
    }

    #[test]
    fn test_parse_json_array_and_incomplete_items() {
        let body = r#"[{"ip":"4.4.4.4","port":"1080"},{"ip":"","port":"80"},{"ip":"5.5.5.5"}]"#;
        let proxies = ProxyCrawler::parse_proxies(body, SourceFormat::Json);
        assert_eq!(names(&proxies), vec!["4.4.4.4:1080"]);
    }

    #[test]
    fn test_parse_json_falls_back_to_text() {
        let body = "6.6.6.6:8080\r\n7.7.7.7:3128\r\n";
        let proxies = ProxyCrawler::parse_proxies(body, SourceFormat::Json);
        assert_eq!(names(&proxies), vec!["6.6.6.6:8080", "7.7.7.7:3128"]);
    }

    #[test]
    fn test_is_ip_endpoint() {
        assert!(is_ip_endpoint(&CandidateAddress::new("1.2.3.4:80")));
        assert!(!is_ip_endpoint(&CandidateAddress::new("999.999.999.999:80")));
        assert!(!is_ip_endpoint(&CandidateAddress::new("1.2.3.4:0")));
        assert!(!is_ip_endpoint(&CandidateAddress::new("1.2.3.4:99999")));
        assert!(!is_ip_endpoint(&CandidateAddress::new("example.com:80")));
    }

    #[test]
    fn test_get_common_sources() {
        let sources = ProxyCrawler::get_common_sources();
        assert!(!sources.is_empty());
        assert!(sources.iter().all(|s| s.url.starts_with("https://")));
        assert!(sources.iter().any(|s| s.format == SourceFormat::Json));
    }

    #[tokio::test]
    async fn test_crawl_merges_dedups_and_tolerates_failures() {
        let first = spawn_fake_proxy(FakeProxy::respond(
            200,
            "10.0.0.2:8080\n10.0.0.1:8080\n300.1.1.1:80\n",
        ))
        .await;
        let second = spawn_fake_proxy(FakeProxy::respond(
            200,
            r#"{"data":[{"ip":"10.0.0.1","port":"8080"},{"ip":"10.0.0.3","port":3128}]}"#,
        ))
        .await;
        let broken = spawn_fake_proxy(FakeProxy::respond(500, "oops")).await;
        let dead = unused_local_address().await;

        let crawler = ProxyCrawler::with_config(CrawlerConfig::new().with_max_workers(2))
            .unwrap()
            .with_sources(vec![
                ProxySource::text(&format!("http://{}/http.txt", first.address)),
                ProxySource::json(&format!("http://{}/api", second.address)),
                ProxySource::text(&format!("http://{}/list", broken.address)),
                ProxySource::text(&format!("http://{}/list", dead)),
            ]);

        let proxies = crawler.fetch_candidates().await.unwrap();
        assert_eq!(
            names(&proxies),
            vec!["10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.3:3128"]
        );
    }

    #[tokio::test]
    async fn test_crawl_fails_when_every_source_fails() {
        let dead = unused_local_address().await;
        let crawler = ProxyCrawler::new()
            .unwrap()
            .with_sources(vec![ProxySource::text(&format!("http://{}/list", dead))]);

        let err = crawler.crawl_proxies().await.unwrap_err();
        assert!(err.to_string().contains("all 1 proxy sources failed"));
    }
}
