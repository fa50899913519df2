//! Proxy checker: a single validation probe through one candidate proxy

use crate::error::ProbeFailure;
use crate::proxy::models::{CandidateAddress, ProbeResult};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Proxy as ReqwestProxy, RequestBuilder};
use std::error::Error as StdError;
use std::time::{Duration, Instant};

/// Default timeout for proxy checks in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default URL to test proxies against
const DEFAULT_TEST_URL: &str = "http://httpbin.org/ip";

const DEFAULT_USER_AGENT: &str = "RegProxy/1.0";

/// Anything that can test one candidate address.
///
/// A probe makes exactly one attempt and never fails: every outcome,
/// including a malformed address, is reported through the returned result.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self, address: &CandidateAddress) -> ProbeResult;
}

/// Configuration for proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each proxy check
    pub timeout: Duration,
    /// URL to test proxies against
    pub test_url: String,
    /// HTTP method of the test request
    pub method: Method,
    /// Request body sent as JSON, if any
    pub payload: Option<String>,
    /// API credential header attached to every request
    pub api_key: Option<(HeaderName, HeaderValue)>,
    pub user_agent: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            test_url: DEFAULT_TEST_URL.to_string(),
            method: Method::GET,
            payload: None,
            api_key: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_payload(mut self, payload: String) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Fails when `header` is not a valid header name or `key` not a valid value
    pub fn with_api_key(mut self, header: &str, key: &str) -> crate::Result<Self> {
        let name = HeaderName::from_bytes(header.trim().as_bytes())
            .with_context(|| format!("invalid API key header name {:?}", header))?;
        let mut value =
            HeaderValue::from_str(key.trim()).context("API key is not a valid header value")?;
        value.set_sensitive(true);
        self.api_key = Some((name, value));
        Ok(self)
    }
}

/// Proxy checker that routes one real request through the candidate
/// as an HTTP forward proxy
#[derive(Debug, Clone, Default)]
pub struct ProxyChecker {
    config: CheckerConfig,
}

impl ProxyChecker {
    /// Create a new proxy checker with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new proxy checker with custom configuration
    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Check a single proxy
    pub async fn check_proxy(&self, address: &CandidateAddress) -> ProbeResult {
        let start = Instant::now();

        let client = match self.create_client(address) {
            Ok(client) => client,
            Err(failure) => return ProbeResult::failed(address.clone(), start.elapsed(), failure),
        };

        match tokio::time::timeout(self.config.timeout, self.exchange(&client, address, start))
            .await
        {
            Ok(result) => result,
            Err(_) => ProbeResult::failed(address.clone(), start.elapsed(), ProbeFailure::Timeout),
        }
    }

    async fn exchange(
        &self,
        client: &Client,
        address: &CandidateAddress,
        start: Instant,
    ) -> ProbeResult {
        let response = match self.build_request(client).send().await {
            Ok(response) => response,
            Err(e) => return ProbeResult::failed(address.clone(), start.elapsed(), classify(&e)),
        };

        // Latency stops at response headers; the body read is still bounded by the timeout
        let latency = start.elapsed();
        let status = response.status();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let failure = match classify(&e) {
                    ProbeFailure::Timeout => ProbeFailure::Timeout,
                    _ => ProbeFailure::ReadFailed(error_chain(&e)),
                };
                return ProbeResult::failed(address.clone(), latency, failure);
            }
        };

        if status.is_success() {
            ProbeResult::working(address.clone(), latency, status.as_u16(), body.len())
        } else {
            ProbeResult::failed(
                address.clone(),
                latency,
                ProbeFailure::http_status(status.as_u16(), &body),
            )
        }
    }

    fn build_request(&self, client: &Client) -> RequestBuilder {
        let mut request = client.request(self.config.method.clone(), &self.config.test_url);

        if let Some(ref payload) = self.config.payload {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(payload.clone());
        }

        if let Some((ref name, ref value)) = self.config.api_key {
            request = request.header(name.clone(), value.clone());
        }

        request
    }

    /// Create a reqwest client routed through the candidate.
    ///
    /// Each probe gets its own client with idle pooling disabled, so no
    /// connection outlives the probe.
    fn create_client(&self, address: &CandidateAddress) -> Result<Client, ProbeFailure> {
        let proxy_url = address.proxy_url()?;
        let reqwest_proxy = ReqwestProxy::all(&proxy_url)
            .map_err(|_| ProbeFailure::AddressMalformed(address.to_string()))?;

        Client::builder()
            .proxy(reqwest_proxy)
            .timeout(self.config.timeout)
            .connect_timeout(self.config.timeout)
            .pool_max_idle_per_host(0)
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| ProbeFailure::ConnectFailed(error_chain(&e)))
    }
}

#[async_trait]
impl Prober for ProxyChecker {
    async fn probe(&self, address: &CandidateAddress) -> ProbeResult {
        self.check_proxy(address).await
    }
}

fn classify(err: &reqwest::Error) -> ProbeFailure {
    if err.is_timeout() {
        ProbeFailure::Timeout
    } else if err.is_body() || err.is_decode() {
        ProbeFailure::ReadFailed(error_chain(err))
    } else {
        ProbeFailure::ConnectFailed(error_chain(err))
    }
}

/// Render an error with its sources, e.g. `error sending request: connection refused`
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
