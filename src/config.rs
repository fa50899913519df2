//! Daemon configuration loaded from a TOML file

use crate::proxy::{CheckerConfig, CrawlerConfig};
use crate::Result;
use anyhow::{bail, Context};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable that overrides `api.key`
pub const API_KEY_ENV: &str = "REGPROXY_API_KEY";

const PLACEHOLDER_API_KEY: &str = "your-api-key-here";

const DEFAULT_API_URL: &str =
    "https://api.elevenlabs.io/v1/text-to-speech/JBFqnCBsd6RMkjVDRZzb?output_format=mp3_44100_128";

const DEFAULT_TEST_PAYLOAD: &str =
    r#"{"text": "The first move is what sets everything in motion.", "model_id": "eleven_multilingual_v2"}"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub daemon: DaemonConfig,
    pub proxy: ProxyConfig,
    pub database: DatabaseConfig,
    pub files: FilesConfig,
}

/// The request every probe sends through a candidate proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub key: String,
    pub url: String,
    pub method: String,
    pub key_header: String,
    pub test_payload: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            url: DEFAULT_API_URL.to_string(),
            method: "POST".to_string(),
            key_header: "xi-api-key".to_string(),
            test_payload: DEFAULT_TEST_PAYLOAD.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between maintenance cycles
    pub interval: u64,
    /// Probe concurrency limit
    pub threads: usize,
    /// Per-probe timeout in seconds
    pub timeout: u64,
    /// Upper bound in seconds on one validation cycle
    pub cycle_deadline: u64,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: 300,
            threads: 20,
            timeout: 10,
            cycle_deadline: 600,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Seconds between crawl cycles
    pub sources_refresh_interval: u64,
    pub max_crawl_workers: usize,
    /// Upper bound in seconds on fetching every source
    pub crawl_deadline: u64,
    /// Crawled proxies tested per crawl cycle; zero or less tests all
    pub test_sample_size: i64,
    /// Working set capacity
    pub keep_working_proxies: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            sources_refresh_interval: 3600,
            max_crawl_workers: 15,
            crawl_deadline: 300,
            test_sample_size: 100,
            keep_working_proxies: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub url: String,
    /// Connection timeout in seconds
    pub timeout: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "sqlite://regproxy.db".to_string(),
            timeout: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub working_proxies: String,
    pub all_proxies: String,
    /// Empty disables file logging
    pub log_file: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            working_proxies: "working_proxies.txt".to_string(),
            all_proxies: "proxies.txt".to_string(),
            log_file: String::new(),
        }
    }
}

impl Config {
    /// Load the config file, falling back to defaults when it does not exist.
    ///
    /// `REGPROXY_API_KEY` takes precedence over `api.key`. Scheduling and
    /// storage settings are validated here; the `api` section is checked
    /// by [`Config::validate`], which only commands that probe need.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("error opening config file {}", path.display()))?;
            Self::from_toml_str(&content)
                .with_context(|| format!("error parsing config file {}", path.display()))?
        } else {
            info!(
                "Config file not found, using defaults. Create {} to customize settings.",
                path.display()
            );
            Self::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            config.override_api_key(key);
        }

        config.validate_settings()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn override_api_key(&mut self, key: String) {
        if !key.trim().is_empty() {
            self.api.key = key;
        }
    }

    /// Full validation, including the API credential probes send
    pub fn validate(&self) -> Result<()> {
        self.validate_settings()?;
        self.validate_api()
    }

    pub fn validate_api(&self) -> Result<()> {
        let key = self.api.key.trim();
        if key.is_empty() || key == PLACEHOLDER_API_KEY {
            bail!(
                "please set your API key in the config file or the {} environment variable",
                API_KEY_ENV
            );
        }
        if self.api.url.trim().is_empty() {
            bail!("api.url must not be empty");
        }
        self.checker_config()?;
        Ok(())
    }

    /// Everything outside the `api` section
    pub fn validate_settings(&self) -> Result<()> {
        if self.daemon.threads == 0 {
            bail!("daemon.threads must be at least 1");
        }
        if self.daemon.timeout == 0 {
            bail!("daemon.timeout must be at least 1 second");
        }
        if self.daemon.interval == 0 || self.proxy.sources_refresh_interval == 0 {
            bail!("daemon.interval and proxy.sources_refresh_interval must be positive");
        }
        if self.daemon.cycle_deadline == 0 || self.proxy.crawl_deadline == 0 {
            bail!("daemon.cycle_deadline and proxy.crawl_deadline must be positive");
        }
        if self.proxy.keep_working_proxies == 0 {
            bail!("proxy.keep_working_proxies must be at least 1");
        }
        if self.database.enabled && self.database.url.trim().is_empty() {
            bail!("database.url must be set when the database is enabled");
        }
        Ok(())
    }

    pub fn method(&self) -> Result<Method> {
        Method::from_bytes(self.api.method.trim().to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid api.method {}", self.api.method))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.daemon.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.timeout)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.daemon.cycle_deadline)
    }

    pub fn sources_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.proxy.sources_refresh_interval)
    }

    pub fn crawl_deadline(&self) -> Duration {
        Duration::from_secs(self.proxy.crawl_deadline)
    }

    pub fn database_timeout(&self) -> Duration {
        Duration::from_secs(self.database.timeout)
    }

    /// Sample size in the form the cycle controller takes; zero means all
    pub fn sample_size(&self) -> usize {
        usize::try_from(self.proxy.test_sample_size).unwrap_or(0)
    }

    pub fn log_file(&self) -> Option<&Path> {
        let file = self.files.log_file.trim();
        (!file.is_empty()).then(|| Path::new(file))
    }

    /// Probe settings derived from the `api` and `daemon` sections
    pub fn checker_config(&self) -> Result<CheckerConfig> {
        let mut config = CheckerConfig::new()
            .with_timeout(self.timeout())
            .with_test_url(self.api.url.clone())
            .with_method(self.method()?)
            .with_api_key(&self.api.key_header, &self.api.key)
            .context("invalid api section")?;
        if !self.api.test_payload.trim().is_empty() {
            config = config.with_payload(self.api.test_payload.clone());
        }
        Ok(config)
    }

    pub fn crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig::new()
            .with_timeout(self.timeout())
            .with_max_workers(self.proxy.max_crawl_workers.max(1))
    }

    /// Human-readable summary of the effective settings, key masked
    pub fn summary(&self) -> String {
        let database = if self.database.enabled {
            format!("enabled ({})", self.database.url)
        } else {
            "disabled".to_string()
        };
        let sample = match self.sample_size() {
            0 => "all".to_string(),
            n => n.to_string(),
        };

        format!(
            "API URL: {}\nAPI method: {}\nAPI key: {}\nMaintenance interval: {}s\n\
             Crawl interval: {}s\nWorkers: {}\nProbe timeout: {}s\nCycle deadline: {}s\n\
             Test sample size: {}\nKeep working proxies: {}\nDatabase: {}\n\
             Working proxies file: {}\nAll proxies file: {}\nLog file: {}",
            self.api.url,
            self.api.method,
            mask(&self.api.key),
            self.daemon.interval,
            self.proxy.sources_refresh_interval,
            self.daemon.threads,
            self.daemon.timeout,
            self.daemon.cycle_deadline,
            sample,
            self.proxy.keep_working_proxies,
            database,
            self.files.working_proxies,
            self.files.all_proxies,
            self.log_file()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}

fn mask(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{}{}", visible, "*".repeat(key.chars().count().saturating_sub(4)))
}
