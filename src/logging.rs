//! Tracing subscriber setup

use crate::Result;
use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Where log lines go
#[derive(Debug, Clone, Default)]
pub struct LogOptions<'a> {
    /// Level for this crate when `RUST_LOG` is unset
    pub level: &'a str,
    /// Append plain-text logs to this file as well
    pub file: Option<&'a Path>,
    /// Write to stderr; off while the terminal UI owns the screen
    pub console: bool,
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(options: LogOptions<'_>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(options.level)))
        .context("invalid log level")?;

    let console = options.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let file = match options.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("error creating log directory {}", parent.display())
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("error opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("failed to install log subscriber")?;
    Ok(())
}

fn default_directive(level: &str) -> String {
    let level = level.trim();
    let level = if level.is_empty() { "info" } else { level };
    format!("{}={}", env!("CARGO_CRATE_NAME"), level)
}
