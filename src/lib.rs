//! RegProxy - proxy pool validation
//!
//! Crawls public proxy lists, tests candidates concurrently by sending a
//! real API request through each one, and keeps a ranked pool of the
//! fastest proxies that work.

pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod storage;
pub mod tui;

pub use config::Config;
pub use error::{CycleError, ProbeFailure};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
