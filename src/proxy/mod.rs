//! Proxy validation engine
//!
//! This module provides functionality for:
//! - Parsing candidate addresses from text and files
//! - Probing a candidate by sending a real request through it
//! - Bounded concurrent dispatch of probes with cancellation and deadlines
//! - Ranking results into a capped working set
//! - Crawling public proxy lists for fresh candidates

pub mod checker;
pub mod crawler;
pub mod cycle;
pub mod dispatcher;
pub mod models;
pub mod parser;
pub mod reducer;

#[cfg(test)]
pub(crate) mod testing;

pub use checker::{CheckerConfig, Prober, ProxyChecker};
pub use crawler::{CrawlerConfig, ProxyCrawler, ProxySource};
pub use cycle::{CandidateSource, CycleController, CycleKind, CycleOutcome};
pub use dispatcher::{DispatchReport, Dispatcher, StopReason};
pub use models::{CandidateAddress, ProbeResult, WorkingProxy, WorkingSet};
pub use parser::ProxyParser;
pub use reducer::reduce;
