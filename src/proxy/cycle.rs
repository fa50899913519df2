//! Crawl and maintenance validation cycles
//!
//! Both cycle kinds share one shape: obtain candidates, dispatch probes,
//! reduce the results into a working set, then hand that set to every
//! configured [`PoolSink`]. The controller holds no pool state of its own;
//! the caller owns the current [`WorkingSet`] and replaces it with the one
//! returned in [`CycleOutcome`].

use crate::error::CycleError;
use crate::proxy::checker::Prober;
use crate::proxy::dispatcher::{Dispatcher, StopReason};
use crate::proxy::models::{CandidateAddress, ProbeResult, WorkingSet};
use crate::proxy::reducer::reduce;
use crate::storage::PoolSink;
use crate::Result;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default working set capacity
pub const DEFAULT_CAPACITY: usize = 50;

/// Number of working proxies echoed in the cycle summary
const SUMMARY_SAMPLE: usize = 3;

/// Supplies fresh candidate addresses for crawl cycles
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch_candidates(&self) -> Result<Vec<CandidateAddress>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Crawl,
    Maintenance,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Crawl => write!(f, "crawl"),
            CycleKind::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// What one cycle produced
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub kind: CycleKind,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// The next-generation pool; replaces the previous one even when empty
    pub working_set: WorkingSet,
    /// Unique candidates the cycle started from, before sampling
    pub candidates: usize,
    /// Probe results collected
    pub tested: usize,
    pub stopped: Option<StopReason>,
    /// Sink failures; these never invalidate `working_set`
    pub persistence_errors: Vec<String>,
}

impl CycleOutcome {
    pub fn success_rate(&self) -> f64 {
        if self.tested == 0 {
            0.0
        } else {
            self.working_set.len() as f64 / self.tested as f64 * 100.0
        }
    }
}

/// Ties the dispatcher and reducer into named cycles
pub struct CycleController<P: Prober> {
    dispatcher: Dispatcher<P>,
    source: Arc<dyn CandidateSource>,
    sinks: Vec<Arc<dyn PoolSink>>,
    capacity: usize,
    sample_size: usize,
    cancel: CancellationToken,
}

impl<P: Prober> CycleController<P> {
    pub fn new(dispatcher: Dispatcher<P>, source: Arc<dyn CandidateSource>) -> Self {
        Self {
            dispatcher,
            source,
            sinks: Vec::new(),
            capacity: DEFAULT_CAPACITY,
            sample_size: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PoolSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Maximum size of the working set a cycle produces
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sample size used when a maintenance cycle falls back to crawling
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Token whose cancellation stops admission of new probes in any cycle
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<P> {
        &self.dispatcher
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Test freshly crawled candidates.
    ///
    /// Only the first `sample_size` unique candidates are probed; `0`
    /// probes them all.
    pub async fn run_crawl_cycle(
        &self,
        sample_size: usize,
        deadline: Instant,
    ) -> std::result::Result<CycleOutcome, CycleError> {
        let started_at = Utc::now();
        let started = Instant::now();

        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CycleError::Cancelled),
            fetched = tokio::time::timeout_at(deadline, self.source.fetch_candidates()) => {
                match fetched {
                    Ok(fetched) => fetched.map_err(CycleError::SourceFetch)?,
                    Err(_) => {
                        return Err(CycleError::SourceFetch(anyhow!(
                            "candidate fetch exceeded the cycle deadline"
                        )))
                    }
                }
            }
        };

        let candidates = dedup_preserving_order(fetched);
        if candidates.is_empty() {
            warn!("Crawl produced no candidate proxies");
            return Err(CycleError::NoCandidates);
        }
        info!(
            "Crawled {} unique proxies in {:.2}s",
            candidates.len(),
            started.elapsed().as_secs_f64()
        );

        let mut persistence_errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.record_candidates(&candidates).await {
                warn!("Could not save crawled proxies to {}: {:#}", sink.name(), e);
                persistence_errors.push(format!("{}: {:#}", sink.name(), e));
            }
        }

        let total = candidates.len();
        let mut sample = candidates;
        if sample_size > 0 {
            sample.truncate(sample_size);
        }

        let mut outcome = self
            .validate(CycleKind::Crawl, sample, deadline, started_at, started)
            .await;
        outcome.candidates = total;
        persistence_errors.append(&mut outcome.persistence_errors);
        outcome.persistence_errors = persistence_errors;
        Ok(outcome)
    }

    /// Re-test the current pool; an empty pool falls back to a crawl cycle
    pub async fn run_maintenance_cycle(
        &self,
        current: &WorkingSet,
        deadline: Instant,
    ) -> std::result::Result<CycleOutcome, CycleError> {
        if current.is_empty() {
            info!("No working proxies to test, performing crawl");
            return self.run_crawl_cycle(self.sample_size, deadline).await;
        }

        Ok(self
            .validate(
                CycleKind::Maintenance,
                current.addresses(),
                deadline,
                Utc::now(),
                Instant::now(),
            )
            .await)
    }

    async fn validate(
        &self,
        kind: CycleKind,
        candidates: Vec<CandidateAddress>,
        deadline: Instant,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> CycleOutcome {
        let candidates = dedup_preserving_order(candidates);
        let count = candidates.len();
        info!(
            "Testing {} proxies ({}) with {} workers",
            count,
            kind,
            self.dispatcher.concurrency()
        );

        let cancel = self.cancel.child_token();
        let report = self
            .dispatcher
            .dispatch(candidates, &cancel, Some(deadline))
            .await;
        let working_set = reduce(&report.results, self.capacity);

        if let Some(reason) = report.stopped {
            warn!(
                "{} cycle stopped early ({:?}); {} of {} proxies tested",
                kind,
                reason,
                report.results.len(),
                count
            );
        }
        if report.results.is_empty() {
            warn!("{} cycle collected no probe results", kind);
        } else if report.working_count() == 0 {
            warn!("All {} tested proxies failed ({})", report.results.len(), kind);
        }

        let persistence_errors = self.publish(&working_set, &report.results).await;

        let outcome = CycleOutcome {
            kind,
            started_at,
            elapsed: started.elapsed(),
            working_set,
            candidates: count,
            tested: report.results.len(),
            stopped: report.stopped,
            persistence_errors,
        };

        info!(
            "Test completed in {:.2}s. Working proxies: {}/{} ({:.2}%)",
            outcome.elapsed.as_secs_f64(),
            outcome.working_set.len(),
            outcome.tested,
            outcome.success_rate()
        );
        for entry in outcome.working_set.iter().take(SUMMARY_SAMPLE) {
            info!("Working proxy: {}", entry.address);
        }

        outcome
    }

    /// Hand the new pool to every sink; failures are reported, never fatal
    async fn publish(&self, working_set: &WorkingSet, results: &[ProbeResult]) -> Vec<String> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.persist(working_set, results).await {
                warn!("Failed to persist working proxies to {}: {:#}", sink.name(), e);
                errors.push(format!("{}: {:#}", sink.name(), e));
            }
        }
        errors
    }
}

/// Drop repeated addresses, keeping the first occurrence
fn dedup_preserving_order(addresses: Vec<CandidateAddress>) -> Vec<CandidateAddress> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter(|address| seen.insert(address.clone()))
        .collect()
}
