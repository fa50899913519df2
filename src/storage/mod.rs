//! Persistence of working sets and probe results

mod database;
mod file;

pub use database::{ProxyDatabase, ProxyStats, STALE_AFTER};
pub use file::FileStore;

use crate::proxy::models::{CandidateAddress, ProbeResult, WorkingSet};
use crate::Result;
use async_trait::async_trait;

/// Destination for the outcome of a validation cycle.
///
/// A failing sink never invalidates the cycle that fed it; the controller
/// logs the error and carries on with the remaining sinks.
#[async_trait]
pub trait PoolSink: Send + Sync {
    /// Name used in log lines and persistence error reports
    fn name(&self) -> &str;

    /// Store the new working set together with every result that produced it
    async fn persist(&self, working_set: &WorkingSet, results: &[ProbeResult]) -> Result<()>;

    /// Store the full candidate list of a crawl
    async fn record_candidates(&self, _candidates: &[CandidateAddress]) -> Result<()> {
        Ok(())
    }
}
