//! Bounded fan-out of probes over many candidate addresses

use crate::error::ProbeFailure;
use crate::proxy::checker::Prober;
use crate::proxy::models::{CandidateAddress, ProbeResult};
use futures::FutureExt;
use std::future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a dispatch stopped before every address was probed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// External cancellation; admitted probes were allowed to finish
    Cancelled,
    /// The deadline passed; in-flight probes were aborted
    DeadlineExpired,
}

/// Everything a dispatch produced
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Results in completion order
    pub results: Vec<ProbeResult>,
    pub submitted: usize,
    pub admitted: usize,
    pub stopped: Option<StopReason>,
}

impl DispatchReport {
    pub fn working_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_working).count()
    }
}

/// Runs probes concurrently behind a counting admission gate
pub struct Dispatcher<P: Prober> {
    prober: Arc<P>,
    concurrency: usize,
    observer: Option<mpsc::UnboundedSender<ProbeResult>>,
}

impl<P: Prober> Dispatcher<P> {
    pub fn new(prober: P, concurrency: usize) -> Self {
        Self::from_shared(Arc::new(prober), concurrency)
    }

    pub fn from_shared(prober: Arc<P>, concurrency: usize) -> Self {
        Self {
            prober,
            concurrency: concurrency.max(1),
            observer: None,
        }
    }

    /// Receive a copy of every probe result as soon as it completes
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<ProbeResult>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn prober(&self) -> &Arc<P> {
        &self.prober
    }

    /// Probe every address once, at most `concurrency` at a time.
    ///
    /// Cancelling `cancel` stops admission and lets admitted probes finish.
    /// Passing `deadline` stops admission and aborts in-flight probes.
    /// Either way the results collected so far are returned.
    pub async fn dispatch(
        &self,
        addresses: Vec<CandidateAddress>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> DispatchReport {
        let submitted = addresses.len();
        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut admitted = 0;
        let mut stopped = None;

        for address in addresses {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stopped = Some(StopReason::Cancelled);
                    break;
                }
                _ = expired(deadline) => {
                    stopped = Some(StopReason::DeadlineExpired);
                    break;
                }
                permit = Arc::clone(&gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let prober = Arc::clone(&self.prober);
            let observer = self.observer.clone();
            admitted += 1;

            tasks.spawn(async move {
                let started = Instant::now();
                let result = match AssertUnwindSafe(prober.probe(&address)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Probe for {} panicked", address);
                        ProbeResult::failed(
                            address.clone(),
                            started.elapsed(),
                            ProbeFailure::ConnectFailed("probe panicked".to_string()),
                        )
                    }
                };
                drop(permit);

                match &result.failure {
                    None => info!("✓ {} ({}ms)", result.address, result.latency_ms()),
                    Some(failure) => debug!("✗ {}: {}", result.address, failure),
                }
                if let Some(observer) = observer {
                    let _ = observer.send(result.clone());
                }
                result
            });
        }

        if stopped == Some(StopReason::DeadlineExpired) {
            tasks.abort_all();
        }

        let mut results = Vec::with_capacity(admitted);
        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = expired(deadline), if stopped != Some(StopReason::DeadlineExpired) => {
                    stopped = Some(StopReason::DeadlineExpired);
                    tasks.abort_all();
                    continue;
                }
            };

            match joined {
                None => break,
                Some(Ok(result)) => results.push(result),
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => warn!("Probe task failed: {}", e),
            }
        }

        if let Some(reason) = stopped {
            debug!(
                "Dispatch stopped early ({:?}): {} of {} admitted, {} results",
                reason,
                admitted,
                submitted,
                results.len()
            );
        }

        DispatchReport {
            results,
            submitted,
            admitted,
            stopped,
        }
    }
}

/// Resolves when the deadline passes; never resolves without one
async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
