//! Ranking of probe results into the next working set

use crate::proxy::models::{ProbeResult, WorkingProxy, WorkingSet};
use std::collections::HashSet;

/// Keep the fastest working results, at most `capacity` of them.
///
/// Ordering is ascending latency; equal latencies fall back to the address
/// string so the output does not depend on completion order. If an address
/// appears more than once only its fastest result counts.
pub fn reduce(results: &[ProbeResult], capacity: usize) -> WorkingSet {
    let mut working: Vec<&ProbeResult> = results.iter().filter(|r| r.is_working).collect();
    working.sort_by(|a, b| {
        a.latency
            .cmp(&b.latency)
            .then_with(|| a.address.cmp(&b.address))
    });

    let mut seen = HashSet::new();
    let entries = working
        .into_iter()
        .filter(|r| seen.insert(&r.address))
        .take(capacity)
        .map(|r| WorkingProxy {
            address: r.address.clone(),
            latency: Some(r.latency),
        })
        .collect();

    WorkingSet::from_ranked(entries)
}
