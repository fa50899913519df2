//! Error types shared by the validation engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest response body snippet kept on an HTTP status failure
pub const BODY_SNIPPET_LEN: usize = 200;

/// Why a single probe did not produce a working proxy.
///
/// These never escape a probe as faults; they are stored on the
/// [`ProbeResult`](crate::proxy::ProbeResult) as data.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeFailure {
    #[error("malformed proxy address: {0}")]
    AddressMalformed(String),

    #[error("connection through proxy failed: {0}")]
    ConnectFailed(String),

    #[error("probe timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("failed to read response: {0}")]
    ReadFailed(String),
}

impl ProbeFailure {
    /// Build an HTTP status failure, keeping only the head of the body
    pub fn http_status(status: u16, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let body = text.chars().take(BODY_SNIPPET_LEN).collect();
        ProbeFailure::HttpStatus { status, body }
    }

    /// Short machine-friendly name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeFailure::AddressMalformed(_) => "address_malformed",
            ProbeFailure::ConnectFailed(_) => "connect_failed",
            ProbeFailure::Timeout => "timeout",
            ProbeFailure::HttpStatus { .. } => "http_error",
            ProbeFailure::ReadFailed(_) => "read_failed",
        }
    }
}

/// Faults that abort a whole validation cycle
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("failed to fetch candidate proxies: {0}")]
    SourceFetch(#[source] anyhow::Error),

    #[error("no candidate proxies available")]
    NoCandidates,

    #[error("cycle cancelled before probing started")]
    Cancelled,
}
