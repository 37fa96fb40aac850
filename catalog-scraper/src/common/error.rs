use std::time::Duration;

use thiserror::Error;

use crate::pipeline::ingestion::envelope::Cursor;

/// Failure of a single page fetch, after retries where applicable.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection-level failure (DNS, connect, reset, body read). The
    /// endpoint URL is deliberately not included in the message.
    #[error("request failed: {0}")]
    Http(String),

    #[error("attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("upstream returned status {status}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Response body that cannot be decoded as the page envelope.
    #[error("malformed page envelope: {0}")]
    Envelope(String),

    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    BudgetExhausted { attempts: u32, last: Box<FetchError> },

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transient failures are worth retrying; terminal ones are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::AttemptTimeout(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::Envelope(_) | Self::BudgetExhausted { .. } | Self::Cancelled => false,
        }
    }

    /// Server-provided backoff hint, when one accompanied the failure.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Run-level failures surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed at cursor {cursor}: {source}")]
    Fetch {
        cursor: Cursor,
        #[source]
        source: FetchError,
    },

    /// Upstream violated the pagination protocol (cursor loop).
    #[error("pagination protocol violation: {0}")]
    Pagination(String),

    /// Rejected before any work begins.
    #[error("invalid source configuration: {0}")]
    Config(String),

    #[error("ingest metadata store error: {0}")]
    Meta(String),

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
