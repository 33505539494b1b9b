//! Extraction agent contract.

use async_trait::async_trait;
use recsync_shared::{BasicRecord, FieldMap};

/// Failure of a single fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    /// Worth retrying later in the run (timeouts, 5xx, rate limiting).
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help (malformed response, record not found).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExtractionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the orchestrator may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Source of record field maps.
///
/// An agent holds one session with the record source and is driven
/// sequentially: `fetch_basic_list` selects the recipient context that
/// subsequent `fetch_detail` calls operate in.
#[async_trait]
pub trait ExtractionAgent: Send {
    /// Enumerate the records visible to `recipient`, with their base fields.
    async fn fetch_basic_list(
        &mut self,
        recipient: &str,
    ) -> Result<Vec<BasicRecord>, ExtractionError>;

    /// Fetch the detail fields of one record.
    async fn fetch_detail(&mut self, record_id: &str) -> Result<FieldMap, ExtractionError>;

    /// Human-readable agent name for tracing.
    fn name(&self) -> &str;
}
