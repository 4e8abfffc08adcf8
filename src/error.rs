//! Per-item error taxonomy.
//!
//! Anything that goes wrong while indexing a single descriptor key becomes an
//! [`ItemError`]. These are logged and counted by the backfill, never
//! propagated. Run-level failures (config, listing) stay `anyhow::Error`.

use crate::extract::ExtractError;
use crate::search::SearchError;

#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// Key did not split into platform, compiler, package and hash.
    #[error("unrecognized descriptor key: {0}")]
    Parse(String),

    /// Existence query against the search backend failed.
    #[error("dedup check failed: {0}")]
    Dedup(#[source] SearchError),

    /// Bundle download failed (missing object, network error).
    #[error("bundle download failed: {0}")]
    Fetch(String),

    #[error("bundle extraction failed: {0}")]
    Extract(#[from] ExtractError),

    /// Extracted metadata was not shaped like a build spec.
    #[error("invalid build metadata: {0}")]
    Assemble(String),

    /// Search backend refused or failed the document write.
    #[error("document write failed: {0}")]
    Write(#[source] SearchError),

    /// The worker running this item panicked or was cancelled.
    #[error("worker aborted: {0}")]
    Aborted(String),
}

impl ItemError {
    /// Short pipeline stage label, used as a structured log field.
    pub fn stage(&self) -> &'static str {
        match self {
            ItemError::Parse(_) => "parse",
            ItemError::Dedup(_) => "dedup",
            ItemError::Fetch(_) => "fetch",
            ItemError::Extract(_) => "extract",
            ItemError::Assemble(_) => "assemble",
            ItemError::Write(_) => "write",
            ItemError::Aborted(_) => "aborted",
        }
    }
}
