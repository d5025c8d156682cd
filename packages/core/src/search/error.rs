//! Search Error Types

use crate::db::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Search engine and indexing failures
///
/// These stop at the `SearchIndexer` boundary: the indexer logs them and
/// reports an [`IndexOutcome`] or `None` instead of propagating.
#[derive(Error, Debug)]
pub enum SearchIndexError {
    #[error("Search is disabled")]
    Disabled,

    #[error("Search engine unreachable: {0}")]
    Unreachable(String),

    #[error("Search engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Store error during indexing: {0}")]
    Store(#[from] StoreError),

    #[error("Search serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for SearchIndexError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Serialization(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

/// Result of a fire-and-report indexing operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum IndexOutcome {
    /// This many documents reached the engine
    Indexed(usize),
    /// Search disabled, or the collection is not searchable
    Skipped,
    /// The operation failed; the reason was logged
    Failed(String),
}

impl IndexOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, IndexOutcome::Failed(_))
    }
}
