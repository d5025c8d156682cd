//! Repository Error Types

use crate::db::StoreError;
use crate::models::ValidationError;
use thiserror::Error;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Repository operation errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Data failed required-field or domain validation
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The underlying adapter failed
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    /// A record the operation depends on does not exist
    #[error("{collection} record not found: {id}")]
    NotFound { collection: String, id: String },
}

impl RepositoryError {
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Whether the failure was a uniqueness conflict in the store
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}
