//! Service Layer Error Types

use crate::config::ConfigError;
use crate::db::StoreError;
use crate::repositories::RepositoryError;
use crate::search::SearchIndexError;
use thiserror::Error;

/// `DatabaseManager` errors
#[derive(Error, Debug)]
pub enum ManagerError {
    /// A repository or adapter was requested before `initialize`
    #[error("Database manager is not initialized")]
    NotInitialized,

    #[error("Unknown repository '{name}'; valid repositories: {}", .valid.join(", "))]
    UnknownRepository { name: String, valid: Vec<String> },

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Repository operation failed: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Search indexer setup failed: {0}")]
    Search(#[from] SearchIndexError),
}

impl ManagerError {
    pub fn unknown_repository(name: impl Into<String>, valid: &[&str]) -> Self {
        Self::UnknownRepository {
            name: name.into(),
            valid: valid.iter().map(|s| s.to_string()).collect(),
        }
    }
}
