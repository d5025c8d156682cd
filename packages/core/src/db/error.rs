//! Store Error Types
//!
//! This module defines error types for adapter operations, providing
//! clear error handling for connection, translation, transaction and
//! migration failures on either backend.

use thiserror::Error;

/// Result alias used by every `StoreAdapter` operation
pub type StoreResult<T> = Result<T, StoreError>;

/// Store operation errors
///
/// Covers every failure an adapter can surface. Backend driver errors are
/// folded into these variants at the adapter boundary so callers never
/// depend on libsql or SurrealDB error types.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend unreachable, pool exhausted, or adapter not connected
    #[error("Connection error: {0}")]
    Connection(String),

    /// A query shape the backend translator cannot express
    #[error("Query translation failed: {0}")]
    QueryTranslation(String),

    /// Begin/commit/rollback failure
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// A migration file failed or a rollback script is missing
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Unique constraint or duplicate record violation
    #[error("Conflict in {collection}: {message}")]
    Conflict { collection: String, message: String },

    /// Statement exceeded the configured query timeout
    #[error("Query timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Value could not be converted between canonical and backend form
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Statement execution error with context
    #[error("Query failed: {context}")]
    Query { context: String },

    /// Collection is not part of the known collection set
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),
}

impl StoreError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a query translation error
    pub fn translation(msg: impl Into<String>) -> Self {
        Self::QueryTranslation(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a migration error
    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a query execution error with context
    pub fn query(context: impl Into<String>) -> Self {
        Self::Query {
            context: context.into(),
        }
    }

    /// Whether this error is a uniqueness conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Classify a libsql error, mapping constraint violations to `Conflict`
    pub(crate) fn from_libsql(collection: &str, context: &str, err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("UNIQUE constraint failed") {
            Self::conflict(collection, message)
        } else {
            Self::query(format!("{}: {}", context, message))
        }
    }

    /// Classify a SurrealDB error, mapping duplicate records to `Conflict`
    pub(crate) fn from_surreal(collection: &str, context: &str, err: surrealdb::Error) -> Self {
        let message = err.to_string();
        if message.contains("already exists") || message.contains("already contains") {
            Self::conflict(collection, message)
        } else {
            Self::query(format!("{}: {}", context, message))
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
