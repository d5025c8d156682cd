//! Database Layer
//!
//! This module hides the two supported storage backends behind one contract:
//!
//! - [`StoreAdapter`] - the backend-neutral CRUD, aggregate and transaction API
//! - [`LibsqlStore`] - relational backend (local SQLite files or remote Turso)
//! - [`SurrealStore`] - document backend (embedded or remote SurrealDB)
//! - [`MigrationRunner`] - versioned SQL schema migrations for the relational store
//!
//! # Architecture
//!
//! Callers work with canonical documents: a string `_id` plus camelCase fields.
//! The relational adapter translates those to snake_case columns through
//! [`naming`] and to parameterized SQL through [`SqlTranslator`]; the document
//! adapter stores them nearly as-is and compiles queries to bound SurrealQL.
//!
//! Relational connections come from a bounded [`ConnectionPool`] and every
//! statement is timed by [`QueryMetrics`].

mod error;
mod libsql_store;
mod migrations;
pub mod naming;
mod pool;
mod query_metrics;
mod sql_translator;
mod store_adapter;
mod surreal_store;

pub use error::{StoreError, StoreResult};
pub use libsql_store::{LibsqlConfig, LibsqlStore};
pub use migrations::{
    AppliedMigration, MigrationReport, MigrationRunner, MigrationSource, MigrationState,
    MigrationStatus,
};
pub use pool::{
    ConnectionPool, PoolOptions, PoolStatus, PoolTarget, PooledConnection, MEMORY_PATH,
};
pub use query_metrics::{MetricsSnapshot, QueryMetrics};
pub use sql_translator::{placeholder_count, quote_ident, SqlFragment, SqlTranslator};
pub use store_adapter::{
    BackendKind, StoreAdapter, StoreHealth, Transaction, TransactionOps,
};
pub use surreal_store::{SurrealConfig, SurrealStore};
