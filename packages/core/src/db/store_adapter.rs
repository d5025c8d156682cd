//! StoreAdapter Trait - Backend Contract
//!
//! This module defines the `StoreAdapter` trait implemented by every storage
//! backend. Repositories and the search indexer depend only on
//! `Arc<dyn StoreAdapter>`, so the same domain code runs unchanged over the
//! relational (libsql) and document (SurrealDB) stores.
//!
//! # Contract
//!
//! - Reads return canonical documents carrying a string `_id`
//! - Writes return the post-write document
//! - `find_by_id` / `find_one` return `None` when nothing matches
//! - `delete_by_id` reports whether a record existed
//! - `update_many` / `delete_many` return affected counts
//!
//! # Transactions
//!
//! `start_transaction` returns an opaque [`Transaction`] handle. Most callers
//! should prefer [`with_transaction`](#method.with_transaction), which commits
//! when the callback succeeds and rolls back on any error:
//!
//! ```rust,no_run
//! # use unistore_core::db::{StoreAdapter, StoreError};
//! # use unistore_core::models::doc;
//! # use serde_json::json;
//! # async fn run(store: &dyn StoreAdapter) -> Result<(), StoreError> {
//! store
//!     .with_transaction(|tx| {
//!         Box::pin(async move {
//!             tx.create("conversations", doc(json!({"userId": "u1", "title": "Hi"})))
//!                 .await?;
//!             Ok::<_, StoreError>(())
//!         })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::db::error::{StoreError, StoreResult};
use crate::models::{
    document_id, AggregateSpec, Document, FindOneAndUpdateOptions, Query, QueryOptions, Update,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Which storage backend an adapter talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Relational,
    Document,
}

impl BackendKind {
    /// Discriminator string reported in health output and config
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Relational => "relational",
            BackendKind::Document => "document",
        }
    }

    /// Concrete engine behind the backend
    pub fn engine(self) -> &'static str {
        match self {
            BackendKind::Relational => "libsql",
            BackendKind::Document => "surrealdb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "libsql" | "turso" | "sqlite" => Ok(BackendKind::Relational),
            "document" | "surrealdb" | "surreal" => Ok(BackendKind::Document),
            other => Err(StoreError::connection(format!(
                "unknown backend '{}', expected 'relational' or 'document'",
                other
            ))),
        }
    }
}

/// Result of an adapter health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreHealth {
    pub backend: BackendKind,
    pub connected: bool,
    pub latency_ms: u64,
    /// Backend-specific metrics (pool occupancy, query timings, endpoint)
    pub details: Value,
    pub error: Option<String>,
}

impl StoreHealth {
    pub fn healthy(&self) -> bool {
        self.connected && self.error.is_none()
    }
}

/// Backend half of a transaction
///
/// Implemented by each adapter; wrapped by [`Transaction`] so callers never
/// see the backend type.
#[async_trait]
pub trait TransactionOps: Send {
    async fn create(&mut self, collection: &str, data: Document) -> StoreResult<Document>;

    async fn find_by_id(&mut self, collection: &str, id: &str) -> StoreResult<Option<Document>>;

    async fn find_many(
        &mut self,
        collection: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> StoreResult<Vec<Document>>;

    async fn update_by_id(
        &mut self,
        collection: &str,
        id: &str,
        update: &Update,
    ) -> StoreResult<Option<Document>>;

    async fn delete_by_id(&mut self, collection: &str, id: &str) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Opaque transaction handle returned by `StoreAdapter::start_transaction`
pub struct Transaction {
    inner: Box<dyn TransactionOps>,
}

impl Transaction {
    pub fn new(inner: Box<dyn TransactionOps>) -> Self {
        Self { inner }
    }

    pub async fn create(&mut self, collection: &str, data: Document) -> StoreResult<Document> {
        self.inner.create(collection, data).await
    }

    pub async fn find_by_id(
        &mut self,
        collection: &str,
        id: &str,
    ) -> StoreResult<Option<Document>> {
        self.inner.find_by_id(collection, id).await
    }

    pub async fn find_many(
        &mut self,
        collection: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> StoreResult<Vec<Document>> {
        self.inner.find_many(collection, query, options).await
    }

    pub async fn update_by_id(
        &mut self,
        collection: &str,
        id: &str,
        update: &Update,
    ) -> StoreResult<Option<Document>> {
        self.inner.update_by_id(collection, id, update).await
    }

    pub async fn delete_by_id(&mut self, collection: &str, id: &str) -> StoreResult<bool> {
        self.inner.delete_by_id(collection, id).await
    }

    pub async fn commit(self) -> StoreResult<()> {
        self.inner.commit().await
    }

    pub async fn rollback(self) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

/// Abstraction layer for document persistence
///
/// All methods are async so both the embedded (libsql file, SurrealDB mem/rocksdb)
/// and network (Turso, SurrealDB http) deployments share one contract.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single adapter instance is shared
/// by every repository through an `Arc`.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    //
    // LIFECYCLE
    //

    /// Backend discriminator
    fn backend(&self) -> BackendKind;

    /// Open connections and prepare the schema
    ///
    /// Idempotent: connecting an already connected adapter is a no-op.
    async fn connect(&self) -> StoreResult<()>;

    /// Release all backend resources
    async fn disconnect(&self) -> StoreResult<()>;

    fn is_connected(&self) -> bool;

    //
    // READS
    //

    async fn find_by_id(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;

    /// First document matching `query` (respecting sort in `options`)
    async fn find_one(
        &self,
        collection: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> StoreResult<Option<Document>> {
        let options = options.clone().limit(1);
        let mut docs = self.find_many(collection, query, &options).await?;
        Ok(if docs.is_empty() {
            None
        } else {
            Some(docs.swap_remove(0))
        })
    }

    async fn find_many(
        &self,
        collection: &str,
        query: &Query,
        options: &QueryOptions,
    ) -> StoreResult<Vec<Document>>;

    async fn count(&self, collection: &str, query: &Query) -> StoreResult<u64>;

    /// Grouped aggregation; each row carries the group value under `_id`
    async fn aggregate(&self, collection: &str, spec: &AggregateSpec)
        -> StoreResult<Vec<Document>>;

    //
    // WRITES
    //

    /// Insert one record and return it as stored
    ///
    /// # Errors
    ///
    /// `StoreError::Conflict` when a unique constraint is violated.
    async fn create(&self, collection: &str, data: Document) -> StoreResult<Document>;

    async fn create_many(&self, collection: &str, data: Vec<Document>)
        -> StoreResult<Vec<Document>>;

    /// Apply `update` to one record; `None` when the id does not exist
    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
    ) -> StoreResult<Option<Document>>;

    async fn update_many(&self, collection: &str, query: &Query, update: &Update)
        -> StoreResult<u64>;

    async fn delete_by_id(&self, collection: &str, id: &str) -> StoreResult<bool>;

    async fn delete_many(&self, collection: &str, query: &Query) -> StoreResult<u64>;

    /// Find-then-write with optional upsert
    ///
    /// When nothing matches and `upsert` is set, a record is created from the
    /// query's equality fields merged with the update. If that create loses a
    /// uniqueness race the winner is re-read once and updated instead.
    async fn find_one_and_update(
        &self,
        collection: &str,
        query: &Query,
        update: &Update,
        options: FindOneAndUpdateOptions,
    ) -> StoreResult<Option<Document>> {
        if let Some(existing) = self.find_one(collection, query, &QueryOptions::new()).await? {
            return match document_id(&existing) {
                Some(id) => self.update_by_id(collection, &id, update).await,
                None => Err(StoreError::serialization(format!(
                    "{} record without _id",
                    collection
                ))),
            };
        }

        if !options.upsert {
            return Ok(None);
        }

        let mut seed = query.equality_fields();
        update.apply_to(&mut seed);
        match self.create(collection, seed).await {
            Ok(created) => Ok(Some(created)),
            Err(err) if err.is_conflict() => {
                tracing::debug!(collection, "upsert lost a uniqueness race, re-reading");
                match self.find_one(collection, query, &QueryOptions::new()).await? {
                    Some(winner) => match document_id(&winner) {
                        Some(id) => self.update_by_id(collection, &id, update).await,
                        None => Ok(Some(winner)),
                    },
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    //
    // TRANSACTIONS
    //

    async fn start_transaction(&self) -> StoreResult<Transaction>;

    async fn commit_transaction(&self, tx: Transaction) -> StoreResult<()> {
        tx.commit().await
    }

    async fn rollback_transaction(&self, tx: Transaction) -> StoreResult<()> {
        tx.rollback().await
    }

    //
    // DIAGNOSTICS
    //

    /// Check connectivity; never fails, problems are reported in the result
    async fn health_check(&self) -> StoreHealth;
}

impl<'a> dyn StoreAdapter + 'a {
    /// Run `f` inside a transaction
    ///
    /// Commits when `f` returns `Ok`, rolls back on `Err`. A rollback failure
    /// is logged and the callback's original error is returned.
    pub async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + fmt::Display + Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
    {
        let mut tx = self.start_transaction().await?;
        match f(&mut tx).await {
            Ok(value) => {
                self.commit_transaction(tx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback_transaction(tx).await {
                    tracing::error!(
                        backend = %self.backend(),
                        error = %rollback_err,
                        "rollback after failed transaction callback also failed"
                    );
                }
                tracing::debug!(error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }
}
