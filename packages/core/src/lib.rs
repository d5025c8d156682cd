//! Unistore Data Access Layer
//!
//! One repository API over two interchangeable storage backends, with
//! background search-index synchronization.
//!
//! # Architecture
//!
//! - **StoreAdapter**: async backend contract; callers hold `Arc<dyn StoreAdapter>`
//! - **SurrealDB**: schemaless document backend (`mem://`, `rocksdb://`, `http://`)
//! - **libsql/Turso**: relational backend with query translation, pooling and migrations
//! - **Repositories**: validation and normalization in front of every write
//! - **Search**: Meilisearch mirror of messages, conversations and documents
//!
//! # Modules
//!
//! - [`config`] - TOML + environment configuration
//! - [`models`] - Canonical documents, queries, updates and pagination
//! - [`db`] - Adapters, translator, pool, metrics and migration runner
//! - [`repositories`] - Generic repository base and the 15 domain repositories
//! - [`search`] - Search engine client and indexer
//! - [`services`] - `DatabaseManager` and `HealthMonitor`

pub mod config;
pub mod db;
pub mod models;
pub mod repositories;
pub mod search;
pub mod services;

// Re-export commonly used types
pub use config::{ConfigError, DalConfig};
pub use db::{BackendKind, StoreAdapter, StoreError, StoreResult};
pub use models::*;
pub use repositories::{Repositories, Repository, RepositoryError, RepositoryResult};
pub use services::*;
