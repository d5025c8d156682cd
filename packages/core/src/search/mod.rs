//! Search Integration
//!
//! Mirrors search-relevant collections (messages, conversations, knowledge-base
//! documents) into an external full-text engine:
//!
//! - [`SearchIndexer`] - indexing, sync, and search with store hydration
//! - [`SearchEngine`] - engine seam; [`MeilisearchEngine`] is the HTTP client
//! - [`IndexSettings`] - per-collection searchable/filterable/sortable attributes

mod engine;
mod error;
mod indexer;
mod meilisearch;
mod settings;

pub use engine::{IndexStats, SearchEngine, SearchHits, SearchOptions};
pub use error::{IndexOutcome, SearchIndexError};
pub use indexer::{SearchHealth, SearchIndexer, SyncReport, DEFAULT_SYNC_BATCH_SIZE};
pub use meilisearch::MeilisearchEngine;
pub use settings::{
    index_settings, prepare_for_indexing, searchable_collections, IndexSettings,
    INDEX_PRIMARY_KEY,
};
