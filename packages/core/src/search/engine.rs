//! Search engine seam
//!
//! `SearchIndexer` talks to the engine only through [`SearchEngine`], so the
//! Meilisearch client can be swapped for another engine or a test double.

use crate::search::error::SearchIndexError;
use crate::search::settings::IndexSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query-time options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Engine-native filter expression, e.g. `conversationId = "c1"`
    pub filter: Option<String>,
}

impl SearchOptions {
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Ranked hit ids, best first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub ids: Vec<String>,
    pub estimated_total: Option<u64>,
    pub processing_time_ms: Option<u64>,
}

/// Per-index statistics reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub number_of_documents: u64,
    pub is_indexing: bool,
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Reachability check
    async fn health(&self) -> Result<(), SearchIndexError>;

    /// Create the index if needed and apply its attribute settings
    async fn configure_index(
        &self,
        index: &str,
        settings: &IndexSettings,
    ) -> Result<(), SearchIndexError>;

    /// Add or replace documents keyed by their `id` attribute
    async fn add_documents(&self, index: &str, documents: &[Value])
        -> Result<(), SearchIndexError>;

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), SearchIndexError>;

    async fn delete_all_documents(&self, index: &str) -> Result<(), SearchIndexError>;

    async fn search(
        &self,
        index: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchHits, SearchIndexError>;

    async fn stats(&self, index: &str) -> Result<IndexStats, SearchIndexError>;
}
