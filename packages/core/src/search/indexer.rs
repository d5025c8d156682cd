//! SearchIndexer - Primary Store to Search Engine Mirroring
//!
//! Keeps search indexes in step with the primary store and answers full-text
//! queries by hydrating ranked hit ids back into stored documents.
//!
//! Every operation is fire-and-report: failures are logged and returned as
//! [`IndexOutcome::Failed`] (or `None` for searches), never as errors, so a
//! search outage cannot fail a primary-store write.
//!
//! Documents that reach the engine are stamped with the sync marker
//! (`indexed = true`, `indexedAt`), which lets [`SearchIndexer::sync_collection`]
//! page through only the documents still missing from the index.

use crate::config::SearchConfig;
use crate::db::StoreAdapter;
use crate::models::{
    document_id, now_timestamp, Document, Filter, Query, QueryOptions, Update, ID_FIELD,
    INDEXED_AT_FIELD, INDEXED_FIELD,
};
use crate::search::engine::{IndexStats, SearchEngine, SearchOptions};
use crate::search::error::{IndexOutcome, SearchIndexError};
use crate::search::meilisearch::MeilisearchEngine;
use crate::search::settings::{index_settings, prepare_for_indexing, searchable_collections};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Default documents per `sync_collection` batch
pub const DEFAULT_SYNC_BATCH_SIZE: u64 = 100;

/// Summary of one `sync_collection` run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub collection: String,
    pub indexed: usize,
    pub batches: usize,
    /// Set when a batch failed and the run stopped early
    pub error: Option<String>,
}

/// Result of a search reachability check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHealth {
    pub enabled: bool,
    pub reachable: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Mirrors searchable collections into a `SearchEngine`
#[derive(Clone)]
pub struct SearchIndexer {
    store: Arc<dyn StoreAdapter>,
    engine: Option<Arc<dyn SearchEngine>>,
    batch_size: u64,
}

impl SearchIndexer {
    pub fn new(store: Arc<dyn StoreAdapter>, engine: Option<Arc<dyn SearchEngine>>) -> Self {
        Self {
            store,
            engine,
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
        }
    }

    /// Indexer that skips every operation
    pub fn disabled(store: Arc<dyn StoreAdapter>) -> Self {
        Self::new(store, None)
    }

    /// Indexer backed by Meilisearch when `config` names an active endpoint
    pub fn from_config(
        store: Arc<dyn StoreAdapter>,
        config: &SearchConfig,
    ) -> Result<Self, SearchIndexError> {
        let engine = MeilisearchEngine::from_config(config)?
            .map(|engine| Arc::new(engine) as Arc<dyn SearchEngine>);
        if engine.is_none() {
            tracing::info!("search indexing disabled");
        }
        Ok(Self {
            batch_size: config.batch_size.max(1),
            ..Self::new(store, engine)
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_some()
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    fn engine_for(&self, collection: &str) -> Option<&Arc<dyn SearchEngine>> {
        index_settings(collection)?;
        self.engine.as_ref()
    }

    fn failed(&self, operation: &str, collection: &str, err: SearchIndexError) -> IndexOutcome {
        tracing::warn!(operation, collection, error = %err, "search indexing failed");
        IndexOutcome::Failed(err.to_string())
    }

    /// Create every searchable index and apply its settings
    pub async fn configure_indexes(&self) -> IndexOutcome {
        let Some(engine) = &self.engine else {
            return IndexOutcome::Skipped;
        };
        let mut configured = 0;
        for collection in searchable_collections() {
            let Some(settings) = index_settings(collection) else {
                continue;
            };
            if let Err(e) = engine.configure_index(collection, settings).await {
                return self.failed("configure", collection, e);
            }
            configured += 1;
        }
        tracing::info!(indexes = configured, "search indexes configured");
        IndexOutcome::Indexed(configured)
    }

    /// Index one document and stamp its sync marker
    pub async fn index_document(&self, collection: &str, doc: &Document) -> IndexOutcome {
        self.index_documents(collection, std::slice::from_ref(doc))
            .await
    }

    /// Re-index a changed document; the engine replaces by primary key
    pub async fn update_document(&self, collection: &str, doc: &Document) -> IndexOutcome {
        self.index_document(collection, doc).await
    }

    /// Index a batch and stamp the sync marker on every document sent
    pub async fn index_documents(&self, collection: &str, docs: &[Document]) -> IndexOutcome {
        let Some(engine) = self.engine_for(collection) else {
            return IndexOutcome::Skipped;
        };

        let prepared: Vec<Value> = docs
            .iter()
            .filter_map(|doc| prepare_for_indexing(collection, doc))
            .collect();
        if prepared.is_empty() {
            return IndexOutcome::Indexed(0);
        }

        if let Err(e) = engine.add_documents(collection, &prepared).await {
            return self.failed("index", collection, e);
        }

        let ids: Vec<Value> = docs
            .iter()
            .filter_map(document_id)
            .map(Value::String)
            .collect();
        let marker = Update::new()
            .set(INDEXED_FIELD, true)
            .set(INDEXED_AT_FIELD, now_timestamp());
        if let Err(e) = self
            .store
            .update_many(collection, &Query::new().filter(ID_FIELD, Filter::In(ids)), &marker)
            .await
        {
            return self.failed("mark_indexed", collection, e.into());
        }

        tracing::debug!(collection, count = prepared.len(), "documents indexed");
        IndexOutcome::Indexed(prepared.len())
    }

    pub async fn delete_document(&self, collection: &str, id: &str) -> IndexOutcome {
        let Some(engine) = self.engine_for(collection) else {
            return IndexOutcome::Skipped;
        };
        match engine.delete_document(collection, id).await {
            Ok(()) => IndexOutcome::Indexed(1),
            Err(e) => self.failed("delete", collection, e),
        }
    }

    /// Full-text search, hydrated from the primary store in rank order
    ///
    /// `None` means the engine could not answer (disabled, unsearchable
    /// collection, or failure) and the caller should fall back to a store query.
    /// Hits whose documents no longer exist are dropped.
    pub async fn search(
        &self,
        collection: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Option<Vec<Document>> {
        let engine = self.engine_for(collection)?;
        let hits = match engine.search(collection, query, options).await {
            Ok(hits) => hits,
            Err(e) => {
                self.failed("search", collection, e);
                return None;
            }
        };
        if hits.ids.is_empty() {
            return Some(Vec::new());
        }

        let filter = Query::new().filter(
            ID_FIELD,
            Filter::In(hits.ids.iter().cloned().map(Value::String).collect()),
        );
        let found = match self
            .store
            .find_many(collection, &filter, &QueryOptions::new())
            .await
        {
            Ok(found) => found,
            Err(e) => {
                self.failed("hydrate", collection, e.into());
                return None;
            }
        };

        let mut by_id: HashMap<String, Document> = found
            .into_iter()
            .filter_map(|doc| document_id(&doc).map(|id| (id, doc)))
            .collect();
        Some(hits.ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Index every document lacking the sync marker, `batch_size` at a time
    pub async fn sync_collection(&self, collection: &str, batch_size: u64) -> SyncReport {
        let mut report = SyncReport {
            collection: collection.to_string(),
            ..SyncReport::default()
        };
        if self.engine_for(collection).is_none() {
            return report;
        }

        let pending = Query::new().filter(INDEXED_FIELD, Filter::Ne(Value::Bool(true)));
        let options = QueryOptions::new().limit(batch_size.max(1));
        loop {
            let batch = match self.store.find_many(collection, &pending, &options).await {
                Ok(batch) => batch,
                Err(e) => {
                    report.error = Some(e.to_string());
                    self.failed("sync", collection, e.into());
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            match self.index_documents(collection, &batch).await {
                IndexOutcome::Indexed(0) | IndexOutcome::Skipped => break,
                IndexOutcome::Indexed(n) => {
                    report.indexed += n;
                    report.batches += 1;
                }
                IndexOutcome::Failed(reason) => {
                    report.error = Some(reason);
                    break;
                }
            }
        }

        tracing::info!(
            collection,
            indexed = report.indexed,
            batches = report.batches,
            "search sync finished"
        );
        report
    }

    /// Drop every document from the index and reset the sync markers
    pub async fn clear_index(&self, collection: &str) -> IndexOutcome {
        let Some(engine) = self.engine_for(collection) else {
            return IndexOutcome::Skipped;
        };
        if let Err(e) = engine.delete_all_documents(collection).await {
            return self.failed("clear", collection, e);
        }
        let reset = Update::new()
            .set(INDEXED_FIELD, false)
            .set(INDEXED_AT_FIELD, Value::Null);
        match self.store.update_many(collection, &Query::new(), &reset).await {
            Ok(n) => IndexOutcome::Indexed(n as usize),
            Err(e) => self.failed("clear", collection, e.into()),
        }
    }

    pub async fn health_check(&self) -> SearchHealth {
        let Some(engine) = &self.engine else {
            return SearchHealth {
                enabled: false,
                reachable: false,
                latency_ms: 0,
                error: None,
            };
        };
        let start = Instant::now();
        let result = engine.health().await;
        SearchHealth {
            enabled: true,
            reachable: result.is_ok(),
            latency_ms: start.elapsed().as_millis() as u64,
            error: result.err().map(|e| e.to_string()),
        }
    }

    pub async fn stats(&self, collection: &str) -> Option<IndexStats> {
        let engine = self.engine_for(collection)?;
        match engine.stats(collection).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                self.failed("stats", collection, e);
                None
            }
        }
    }
}
