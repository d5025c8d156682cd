//! Knowledge-base documents.

use crate::db::StoreAdapter;
use crate::models::{
    collections, Document, Filter, PageRequest, Paginated, Query, QueryOptions, SortOrder, Update,
    ValidationError,
};
use crate::repositories::base::{filter_eq, RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use crate::search::{SearchIndexer, SearchOptions};
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_READY: &str = "ready";
pub const STATUS_FAILED: &str = "failed";

const STATUSES: &[&str] = &[STATUS_PENDING, STATUS_PROCESSING, STATUS_READY, STATUS_FAILED];

struct DocumentPolicy;

impl RecordPolicy for DocumentPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["knowledgeBaseId", "title"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(status) = data.get("status") {
            if !status.as_str().is_some_and(|s| STATUSES.contains(&s)) {
                return Err(ValidationError::invalid(
                    "status",
                    format!("expected one of {}", STATUSES.join(", ")),
                ));
            }
        }
        if let Some(size) = data.get("size") {
            if size.as_u64().is_none() {
                return Err(ValidationError::invalid("size", "must be a non-negative integer"));
            }
        }
        Ok(())
    }

    fn normalize(&self, data: &mut Document) {
        if let Some(Value::String(title)) = data.get_mut("title") {
            *title = title.trim().to_string();
        }
    }

    fn after_load(&self, mut doc: Document) -> Document {
        doc.entry("status")
            .or_insert_with(|| Value::String(STATUS_PENDING.to_string()));
        doc
    }

    fn search_fields(&self) -> &'static [&'static str] {
        &["title", "content"]
    }
}

#[derive(Clone, Debug)]
pub struct DocumentRepository {
    repo: Repository,
}

impl Deref for DocumentRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl DocumentRepository {
    pub fn new(store: Arc<dyn StoreAdapter>, indexer: SearchIndexer) -> Self {
        Self {
            repo: Repository::new(collections::DOCUMENTS, store)
                .with_policy(DocumentPolicy)
                .with_indexer(indexer),
        }
    }

    pub async fn find_by_knowledge_base(
        &self,
        knowledge_base_id: &str,
        page: &PageRequest,
    ) -> RepositoryResult<Paginated<Document>> {
        let mut page = page.clone();
        if page.sort.is_empty() {
            page = page.sort_by("createdAt", SortOrder::Desc);
        }
        self.paginate(&Query::new().eq("knowledgeBaseId", knowledge_base_id), &page)
            .await
    }

    pub async fn find_by_status(&self, status: &str, limit: u64) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().eq("status", status),
            &QueryOptions::new()
                .sort_by("createdAt", SortOrder::Asc)
                .limit(limit),
        )
        .await
    }

    /// Move a document through its processing lifecycle
    ///
    /// `error` is recorded for failures and cleared otherwise.
    pub async fn mark_status(
        &self,
        id: &str,
        status: &str,
        error: Option<&str>,
    ) -> RepositoryResult<Option<Document>> {
        let update = match error {
            Some(message) => Update::new().set("status", status).set("error", message),
            None => Update::new().set("status", status).set("error", Value::Null),
        };
        self.update_by_id(id, &update).await
    }

    /// Search titles and bodies, optionally within one knowledge base
    pub async fn search_documents(
        &self,
        text: &str,
        knowledge_base_id: Option<&str>,
        limit: u64,
    ) -> RepositoryResult<Vec<Document>> {
        let mut options = SearchOptions::default().limit(limit);
        if let Some(id) = knowledge_base_id {
            options = options.filter(filter_eq("knowledgeBaseId", id));
        }
        if let Some(found) = self.search_index(text, &options).await {
            return Ok(found);
        }

        let mut query = Query::new().or(vec![
            Query::new().filter("title", Filter::contains_ci(text)),
            Query::new().filter("content", Filter::contains_ci(text)),
        ]);
        if let Some(id) = knowledge_base_id {
            query = query.eq("knowledgeBaseId", id);
        }
        self.find_many(
            &query,
            &QueryOptions::new()
                .sort_by("updatedAt", SortOrder::Desc)
                .limit(limit),
        )
        .await
    }

    pub async fn delete_by_knowledge_base(&self, knowledge_base_id: &str) -> RepositoryResult<u64> {
        self.delete_many(&Query::new().eq("knowledgeBaseId", knowledge_base_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SurrealConfig, SurrealStore};
    use crate::models::{doc, document_id};
    use serde_json::json;

    async fn documents() -> anyhow::Result<DocumentRepository> {
        let store: Arc<dyn StoreAdapter> = Arc::new(SurrealStore::new(SurrealConfig::memory()));
        store.connect().await?;
        Ok(DocumentRepository::new(
            store.clone(),
            SearchIndexer::disabled(store),
        ))
    }

    #[tokio::test]
    async fn test_status_lifecycle() -> anyhow::Result<()> {
        let documents = documents().await?;
        let created = documents
            .create(doc(json!({"knowledgeBaseId": "kb1", "title": "Manual"})))
            .await?;
        assert_eq!(created["status"], json!(STATUS_PENDING));
        let id = document_id(&created).expect("id");

        let failed = documents
            .mark_status(&id, STATUS_FAILED, Some("parse error"))
            .await?
            .expect("exists");
        assert_eq!(failed["error"], json!("parse error"));

        assert!(documents.mark_status(&id, "done", None).await.is_err());
        assert_eq!(documents.find_by_status(STATUS_FAILED, 10).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_search_fallback_matches_title_or_content() -> anyhow::Result<()> {
        let documents = documents().await?;
        documents
            .create(doc(json!({"knowledgeBaseId": "kb1", "title": "Rust Guide"})))
            .await?;
        documents
            .create(doc(json!({
                "knowledgeBaseId": "kb1",
                "title": "Notes",
                "content": "about rust lifetimes"
            })))
            .await?;
        documents
            .create(doc(json!({"knowledgeBaseId": "kb2", "title": "Rusty hinges"})))
            .await?;

        assert_eq!(documents.search_documents("RUST", None, 10).await?.len(), 3);
        assert_eq!(
            documents.search_documents("rust", Some("kb1"), 10).await?.len(),
            2
        );
        assert_eq!(documents.delete_by_knowledge_base("kb1").await?, 2);
        Ok(())
    }
}
