//! Knowledge bases: named document collections owned by a user.

use crate::db::StoreAdapter;
use crate::models::{
    collections, Document, Filter, PageRequest, Paginated, Query, SortOrder, Update,
    ValidationError,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use serde_json::{json, Value};
use std::ops::Deref;
use std::sync::Arc;

const MAX_NAME_LEN: usize = 200;

struct KnowledgeBasePolicy;

impl RecordPolicy for KnowledgeBasePolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["userId", "name"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(name) = data.get("name").and_then(Value::as_str) {
            if name.chars().count() > MAX_NAME_LEN {
                return Err(ValidationError::invalid(
                    "name",
                    format!("longer than {} characters", MAX_NAME_LEN),
                ));
            }
        }
        Ok(())
    }

    fn normalize(&self, data: &mut Document) {
        if let Some(Value::String(name)) = data.get_mut("name") {
            *name = name.trim().to_string();
        }
    }

    fn after_load(&self, mut doc: Document) -> Document {
        doc.entry("documentCount").or_insert_with(|| json!(0));
        doc.entry("isPublic").or_insert(Value::Bool(false));
        doc
    }
}

#[derive(Clone, Debug)]
pub struct KnowledgeBaseRepository {
    repo: Repository,
}

impl Deref for KnowledgeBaseRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl KnowledgeBaseRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::KNOWLEDGE_BASES, store)
                .with_policy(KnowledgeBasePolicy),
        }
    }

    pub async fn find_by_user(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> RepositoryResult<Paginated<Document>> {
        let mut page = page.clone();
        if page.sort.is_empty() {
            page = page.sort_by("updatedAt", SortOrder::Desc);
        }
        self.paginate(&Query::new().eq("userId", user_id), &page)
            .await
    }

    pub async fn find_public(&self, page: &PageRequest) -> RepositoryResult<Paginated<Document>> {
        self.paginate(&Query::new().eq("isPublic", true), page).await
    }

    /// Knowledge bases a user can read: their own plus public ones
    pub async fn find_accessible(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> RepositoryResult<Paginated<Document>> {
        let query = Query::new().or(vec![
            Query::new().eq("userId", user_id),
            Query::new().eq("isPublic", true),
        ]);
        self.paginate(&query, page).await
    }

    /// Shift the cached document count by `delta`
    pub async fn adjust_document_count(
        &self,
        id: &str,
        delta: i64,
    ) -> RepositoryResult<Option<Document>> {
        self.update_by_id(id, &Update::new().inc("documentCount", delta))
            .await
    }

    pub async fn name_taken(&self, user_id: &str, name: &str) -> RepositoryResult<bool> {
        let query = Query::new()
            .eq("userId", user_id)
            .filter("name", Filter::Eq(Value::String(name.trim().to_string())));
        self.exists(&query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use crate::models::{doc, document_id};

    async fn knowledge_bases() -> anyhow::Result<KnowledgeBaseRepository> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        Ok(KnowledgeBaseRepository::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_accessible_includes_public() -> anyhow::Result<()> {
        let kbs = knowledge_bases().await?;
        kbs.create(doc(json!({"userId": "u1", "name": "Mine"}))).await?;
        kbs.create(doc(json!({"userId": "u2", "name": "Shared", "isPublic": true})))
            .await?;
        kbs.create(doc(json!({"userId": "u2", "name": "Private"}))).await?;

        let own = kbs.find_by_user("u1", &PageRequest::default()).await?;
        assert_eq!(own.pagination.total, 1);
        let public = kbs.find_public(&PageRequest::default()).await?;
        assert_eq!(public.pagination.total, 1);
        let accessible = kbs.find_accessible("u1", &PageRequest::default()).await?;
        assert_eq!(accessible.pagination.total, 2);
        assert!(kbs.name_taken("u1", " Mine ").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_document_count_adjustment() -> anyhow::Result<()> {
        let kbs = knowledge_bases().await?;
        let kb = kbs.create(doc(json!({"userId": "u1", "name": "Docs"}))).await?;
        let id = document_id(&kb).expect("id");

        kbs.adjust_document_count(&id, 3).await?;
        let after = kbs.adjust_document_count(&id, -1).await?.expect("exists");
        assert_eq!(after["documentCount"], json!(2));
        Ok(())
    }
}
