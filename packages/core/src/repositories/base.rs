//! Repository base
//!
//! A [`Repository`] is a typed CRUD facade over one collection. Every write
//! passes through the same pipeline before reaching the adapter:
//!
//! 1. `validate_data` - required fields, then the collection's domain rules
//! 2. `transform_data_for_save` - normalization, timestamps, search marker
//! 3. adapter call
//! 4. `transform_data_after_load` on whatever comes back
//!
//! Collection-specific behavior lives in a [`RecordPolicy`]. Search-integrated
//! collections also mirror successful writes into the [`SearchIndexer`].

use crate::db::{StoreAdapter, Transaction};
use crate::models::{
    document_id, now_timestamp, AggregateSpec, Document, FindOneAndUpdateOptions, PageRequest,
    Paginated, PaginationInfo, Query, QueryOptions, Update, ValidationError, CREATED_AT_FIELD,
    ID_FIELD, INDEXED_AT_FIELD, INDEXED_FIELD, UPDATED_AT_FIELD,
};
use crate::repositories::error::{RepositoryError, RepositoryResult};
use crate::search::{
    index_settings, IndexOutcome, IndexStats, SearchIndexer, SearchOptions, SyncReport,
};
use serde_json::Value;
use std::sync::Arc;

/// Which write a record is being prepared for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Create,
    Update,
}

/// Collection-specific rules plugged into a [`Repository`]
pub trait RecordPolicy: Send + Sync {
    /// Fields that must be present, non-null and non-empty on create
    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Domain validation beyond required fields
    fn validate(&self, _data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Canonicalize values before they are stored
    fn normalize(&self, _data: &mut Document) {}

    fn after_load(&self, doc: Document) -> Document {
        doc
    }

    /// Fields mirrored into the search index; empty means not search-integrated
    fn search_fields(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Policy with no extra rules
pub struct DefaultPolicy;

impl RecordPolicy for DefaultPolicy {}

/// Result of [`Repository::find_or_create`]
#[derive(Debug, Clone, PartialEq)]
pub struct FindOrCreate {
    pub record: Document,
    pub created: bool,
}

#[derive(Clone)]
pub struct Repository {
    collection: &'static str,
    store: Arc<dyn StoreAdapter>,
    policy: Arc<dyn RecordPolicy>,
    indexer: Option<SearchIndexer>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("collection", &self.collection)
            .field("backend", &self.store.backend())
            .field("search", &self.indexer.is_some())
            .finish()
    }
}

impl Repository {
    pub fn new(collection: &'static str, store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            collection,
            store,
            policy: Arc::new(DefaultPolicy),
            indexer: None,
        }
    }

    pub fn with_policy(mut self, policy: impl RecordPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Mirror writes into `indexer`; ignored for collections without search fields
    pub fn with_indexer(mut self, indexer: SearchIndexer) -> Self {
        if !self.policy.search_fields().is_empty() {
            self.indexer = Some(indexer);
        }
        self
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    pub fn indexer(&self) -> Option<&SearchIndexer> {
        self.indexer.as_ref()
    }

    pub fn is_search_integrated(&self) -> bool {
        !self.policy.search_fields().is_empty()
    }

    /// Fields whose change leaves the mirrored search document stale
    ///
    /// Searchable fields plus the index's filter attributes; empty for
    /// collections outside the search engine.
    fn reindex_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        let search_fields = self.policy.search_fields();
        let filterable = match search_fields {
            [] => &[][..],
            _ => index_settings(self.collection)
                .map(|settings| settings.filterable_attributes)
                .unwrap_or(&[]),
        };
        search_fields.iter().chain(filterable).copied()
    }

    fn fail(&self, operation: &str, err: impl Into<RepositoryError>) -> RepositoryError {
        let err = err.into();
        tracing::error!(
            collection = self.collection,
            operation,
            error = %err,
            "repository operation failed"
        );
        err
    }

    //
    // PIPELINE
    //

    /// Check required fields and domain rules
    ///
    /// On create every required field must be present, non-null and
    /// non-empty. On update only fields being written are checked.
    pub fn validate_data(&self, data: &Document, op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(id) = data.get(ID_FIELD) {
            let valid = match id {
                Value::String(s) => !s.trim().is_empty(),
                Value::Number(_) => true,
                _ => false,
            };
            if !valid {
                return Err(ValidationError::InvalidId(id.to_string()));
            }
        }

        for field in self.policy.required_fields() {
            match (data.get(*field), op) {
                (None, WriteOperation::Create) => return Err(ValidationError::missing(*field)),
                (None, WriteOperation::Update) => {}
                (Some(value), _) if is_blank(value) => {
                    return Err(match op {
                        WriteOperation::Create => ValidationError::missing(*field),
                        WriteOperation::Update => {
                            ValidationError::invalid(*field, "required field cannot be cleared")
                        }
                    })
                }
                _ => {}
            }
        }

        self.policy.validate(data, op)
    }

    /// Normalize, stamp timestamps and clear the search marker when needed
    pub fn transform_data_for_save(&self, mut data: Document, op: WriteOperation) -> Document {
        self.policy.normalize(&mut data);
        let now = now_timestamp();
        if op == WriteOperation::Create {
            data.entry(CREATED_AT_FIELD.to_string())
                .or_insert_with(|| Value::String(now.clone()));
        }
        data.insert(UPDATED_AT_FIELD.to_string(), Value::String(now));

        let touches_search = op == WriteOperation::Create
            || self.reindex_fields().any(|f| data.contains_key(f));
        if self.is_search_integrated() && touches_search {
            data.insert(INDEXED_FIELD.to_string(), Value::Bool(false));
            data.insert(INDEXED_AT_FIELD.to_string(), Value::Null);
        }
        data
    }

    pub fn transform_data_after_load(&self, doc: Document) -> Document {
        self.policy.after_load(doc)
    }

    /// Validate and transform an update's `$set` part
    fn prepare_update(&self, update: &Update) -> Result<Update, ValidationError> {
        for field in &update.unset {
            if self.policy.required_fields().contains(&field.as_str()) {
                return Err(ValidationError::invalid(
                    field.clone(),
                    "required field cannot be removed",
                ));
            }
        }
        self.validate_data(&update.set, WriteOperation::Update)?;

        let mut prepared = update.clone();
        prepared.set = self.transform_data_for_save(update.set.clone(), WriteOperation::Update);
        let touches_search = update
            .touched_fields()
            .any(|touched| self.reindex_fields().any(|f| f == touched));
        if self.is_search_integrated() && touches_search {
            prepared.set.insert(INDEXED_FIELD.to_string(), Value::Bool(false));
            prepared.set.insert(INDEXED_AT_FIELD.to_string(), Value::Null);
        }
        Ok(prepared)
    }

    fn loaded(&self, docs: Vec<Document>) -> Vec<Document> {
        docs.into_iter().map(|d| self.transform_data_after_load(d)).collect()
    }

    async fn mirror_index(&self, doc: &Document) {
        if let Some(indexer) = &self.indexer {
            if let IndexOutcome::Failed(reason) = indexer.index_document(self.collection, doc).await
            {
                tracing::debug!(
                    collection = self.collection,
                    reason,
                    "write kept, search index will catch up on next sync"
                );
            }
        }
    }

    //
    // READS
    //

    pub async fn find_by_id(&self, id: &str) -> RepositoryResult<Option<Document>> {
        let found = self
            .store
            .find_by_id(self.collection, id)
            .await
            .map_err(|e| self.fail("find_by_id", e))?;
        Ok(found.map(|d| self.transform_data_after_load(d)))
    }

    /// Like `find_by_id`, but a missing record is `RepositoryError::NotFound`
    pub async fn get(&self, id: &str) -> RepositoryResult<Document> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| RepositoryError::not_found(self.collection, id))
    }

    pub async fn find_one(
        &self,
        query: &Query,
        options: &QueryOptions,
    ) -> RepositoryResult<Option<Document>> {
        let found = self
            .store
            .find_one(self.collection, query, options)
            .await
            .map_err(|e| self.fail("find_one", e))?;
        Ok(found.map(|d| self.transform_data_after_load(d)))
    }

    pub async fn find_many(
        &self,
        query: &Query,
        options: &QueryOptions,
    ) -> RepositoryResult<Vec<Document>> {
        let docs = self
            .store
            .find_many(self.collection, query, options)
            .await
            .map_err(|e| self.fail("find_many", e))?;
        Ok(self.loaded(docs))
    }

    pub async fn count(&self, query: &Query) -> RepositoryResult<u64> {
        self.store
            .count(self.collection, query)
            .await
            .map_err(|e| self.fail("count", e))
    }

    pub async fn exists(&self, query: &Query) -> RepositoryResult<bool> {
        let options = QueryOptions::new().project([ID_FIELD]).limit(1);
        Ok(self.find_one(query, &options).await?.is_some())
    }

    pub async fn aggregate(&self, spec: &AggregateSpec) -> RepositoryResult<Vec<Document>> {
        self.store
            .aggregate(self.collection, spec)
            .await
            .map_err(|e| self.fail("aggregate", e))
    }

    /// One page of matches plus totals
    ///
    /// The page and the total come from separate queries, so a concurrent
    /// write can make them disagree slightly.
    pub async fn paginate(
        &self,
        query: &Query,
        page: &PageRequest,
    ) -> RepositoryResult<Paginated<Document>> {
        let (page_number, limit) = page.normalized();
        let mut options = QueryOptions::new()
            .limit(limit)
            .offset((page_number - 1) * limit);
        options.sort = page.sort.clone();

        let data = self.find_many(query, &options).await?;
        let total = self.count(query).await?;
        Ok(Paginated {
            data,
            pagination: PaginationInfo::new(page_number, limit, total),
        })
    }

    //
    // WRITES
    //

    pub async fn create(&self, data: Document) -> RepositoryResult<Document> {
        self.validate_data(&data, WriteOperation::Create)
            .map_err(|e| self.fail("create", e))?;
        let data = self.transform_data_for_save(data, WriteOperation::Create);
        let created = self
            .store
            .create(self.collection, data)
            .await
            .map_err(|e| self.fail("create", e))?;
        self.mirror_index(&created).await;
        Ok(self.transform_data_after_load(created))
    }

    pub async fn create_many(&self, data: Vec<Document>) -> RepositoryResult<Vec<Document>> {
        let mut prepared = Vec::with_capacity(data.len());
        for item in data {
            self.validate_data(&item, WriteOperation::Create)
                .map_err(|e| self.fail("create_many", e))?;
            prepared.push(self.transform_data_for_save(item, WriteOperation::Create));
        }
        let created = self
            .store
            .create_many(self.collection, prepared)
            .await
            .map_err(|e| self.fail("create_many", e))?;
        if let Some(indexer) = &self.indexer {
            indexer.index_documents(self.collection, &created).await;
        }
        Ok(self.loaded(created))
    }

    pub async fn update_by_id(
        &self,
        id: &str,
        update: &Update,
    ) -> RepositoryResult<Option<Document>> {
        let prepared = self
            .prepare_update(update)
            .map_err(|e| self.fail("update_by_id", e))?;
        let updated = self
            .store
            .update_by_id(self.collection, id, &prepared)
            .await
            .map_err(|e| self.fail("update_by_id", e))?;
        if let Some(doc) = &updated {
            if prepared.set.get(INDEXED_FIELD) == Some(&Value::Bool(false)) {
                self.mirror_index(doc).await;
            }
        }
        Ok(updated.map(|d| self.transform_data_after_load(d)))
    }

    /// Update matches in bulk; search markers are cleared for the next sync
    pub async fn update_many(&self, query: &Query, update: &Update) -> RepositoryResult<u64> {
        let prepared = self
            .prepare_update(update)
            .map_err(|e| self.fail("update_many", e))?;
        self.store
            .update_many(self.collection, query, &prepared)
            .await
            .map_err(|e| self.fail("update_many", e))
    }

    pub async fn delete_by_id(&self, id: &str) -> RepositoryResult<bool> {
        let deleted = self
            .store
            .delete_by_id(self.collection, id)
            .await
            .map_err(|e| self.fail("delete_by_id", e))?;
        if deleted {
            if let Some(indexer) = &self.indexer {
                indexer.delete_document(self.collection, id).await;
            }
        }
        Ok(deleted)
    }

    pub async fn delete_many(&self, query: &Query) -> RepositoryResult<u64> {
        let ids = if self.indexer.is_some() {
            self.find_many(query, &QueryOptions::new().project([ID_FIELD]))
                .await?
                .iter()
                .filter_map(document_id)
                .collect()
        } else {
            Vec::new()
        };

        let deleted = self
            .store
            .delete_many(self.collection, query)
            .await
            .map_err(|e| self.fail("delete_many", e))?;

        if let Some(indexer) = &self.indexer {
            for id in &ids {
                indexer.delete_document(self.collection, id).await;
            }
        }
        Ok(deleted)
    }

    /// Return the first match, or create one from the query's equality fields plus `data`
    ///
    /// A create that loses a uniqueness race re-reads once and returns the winner.
    pub async fn find_or_create(
        &self,
        query: &Query,
        data: Document,
    ) -> RepositoryResult<FindOrCreate> {
        if let Some(record) = self.find_one(query, &QueryOptions::new()).await? {
            return Ok(FindOrCreate {
                record,
                created: false,
            });
        }

        let mut seed = query.equality_fields();
        seed.extend(data);
        match self.create(seed).await {
            Ok(record) => Ok(FindOrCreate {
                record,
                created: true,
            }),
            Err(err) if err.is_conflict() => {
                match self.find_one(query, &QueryOptions::new()).await? {
                    Some(record) => Ok(FindOrCreate {
                        record,
                        created: false,
                    }),
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn find_one_and_update(
        &self,
        query: &Query,
        update: &Update,
        options: FindOneAndUpdateOptions,
    ) -> RepositoryResult<Option<Document>> {
        let mut prepared = self
            .prepare_update(update)
            .map_err(|e| self.fail("find_one_and_update", e))?;

        if options.upsert {
            // An upsert may create: check and stamp as a create would
            let mut seed = query.equality_fields();
            update.apply_to(&mut seed);
            if !self.exists(query).await? {
                self.validate_data(&seed, WriteOperation::Create)
                    .map_err(|e| self.fail("find_one_and_update", e))?;
                prepared
                    .set
                    .entry(CREATED_AT_FIELD.to_string())
                    .or_insert_with(|| Value::String(now_timestamp()));
            }
        }

        let updated = self
            .store
            .find_one_and_update(self.collection, query, &prepared, options)
            .await
            .map_err(|e| self.fail("find_one_and_update", e))?;
        Ok(updated.map(|d| self.transform_data_after_load(d)))
    }

    //
    // TRANSACTIONAL WRITES
    //
    // Same pipeline, routed through an open transaction. Search mirroring is
    // left to the next sync since the transaction may still roll back.
    //

    pub async fn create_in(&self, tx: &mut Transaction, data: Document) -> RepositoryResult<Document> {
        self.validate_data(&data, WriteOperation::Create)
            .map_err(|e| self.fail("create", e))?;
        let data = self.transform_data_for_save(data, WriteOperation::Create);
        let created = tx
            .create(self.collection, data)
            .await
            .map_err(|e| self.fail("create", e))?;
        Ok(self.transform_data_after_load(created))
    }

    pub async fn find_by_id_in(
        &self,
        tx: &mut Transaction,
        id: &str,
    ) -> RepositoryResult<Option<Document>> {
        let found = tx
            .find_by_id(self.collection, id)
            .await
            .map_err(|e| self.fail("find_by_id", e))?;
        Ok(found.map(|d| self.transform_data_after_load(d)))
    }

    pub async fn update_by_id_in(
        &self,
        tx: &mut Transaction,
        id: &str,
        update: &Update,
    ) -> RepositoryResult<Option<Document>> {
        let prepared = self
            .prepare_update(update)
            .map_err(|e| self.fail("update_by_id", e))?;
        let updated = tx
            .update_by_id(self.collection, id, &prepared)
            .await
            .map_err(|e| self.fail("update_by_id", e))?;
        Ok(updated.map(|d| self.transform_data_after_load(d)))
    }

    pub async fn delete_by_id_in(&self, tx: &mut Transaction, id: &str) -> RepositoryResult<bool> {
        tx.delete_by_id(self.collection, id)
            .await
            .map_err(|e| self.fail("delete_by_id", e))
    }

    //
    // SEARCH
    //

    /// Engine search, `None` when the engine cannot answer
    pub async fn search_index(&self, text: &str, options: &SearchOptions) -> Option<Vec<Document>> {
        let found = self
            .indexer
            .as_ref()?
            .search(self.collection, text, options)
            .await?;
        Some(self.loaded(found))
    }

    /// Index every document still lacking the search marker
    pub async fn sync_search_index(&self, batch_size: u64) -> Option<SyncReport> {
        let indexer = self.indexer.as_ref()?;
        Some(indexer.sync_collection(self.collection, batch_size).await)
    }

    pub async fn search_stats(&self) -> Option<IndexStats> {
        self.indexer.as_ref()?.stats(self.collection).await
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Quote a value for an engine filter expression (`field = "value"`)
pub(crate) fn filter_eq(field: &str, value: &str) -> String {
    format!(
        "{} = \"{}\"",
        field,
        value.replace('\\', "\\\\").replace('"', "\\\"")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use crate::models::{doc, SortOrder};
    use serde_json::json;

    struct TitledPolicy;

    impl RecordPolicy for TitledPolicy {
        fn required_fields(&self) -> &'static [&'static str] {
            &["title", "knowledgeBaseId"]
        }

        fn normalize(&self, data: &mut Document) {
            if let Some(Value::String(title)) = data.get_mut("title") {
                *title = title.trim().to_string();
            }
        }

        fn search_fields(&self) -> &'static [&'static str] {
            &["title", "content"]
        }
    }

    async fn repo() -> anyhow::Result<Repository> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        Ok(Repository::new("documents", Arc::new(store)).with_policy(TitledPolicy))
    }

    #[tokio::test]
    async fn test_validate_data_on_create_and_update() -> anyhow::Result<()> {
        let repo = repo().await?;

        let missing = repo.validate_data(&doc(json!({"title": "a"})), WriteOperation::Create);
        assert_eq!(missing, Err(ValidationError::missing("knowledgeBaseId")));

        let blank = repo.validate_data(
            &doc(json!({"title": "  ", "knowledgeBaseId": "1"})),
            WriteOperation::Create,
        );
        assert_eq!(blank, Err(ValidationError::missing("title")));

        // Updates only check what they write
        assert!(repo
            .validate_data(&doc(json!({"content": "x"})), WriteOperation::Update)
            .is_ok());
        assert!(repo
            .validate_data(&doc(json!({"title": null})), WriteOperation::Update)
            .is_err());
        assert!(matches!(
            repo.validate_data(&doc(json!({"_id": ""})), WriteOperation::Update),
            Err(ValidationError::InvalidId(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_transform_for_save_stamps_and_clears_marker() -> anyhow::Result<()> {
        let repo = repo().await?;
        let created = repo.transform_data_for_save(
            doc(json!({"title": "  Hi  ", "knowledgeBaseId": "1"})),
            WriteOperation::Create,
        );
        assert_eq!(created["title"], json!("Hi"));
        assert!(created.contains_key(CREATED_AT_FIELD));
        assert!(created.contains_key(UPDATED_AT_FIELD));
        assert_eq!(created[INDEXED_FIELD], json!(false));

        let metadata_only = repo.transform_data_for_save(
            doc(json!({"metadata": {"pages": 3}})),
            WriteOperation::Update,
        );
        assert!(!metadata_only.contains_key(INDEXED_FIELD));
        assert!(!metadata_only.contains_key(CREATED_AT_FIELD));

        // Filter attributes of the index count as search fields
        let status_only =
            repo.transform_data_for_save(doc(json!({"status": "ready"})), WriteOperation::Update);
        assert_eq!(status_only[INDEXED_FIELD], json!(false));
        Ok(())
    }

    #[tokio::test]
    async fn test_paginate_pages_are_disjoint() -> anyhow::Result<()> {
        let repo = repo().await?;
        for i in 0..25 {
            repo.create(doc(json!({
                "title": format!("doc {i:02}"),
                "knowledgeBaseId": "kb"
            })))
            .await?;
        }

        let request = PageRequest::new(1, 10).sort_by("title", SortOrder::Asc);
        let first = repo.paginate(&Query::new(), &request).await?;
        let second = repo
            .paginate(&Query::new(), &PageRequest { page: 2, ..request.clone() })
            .await?;
        let third = repo
            .paginate(&Query::new(), &PageRequest { page: 3, ..request })
            .await?;

        let first_ids: Vec<_> = first.data.iter().filter_map(document_id).collect();
        let second_ids: Vec<_> = second.data.iter().filter_map(document_id).collect();
        assert_eq!(first_ids.len(), 10);
        assert!(first_ids.iter().all(|id| !second_ids.contains(id)));

        assert_eq!(first.pagination.total, 25);
        assert_eq!(first.pagination.pages, 3);
        assert!(first.pagination.has_next && !first.pagination.has_prev);
        assert!(second.pagination.has_next && second.pagination.has_prev);
        assert_eq!(third.data.len(), 5);
        assert!(!third.pagination.has_next);
        Ok(())
    }

    #[tokio::test]
    async fn test_find_or_create_reports_creation_once() -> anyhow::Result<()> {
        let repo = repo().await?;
        let query = Query::new().eq("title", "Guide").eq("knowledgeBaseId", "kb");

        let first = repo.find_or_create(&query, doc(json!({"content": "v1"}))).await?;
        assert!(first.created);
        let second = repo.find_or_create(&query, doc(json!({"content": "v2"}))).await?;
        assert!(!second.created);
        assert_eq!(document_id(&first.record), document_id(&second.record));
        assert_eq!(second.record["content"], json!("v1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_rejects_removing_required_field() -> anyhow::Result<()> {
        let repo = repo().await?;
        let created = repo
            .create(doc(json!({"title": "t", "knowledgeBaseId": "kb"})))
            .await?;
        let id = document_id(&created).expect("id");

        let err = repo
            .update_by_id(&id, &Update::new().unset("title"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)));

        let updated = repo
            .update_by_id(&id, &Update::new().set("content", "body"))
            .await?
            .expect("exists");
        assert_eq!(updated[INDEXED_FIELD], json!(false));
        assert!(!repo.delete_by_id("missing").await?);
        Ok(())
    }

    #[test]
    fn test_filter_eq_escapes_quotes() {
        assert_eq!(filter_eq("userId", r#"a"b"#), r#"userId = "a\"b""#);
    }
}
