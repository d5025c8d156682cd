//! Uploaded file metadata. File bytes live in external storage at `storagePath`.

use crate::db::StoreAdapter;
use crate::models::{
    collections, Accumulator, AggregateSpec, Document, PageRequest, Paginated, Query,
    QueryOptions, SortOrder, ValidationError,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

struct FilePolicy;

impl RecordPolicy for FilePolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["userId", "filename", "storagePath"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(size) = data.get("size") {
            if size.as_u64().is_none() {
                return Err(ValidationError::invalid("size", "must be a non-negative integer"));
            }
        }
        if let Some(filename) = data.get("filename").and_then(Value::as_str) {
            if filename.contains('/') || filename.contains('\\') {
                return Err(ValidationError::invalid(
                    "filename",
                    "must not contain path separators",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct FileRepository {
    repo: Repository,
}

impl Deref for FileRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl FileRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::FILES, store).with_policy(FilePolicy),
        }
    }

    pub async fn find_by_user(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> RepositoryResult<Paginated<Document>> {
        let mut page = page.clone();
        if page.sort.is_empty() {
            page = page.sort_by("createdAt", SortOrder::Desc);
        }
        self.paginate(&Query::new().eq("userId", user_id), &page)
            .await
    }

    /// Existing upload with the same content, for de-duplication
    pub async fn find_by_checksum(
        &self,
        user_id: &str,
        checksum: &str,
    ) -> RepositoryResult<Option<Document>> {
        self.find_one(
            &Query::new().eq("userId", user_id).eq("checksum", checksum),
            &QueryOptions::new(),
        )
        .await
    }

    /// Bytes stored by one user
    pub async fn total_size_for_user(&self, user_id: &str) -> RepositoryResult<u64> {
        let spec = AggregateSpec::new(Query::new().eq("userId", user_id))
            .accumulate("bytes", Accumulator::Sum("size".to_string()));
        let rows = self.aggregate(&spec).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("bytes"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SurrealConfig, SurrealStore};
    use crate::models::doc;
    use serde_json::json;

    #[tokio::test]
    async fn test_quota_and_dedup_lookups() -> anyhow::Result<()> {
        let store = SurrealStore::new(SurrealConfig::memory());
        store.connect().await?;
        let files = FileRepository::new(Arc::new(store));

        files
            .create(doc(json!({
                "userId": "u1",
                "filename": "a.pdf",
                "storagePath": "blobs/a",
                "size": 1000,
                "checksum": "abc"
            })))
            .await?;
        files
            .create(doc(json!({
                "userId": "u1",
                "filename": "b.png",
                "storagePath": "blobs/b",
                "size": 24
            })))
            .await?;

        assert_eq!(files.total_size_for_user("u1").await?, 1024);
        assert_eq!(files.total_size_for_user("u2").await?, 0);
        assert!(files.find_by_checksum("u1", "abc").await?.is_some());
        assert!(files.find_by_checksum("u2", "abc").await?.is_none());
        assert_eq!(
            files.find_by_user("u1", &PageRequest::default()).await?.pagination.total,
            2
        );

        assert!(files
            .create(doc(json!({"userId": "u1", "filename": "../x", "storagePath": "p"})))
            .await
            .is_err());
        Ok(())
    }
}
