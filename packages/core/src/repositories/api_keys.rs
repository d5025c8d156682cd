//! API keys.
//!
//! Only a prefix and a hash of each key are stored. Hashing happens in the
//! caller; lookups go by the public prefix and the caller compares hashes.

use crate::db::StoreAdapter;
use crate::models::{
    collections, now_timestamp, Document, Filter, Query, QueryOptions, SortOrder, Update,
    ValidationError,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

const MIN_PREFIX_LEN: usize = 6;

struct ApiKeyPolicy;

impl RecordPolicy for ApiKeyPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["userId", "name", "keyPrefix", "keyHash"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(prefix) = data.get("keyPrefix").and_then(Value::as_str) {
            if prefix.len() < MIN_PREFIX_LEN {
                return Err(ValidationError::invalid(
                    "keyPrefix",
                    format!("must be at least {} characters", MIN_PREFIX_LEN),
                ));
            }
        }
        if let Some(scopes) = data.get("scopes") {
            let valid = match scopes {
                Value::Null => true,
                Value::Array(items) => items.iter().all(Value::is_string),
                _ => false,
            };
            if !valid {
                return Err(ValidationError::invalid("scopes", "must be a list of strings"));
            }
        }
        Ok(())
    }

    fn after_load(&self, mut doc: Document) -> Document {
        doc.entry("revoked").or_insert(Value::Bool(false));
        doc
    }
}

#[derive(Clone, Debug)]
pub struct ApiKeyRepository {
    repo: Repository,
}

impl Deref for ApiKeyRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl ApiKeyRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::API_KEYS, store).with_policy(ApiKeyPolicy),
        }
    }

    pub async fn find_by_prefix(&self, prefix: &str) -> RepositoryResult<Option<Document>> {
        self.find_one(&Query::new().eq("keyPrefix", prefix), &QueryOptions::new())
            .await
    }

    /// A key usable right now: not revoked and not past `expiresAt`
    pub async fn find_active_by_prefix(&self, prefix: &str) -> RepositoryResult<Option<Document>> {
        let query = Query::new()
            .eq("keyPrefix", prefix)
            .filter("revoked", Filter::Ne(Value::Bool(true)))
            .or(vec![
                Query::new().filter("expiresAt", Filter::Exists(false)),
                Query::new().filter("expiresAt", Filter::Gt(Value::String(now_timestamp()))),
            ]);
        self.find_one(&query, &QueryOptions::new()).await
    }

    pub async fn find_by_user(&self, user_id: &str) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().eq("userId", user_id),
            &QueryOptions::new().sort_by("createdAt", SortOrder::Desc),
        )
        .await
    }

    pub async fn revoke(&self, id: &str) -> RepositoryResult<Option<Document>> {
        self.update_by_id(id, &Update::new().set("revoked", true))
            .await
    }

    /// Record a successful authentication
    pub async fn touch(&self, id: &str) -> RepositoryResult<Option<Document>> {
        self.update_by_id(id, &Update::new().set("lastUsedAt", now_timestamp()))
            .await
    }

    pub async fn revoke_all_for_user(&self, user_id: &str) -> RepositoryResult<u64> {
        self.update_many(
            &Query::new()
                .eq("userId", user_id)
                .filter("revoked", Filter::Ne(Value::Bool(true))),
            &Update::new().set("revoked", true),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use crate::models::{doc, document_id, format_timestamp};
    use serde_json::json;

    async fn api_keys() -> anyhow::Result<ApiKeyRepository> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        Ok(ApiKeyRepository::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_active_lookup_skips_revoked_and_expired() -> anyhow::Result<()> {
        let keys = api_keys().await?;
        let live = keys
            .create(doc(json!({
                "userId": "u1",
                "name": "ci",
                "keyPrefix": "sk_live1",
                "keyHash": "h1",
                "scopes": ["read"]
            })))
            .await?;
        let expired_at = format_timestamp(chrono::Utc::now() - chrono::Duration::hours(1));
        keys.create(doc(json!({
            "userId": "u1",
            "name": "old",
            "keyPrefix": "sk_old01",
            "keyHash": "h2",
            "expiresAt": expired_at
        })))
        .await?;

        assert!(keys.find_active_by_prefix("sk_live1").await?.is_some());
        assert!(keys.find_active_by_prefix("sk_old01").await?.is_none());
        assert!(keys.find_by_prefix("sk_old01").await?.is_some());

        let id = document_id(&live).expect("id");
        let touched = keys.touch(&id).await?.expect("exists");
        assert!(touched["lastUsedAt"].is_string());
        keys.revoke(&id).await?;
        assert!(keys.find_active_by_prefix("sk_live1").await?.is_none());
        assert_eq!(keys.find_by_user("u1").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_short_prefix_is_rejected() -> anyhow::Result<()> {
        let keys = api_keys().await?;
        let result = keys
            .create(doc(json!({"userId": "u1", "name": "x", "keyPrefix": "sk", "keyHash": "h"})))
            .await;
        assert!(result.is_err());
        Ok(())
    }
}
