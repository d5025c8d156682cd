//! Per-user key/value settings.

use crate::db::StoreAdapter;
use crate::models::{
    collections, Document, FindOneAndUpdateOptions, Query, QueryOptions, SortOrder, Update,
    ValidationError,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

const MAX_KEY_LEN: usize = 128;

struct SettingPolicy;

impl RecordPolicy for SettingPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["userId", "key"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(key) = data.get("key").and_then(Value::as_str) {
            if key.len() > MAX_KEY_LEN || key.chars().any(char::is_whitespace) {
                return Err(ValidationError::invalid(
                    "key",
                    format!("must be at most {} characters without spaces", MAX_KEY_LEN),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SettingsRepository {
    repo: Repository,
}

impl Deref for SettingsRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

fn setting_query(user_id: &str, key: &str) -> Query {
    Query::new().eq("userId", user_id).eq("key", key)
}

impl SettingsRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::SETTINGS, store).with_policy(SettingPolicy),
        }
    }

    /// Stored value, `None` when the setting was never written
    pub async fn get(&self, user_id: &str, key: &str) -> RepositoryResult<Option<Value>> {
        let found = self
            .find_one(&setting_query(user_id, key), &QueryOptions::new())
            .await?;
        Ok(found.and_then(|mut doc| doc.remove("value")))
    }

    /// Insert or overwrite one setting
    pub async fn set(
        &self,
        user_id: &str,
        key: &str,
        value: impl Into<Value>,
    ) -> RepositoryResult<Option<Document>> {
        self.find_one_and_update(
            &setting_query(user_id, key),
            &Update::new().set("value", value),
            FindOneAndUpdateOptions { upsert: true },
        )
        .await
    }

    /// Every setting of a user as one `key → value` map
    pub async fn get_all(&self, user_id: &str) -> RepositoryResult<Document> {
        let rows = self
            .find_many(
                &Query::new().eq("userId", user_id),
                &QueryOptions::new().sort_by("key", SortOrder::Asc),
            )
            .await?;

        let mut settings = Document::new();
        for mut row in rows {
            if let Some(Value::String(key)) = row.remove("key") {
                settings.insert(key, row.remove("value").unwrap_or(Value::Null));
            }
        }
        Ok(settings)
    }

    pub async fn delete(&self, user_id: &str, key: &str) -> RepositoryResult<bool> {
        Ok(self.delete_many(&setting_query(user_id, key)).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore, SurrealConfig, SurrealStore};
    use serde_json::json;

    async fn exercise(settings: SettingsRepository) -> anyhow::Result<()> {
        assert!(settings.get("u1", "theme").await?.is_none());

        settings.set("u1", "theme", "dark").await?;
        settings.set("u1", "theme", "light").await?;
        settings
            .set("u1", "editor", json!({"tabSize": 4}))
            .await?;
        settings.set("u2", "theme", "dark").await?;

        assert_eq!(settings.get("u1", "theme").await?, Some(json!("light")));
        let all = settings.get_all("u1").await?;
        assert_eq!(all.len(), 2);
        assert_eq!(all["editor"]["tabSize"], json!(4));

        assert!(settings.delete("u1", "theme").await?);
        assert!(!settings.delete("u1", "theme").await?);
        assert!(settings.set("u1", "bad key", 1).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_settings_upsert_relational() -> anyhow::Result<()> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        exercise(SettingsRepository::new(Arc::new(store))).await
    }

    #[tokio::test]
    async fn test_settings_upsert_document() -> anyhow::Result<()> {
        let store = SurrealStore::new(SurrealConfig::memory());
        store.connect().await?;
        exercise(SettingsRepository::new(Arc::new(store))).await
    }
}
