//! Tool registry.

use crate::db::StoreAdapter;
use crate::models::{
    collections, Document, Filter, Query, QueryOptions, SortOrder, Update, ValidationError,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

struct ToolPolicy;

impl RecordPolicy for ToolPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(name) = data.get("name").and_then(Value::as_str) {
            let valid = name
                .trim()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                return Err(ValidationError::invalid(
                    "name",
                    "only letters, digits, '_' and '-' are allowed",
                ));
            }
        }
        if let Some(parameters) = data.get("parameters") {
            if !(parameters.is_object() || parameters.is_null()) {
                return Err(ValidationError::invalid("parameters", "must be a JSON object"));
            }
        }
        Ok(())
    }

    fn normalize(&self, data: &mut Document) {
        if let Some(Value::String(name)) = data.get_mut("name") {
            *name = name.trim().to_string();
        }
    }
}

#[derive(Clone, Debug)]
pub struct ToolRepository {
    repo: Repository,
}

impl Deref for ToolRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl ToolRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::TOOLS, store).with_policy(ToolPolicy),
        }
    }

    pub async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Document>> {
        self.find_one(&Query::new().eq("name", name.trim()), &QueryOptions::new())
            .await
    }

    pub async fn find_enabled(&self) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().filter("isEnabled", Filter::Ne(Value::Bool(false))),
            &QueryOptions::new().sort_by("name", SortOrder::Asc),
        )
        .await
    }

    pub async fn find_by_category(&self, category: &str) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().eq("category", category),
            &QueryOptions::new().sort_by("name", SortOrder::Asc),
        )
        .await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> RepositoryResult<Option<Document>> {
        self.update_by_id(id, &Update::new().set("isEnabled", enabled))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SurrealConfig, SurrealStore};
    use crate::models::{doc, document_id};
    use serde_json::json;

    #[tokio::test]
    async fn test_enabled_tools_by_category() -> anyhow::Result<()> {
        let store = SurrealStore::new(SurrealConfig::memory());
        store.connect().await?;
        let tools = ToolRepository::new(Arc::new(store));

        let search = tools
            .create(doc(json!({
                "name": "web_search",
                "category": "web",
                "parameters": {"query": "string"}
            })))
            .await?;
        tools
            .create(doc(json!({"name": "calculator", "category": "math"})))
            .await?;

        assert_eq!(tools.find_by_category("web").await?.len(), 1);
        assert_eq!(tools.find_enabled().await?.len(), 2);

        tools
            .set_enabled(&document_id(&search).expect("id"), false)
            .await?;
        let enabled = tools.find_enabled().await?;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0]["name"], json!("calculator"));

        assert!(tools.create(doc(json!({"name": "two words"}))).await.is_err());
        let duplicate = tools
            .create(doc(json!({"name": "calculator"})))
            .await
            .unwrap_err();
        assert!(duplicate.is_conflict());
        Ok(())
    }
}
