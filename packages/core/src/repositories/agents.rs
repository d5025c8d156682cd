//! Agent definitions.

use crate::db::StoreAdapter;
use crate::models::{
    collections, Document, Filter, Query, QueryOptions, SortOrder, Update, ValidationError,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

struct AgentPolicy;

impl RecordPolicy for AgentPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(tools) = data.get("tools") {
            let names_only = match tools {
                Value::Null => true,
                Value::Array(items) => items.iter().all(Value::is_string),
                _ => false,
            };
            if !names_only {
                return Err(ValidationError::invalid("tools", "must be a list of tool names"));
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
pub struct AgentRepository {
    repo: Repository,
}

impl Deref for AgentRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl AgentRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::AGENTS, store).with_policy(AgentPolicy),
        }
    }

    pub async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Document>> {
        self.find_one(&Query::new().eq("name", name.trim()), &QueryOptions::new())
            .await
    }

    pub async fn find_active(&self) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().filter("isActive", Filter::Ne(Value::Bool(false))),
            &QueryOptions::new().sort_by("name", SortOrder::Asc),
        )
        .await
    }

    pub async fn find_by_user(&self, user_id: &str) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().eq("userId", user_id),
            &QueryOptions::new().sort_by("name", SortOrder::Asc),
        )
        .await
    }

    pub async fn set_active(&self, id: &str, active: bool) -> RepositoryResult<Option<Document>> {
        self.update_by_id(id, &Update::new().set("isActive", active))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use crate::models::{doc, document_id};
    use serde_json::json;

    #[tokio::test]
    async fn test_agents_by_name_and_activity() -> anyhow::Result<()> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        let agents = AgentRepository::new(Arc::new(store));

        let writer = agents
            .create(doc(json!({"name": " writer ", "userId": "u1", "tools": ["search"]})))
            .await?;
        agents.create(doc(json!({"name": "coder"}))).await?;

        let found = agents.find_by_name("writer").await?.expect("found");
        assert_eq!(found["tools"], json!(["search"]));
        assert_eq!(agents.find_by_user("u1").await?.len(), 1);

        agents
            .set_active(&document_id(&writer).expect("id"), false)
            .await?;
        let active = agents.find_active().await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["name"], json!("coder"));

        assert!(agents
            .create(doc(json!({"name": "bad", "tools": [1, 2]})))
            .await
            .is_err());
        Ok(())
    }
}
