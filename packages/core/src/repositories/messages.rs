//! Chat messages.

use crate::db::StoreAdapter;
use crate::models::{
    collections, Document, Filter, Query, QueryOptions, SortOrder, ValidationError,
};
use crate::repositories::base::{filter_eq, RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use crate::search::{SearchIndexer, SearchOptions};
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

const ROLES: &[&str] = &["system", "user", "assistant", "tool"];

struct MessagePolicy;

impl RecordPolicy for MessagePolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["conversationId", "role", "content"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(role) = data.get("role") {
            if !role.as_str().is_some_and(|r| ROLES.contains(&r)) {
                return Err(ValidationError::invalid(
                    "role",
                    format!("expected one of {}", ROLES.join(", ")),
                ));
            }
        }
        if let Some(count) = data.get("tokenCount") {
            if count.as_u64().is_none() {
                return Err(ValidationError::invalid(
                    "tokenCount",
                    "must be a non-negative integer",
                ));
            }
        }
        Ok(())
    }

    fn search_fields(&self) -> &'static [&'static str] {
        &["content"]
    }
}

#[derive(Clone, Debug)]
pub struct MessageRepository {
    repo: Repository,
}

impl Deref for MessageRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl MessageRepository {
    pub fn new(store: Arc<dyn StoreAdapter>, indexer: SearchIndexer) -> Self {
        Self {
            repo: Repository::new(collections::MESSAGES, store)
                .with_policy(MessagePolicy)
                .with_indexer(indexer),
        }
    }

    /// Messages of a conversation in chronological order
    pub async fn find_by_conversation(
        &self,
        conversation_id: &str,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> RepositoryResult<Vec<Document>> {
        let mut options = QueryOptions::new().sort_by("createdAt", SortOrder::Asc);
        options.limit = limit;
        options.offset = offset;
        self.find_many(&Query::new().eq("conversationId", conversation_id), &options)
            .await
    }

    /// Full-text message search
    ///
    /// Goes to the search engine when one is configured and reachable,
    /// otherwise falls back to a case-insensitive substring match on
    /// `content`, newest first.
    pub async fn search_messages(
        &self,
        text: &str,
        conversation_id: Option<&str>,
        limit: u64,
    ) -> RepositoryResult<Vec<Document>> {
        let mut options = SearchOptions::default().limit(limit);
        if let Some(id) = conversation_id {
            options = options.filter(filter_eq("conversationId", id));
        }
        if let Some(found) = self.search_index(text, &options).await {
            return Ok(found);
        }

        tracing::debug!(text, "message search falling back to store query");
        let mut query = Query::new().filter("content", Filter::contains_ci(text));
        if let Some(id) = conversation_id {
            query = query.eq("conversationId", id);
        }
        self.find_many(
            &query,
            &QueryOptions::new()
                .sort_by("createdAt", SortOrder::Desc)
                .limit(limit),
        )
        .await
    }

    pub async fn count_by_conversation(&self, conversation_id: &str) -> RepositoryResult<u64> {
        self.count(&Query::new().eq("conversationId", conversation_id))
            .await
    }

    pub async fn delete_by_conversation(&self, conversation_id: &str) -> RepositoryResult<u64> {
        self.delete_many(&Query::new().eq("conversationId", conversation_id))
            .await
    }

    /// Most recent message of a conversation
    pub async fn latest(&self, conversation_id: &str) -> RepositoryResult<Option<Document>> {
        self.find_one(
            &Query::new().eq("conversationId", conversation_id),
            &QueryOptions::new().sort_by("createdAt", SortOrder::Desc),
        )
        .await
    }

    /// Replies to a message, oldest first
    pub async fn find_replies(&self, parent_message_id: &str) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().eq("parentMessageId", Value::String(parent_message_id.to_string())),
            &QueryOptions::new().sort_by("createdAt", SortOrder::Asc),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use crate::models::{doc, document_id};
    use serde_json::json;

    async fn messages() -> anyhow::Result<MessageRepository> {
        let store: Arc<dyn StoreAdapter> = Arc::new(LibsqlStore::new(LibsqlConfig::in_memory())?);
        store.connect().await?;
        Ok(MessageRepository::new(
            store.clone(),
            SearchIndexer::disabled(store),
        ))
    }

    #[tokio::test]
    async fn test_search_falls_back_to_case_insensitive_match() -> anyhow::Result<()> {
        let messages = messages().await?;
        for (conversation, content) in [
            ("c1", "Hello there"),
            ("c1", "nothing relevant"),
            ("c2", "well, HELLO again"),
        ] {
            messages
                .create(doc(json!({
                    "conversationId": conversation,
                    "role": "user",
                    "content": content
                })))
                .await?;
        }

        let everywhere = messages.search_messages("hello", None, 10).await?;
        assert_eq!(everywhere.len(), 2);

        let scoped = messages.search_messages("hello", Some("c1"), 10).await?;
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0]["content"], json!("Hello there"));
        Ok(())
    }

    #[tokio::test]
    async fn test_conversation_helpers() -> anyhow::Result<()> {
        let messages = messages().await?;
        let first = messages
            .create(doc(json!({"conversationId": "c1", "role": "user", "content": "one"})))
            .await?;
        let first_id = document_id(&first).expect("id");
        messages
            .create(doc(json!({
                "conversationId": "c1",
                "role": "assistant",
                "content": "two",
                "parentMessageId": first_id
            })))
            .await?;

        assert_eq!(messages.count_by_conversation("c1").await?, 2);
        let ordered = messages.find_by_conversation("c1", None, None).await?;
        assert_eq!(ordered[0]["content"], json!("one"));
        assert_eq!(
            messages.latest("c1").await?.expect("latest")["content"],
            json!("two")
        );
        assert_eq!(messages.find_replies(&first_id).await?.len(), 1);

        assert_eq!(messages.delete_by_conversation("c1").await?, 2);
        assert_eq!(messages.count_by_conversation("c1").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_role_is_rejected() -> anyhow::Result<()> {
        let messages = messages().await?;
        assert!(messages
            .create(doc(json!({"conversationId": "c1", "role": "robot", "content": "x"})))
            .await
            .is_err());
        Ok(())
    }
}
