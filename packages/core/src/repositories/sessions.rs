//! Login sessions, keyed by their token.

use crate::db::StoreAdapter;
use crate::models::{
    collections, format_timestamp, now_timestamp, Document, Filter, Query, QueryOptions, SortOrder,
    Update, ID_FIELD,
};
use crate::repositories::base::{RecordPolicy, Repository};
use crate::repositories::error::RepositoryResult;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;
use uuid::Uuid;

struct SessionPolicy;

impl RecordPolicy for SessionPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["userId", "expiresAt"]
    }
}

#[derive(Clone, Debug)]
pub struct SessionRepository {
    repo: Repository,
}

impl Deref for SessionRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl SessionRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::SESSIONS, store).with_policy(SessionPolicy),
        }
    }

    /// Open a session for `user_id` that expires after `ttl`
    pub async fn create_session(
        &self,
        user_id: &str,
        ttl: Duration,
        data: Option<Value>,
    ) -> RepositoryResult<Document> {
        let mut session = Document::new();
        session.insert(
            ID_FIELD.to_string(),
            Value::String(Uuid::new_v4().simple().to_string()),
        );
        session.insert("userId".to_string(), Value::String(user_id.to_string()));
        session.insert(
            "expiresAt".to_string(),
            Value::String(format_timestamp(Utc::now() + ttl)),
        );
        if let Some(data) = data {
            session.insert("data".to_string(), data);
        }
        self.create(session).await
    }

    /// The session for `token`, unless it has expired
    pub async fn find_valid(&self, token: &str) -> RepositoryResult<Option<Document>> {
        let query = Query::by_id(token)
            .filter("expiresAt", Filter::Gt(Value::String(now_timestamp())));
        self.find_one(&query, &QueryOptions::new()).await
    }

    /// Push the expiry of a live session `ttl` into the future
    pub async fn extend(&self, token: &str, ttl: Duration) -> RepositoryResult<Option<Document>> {
        if self.find_valid(token).await?.is_none() {
            return Ok(None);
        }
        self.update_by_id(
            token,
            &Update::new().set("expiresAt", format_timestamp(Utc::now() + ttl)),
        )
        .await
    }

    pub async fn find_by_user(&self, user_id: &str) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new()
                .eq("userId", user_id)
                .filter("expiresAt", Filter::Gt(Value::String(now_timestamp()))),
            &QueryOptions::new().sort_by("createdAt", SortOrder::Desc),
        )
        .await
    }

    pub async fn delete_expired(&self) -> RepositoryResult<u64> {
        let deleted = self
            .delete_many(
                &Query::new().filter("expiresAt", Filter::Lte(Value::String(now_timestamp()))),
            )
            .await?;
        if deleted > 0 {
            tracing::info!(deleted, "purged expired sessions");
        }
        Ok(deleted)
    }

    /// Log a user out everywhere
    pub async fn delete_for_user(&self, user_id: &str) -> RepositoryResult<u64> {
        self.delete_many(&Query::new().eq("userId", user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use crate::models::document_id;
    use serde_json::json;

    async fn sessions() -> anyhow::Result<SessionRepository> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        Ok(SessionRepository::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_session_token_is_identifier() -> anyhow::Result<()> {
        let sessions = sessions().await?;
        let session = sessions
            .create_session("u1", Duration::hours(1), Some(json!({"ip": "127.0.0.1"})))
            .await?;
        let token = document_id(&session).expect("token");
        assert_eq!(token.len(), 32);

        let found = sessions.find_valid(&token).await?.expect("valid");
        assert_eq!(found["data"]["ip"], json!("127.0.0.1"));
        assert!(sessions.extend(&token, Duration::hours(2)).await?.is_some());
        assert!(sessions.find_valid("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_sessions_are_invalid_and_purged() -> anyhow::Result<()> {
        let sessions = sessions().await?;
        let stale = sessions
            .create_session("u1", Duration::seconds(-60), None)
            .await?;
        sessions
            .create_session("u1", Duration::hours(1), None)
            .await?;
        sessions
            .create_session("u2", Duration::hours(1), None)
            .await?;

        let stale_token = document_id(&stale).expect("token");
        assert!(sessions.find_valid(&stale_token).await?.is_none());
        assert!(sessions.extend(&stale_token, Duration::hours(1)).await?.is_none());
        assert_eq!(sessions.find_by_user("u1").await?.len(), 1);

        assert_eq!(sessions.delete_expired().await?, 1);
        assert_eq!(sessions.delete_for_user("u1").await?, 1);
        assert_eq!(sessions.count(&Query::new()).await?, 1);
        Ok(())
    }
}
