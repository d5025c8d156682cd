//! In-app notifications.

use crate::db::StoreAdapter;
use crate::models::{
    collections, now_timestamp, Document, Filter, PageRequest, Paginated, Query, SortOrder, Update,
};
use crate::repositories::base::{RecordPolicy, Repository};
use crate::repositories::error::RepositoryResult;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

struct NotificationPolicy;

impl RecordPolicy for NotificationPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["userId", "type", "title"]
    }

    fn after_load(&self, mut doc: Document) -> Document {
        doc.entry("isRead").or_insert(Value::Bool(false));
        doc
    }
}

fn unread(user_id: &str) -> Query {
    Query::new()
        .eq("userId", user_id)
        .filter("isRead", Filter::Ne(Value::Bool(true)))
}

#[derive(Clone, Debug)]
pub struct NotificationRepository {
    repo: Repository,
}

impl Deref for NotificationRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl NotificationRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::NOTIFICATIONS, store)
                .with_policy(NotificationPolicy),
        }
    }

    pub async fn unread_for_user(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> RepositoryResult<Paginated<Document>> {
        let mut page = page.clone();
        if page.sort.is_empty() {
            page = page.sort_by("createdAt", SortOrder::Desc);
        }
        self.paginate(&unread(user_id), &page).await
    }

    pub async fn unread_count(&self, user_id: &str) -> RepositoryResult<u64> {
        self.count(&unread(user_id)).await
    }

    pub async fn mark_read(&self, id: &str) -> RepositoryResult<Option<Document>> {
        self.update_by_id(
            id,
            &Update::new()
                .set("isRead", true)
                .set("readAt", now_timestamp()),
        )
        .await
    }

    /// Returns how many notifications changed
    pub async fn mark_all_read(&self, user_id: &str) -> RepositoryResult<u64> {
        self.update_many(
            &unread(user_id),
            &Update::new()
                .set("isRead", true)
                .set("readAt", now_timestamp()),
        )
        .await
    }

    pub async fn delete_read(&self, user_id: &str) -> RepositoryResult<u64> {
        self.delete_many(&Query::new().eq("userId", user_id).eq("isRead", true))
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
    async fn test_read_state_transitions() -> anyhow::Result<()> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        let notifications = NotificationRepository::new(Arc::new(store));

        let first = notifications
            .create(doc(json!({"userId": "u1", "type": "system", "title": "Welcome"})))
            .await?;
        assert_eq!(first["isRead"], json!(false));
        for title in ["Quota", "Digest"] {
            notifications
                .create(doc(json!({"userId": "u1", "type": "info", "title": title})))
                .await?;
        }
        assert_eq!(notifications.unread_count("u1").await?, 3);

        let read = notifications
            .mark_read(&document_id(&first).expect("id"))
            .await?
            .expect("exists");
        assert!(read["readAt"].is_string());
        assert_eq!(notifications.unread_count("u1").await?, 2);

        assert_eq!(notifications.mark_all_read("u1").await?, 2);
        let page = notifications
            .unread_for_user("u1", &PageRequest::default())
            .await?;
        assert!(page.data.is_empty());
        assert_eq!(notifications.delete_read("u1").await?, 3);
        Ok(())
    }
}
