//! Append-only audit trail.

use crate::db::StoreAdapter;
use crate::models::{
    collections, format_timestamp, Document, Filter, PageRequest, Paginated, Query, QueryOptions,
    SortOrder,
};
use crate::repositories::base::{RecordPolicy, Repository};
use crate::repositories::error::RepositoryResult;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

struct AuditPolicy;

impl RecordPolicy for AuditPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["action", "resourceType"]
    }
}

/// One audited action
#[derive(Debug, Clone, Default)]
pub struct AuditEvent<'a> {
    pub user_id: Option<&'a str>,
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
    pub details: Option<Value>,
    pub ip_address: Option<&'a str>,
}

impl AuditEvent<'_> {
    fn into_document(self) -> Document {
        let mut doc = Document::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                doc.insert(key.to_string(), value);
            }
        };
        put("userId", self.user_id.map(Value::from));
        put("action", Some(Value::from(self.action)));
        put("resourceType", Some(Value::from(self.resource_type)));
        put("resourceId", self.resource_id.map(Value::from));
        put("details", self.details);
        put("ipAddress", self.ip_address.map(Value::from));
        doc
    }
}

#[derive(Clone, Debug)]
pub struct AuditLogRepository {
    repo: Repository,
}

impl Deref for AuditLogRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl AuditLogRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::AUDIT_LOGS, store).with_policy(AuditPolicy),
        }
    }

    pub async fn record(&self, event: AuditEvent<'_>) -> RepositoryResult<Document> {
        tracing::debug!(
            action = event.action,
            resource_type = event.resource_type,
            "audit event"
        );
        self.create(event.into_document()).await
    }

    /// History of one resource, oldest first
    pub async fn find_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new()
                .eq("resourceType", resource_type)
                .eq("resourceId", resource_id),
            &QueryOptions::new().sort_by("createdAt", SortOrder::Asc),
        )
        .await
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

    /// Retention: drop entries created before `cutoff`
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64> {
        let purged = self
            .delete_many(
                &Query::new().filter("createdAt", Filter::Lt(Value::String(format_timestamp(cutoff)))),
            )
            .await?;
        tracing::info!(purged, cutoff = %cutoff, "audit log retention applied");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use crate::models::doc;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_resource_history_and_retention() -> anyhow::Result<()> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        let audit = AuditLogRepository::new(Arc::new(store));

        audit
            .record(AuditEvent {
                user_id: Some("u1"),
                action: "create",
                resource_type: "conversation",
                resource_id: Some("c1"),
                details: Some(json!({"title": "Trip"})),
                ..Default::default()
            })
            .await?;
        audit
            .record(AuditEvent {
                user_id: Some("u1"),
                action: "delete",
                resource_type: "conversation",
                resource_id: Some("c1"),
                ..Default::default()
            })
            .await?;

        let old = format_timestamp(Utc::now() - Duration::days(120));
        audit
            .create(doc(json!({
                "action": "login",
                "resourceType": "user",
                "createdAt": old
            })))
            .await?;

        let history = audit.find_for_resource("conversation", "c1").await?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["action"], json!("create"));
        assert_eq!(history[0]["details"]["title"], json!("Trip"));
        assert_eq!(
            audit.find_by_user("u1", &PageRequest::default()).await?.pagination.total,
            2
        );

        let purged = audit
            .purge_older_than(Utc::now() - Duration::days(90))
            .await?;
        assert_eq!(purged, 1);
        assert!(audit.record(AuditEvent::default()).await.is_err());
        Ok(())
    }
}
