//! User accounts.

use crate::db::StoreAdapter;
use crate::models::{
    collections, now_timestamp, Document, Filter, PageRequest, Paginated, Query, QueryOptions,
    Update, ValidationError, ID_FIELD,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

const ROLES: &[&str] = &["user", "admin"];

struct UserPolicy;

impl RecordPolicy for UserPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["email", "username"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(email) = data.get("email").and_then(Value::as_str) {
            let well_formed = email
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
            if !well_formed {
                return Err(ValidationError::invalid("email", "not a valid address"));
            }
        }
        if let Some(username) = data.get("username").and_then(Value::as_str) {
            if username.chars().any(char::is_whitespace) {
                return Err(ValidationError::invalid("username", "must not contain spaces"));
            }
        }
        if let Some(role) = data.get("role").and_then(Value::as_str) {
            if !ROLES.contains(&role) {
                return Err(ValidationError::invalid("role", format!("unknown role '{}'", role)));
            }
        }
        Ok(())
    }

    fn normalize(&self, data: &mut Document) {
        if let Some(Value::String(email)) = data.get_mut("email") {
            *email = normalize_email(email);
        }
        if let Some(Value::String(username)) = data.get_mut("username") {
            *username = username.trim().to_string();
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone, Debug)]
pub struct UserRepository {
    repo: Repository,
}

impl Deref for UserRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl UserRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::USERS, store).with_policy(UserPolicy),
        }
    }

    /// Case-insensitive lookup; emails are stored lower-cased
    pub async fn find_by_email(&self, email: &str) -> RepositoryResult<Option<Document>> {
        self.find_one(
            &Query::new().eq("email", normalize_email(email)),
            &QueryOptions::new(),
        )
        .await
    }

    pub async fn find_by_username(&self, username: &str) -> RepositoryResult<Option<Document>> {
        self.find_one(
            &Query::new().eq("username", username.trim()),
            &QueryOptions::new(),
        )
        .await
    }

    /// Whether another account already uses `email`
    ///
    /// `exclude_user_id` skips the caller's own record, for profile updates.
    pub async fn email_exists(
        &self,
        email: &str,
        exclude_user_id: Option<&str>,
    ) -> RepositoryResult<bool> {
        let query = excluding(
            Query::new().eq("email", normalize_email(email)),
            exclude_user_id,
        );
        self.exists(&query).await
    }

    pub async fn username_exists(
        &self,
        username: &str,
        exclude_user_id: Option<&str>,
    ) -> RepositoryResult<bool> {
        let query = excluding(Query::new().eq("username", username.trim()), exclude_user_id);
        self.exists(&query).await
    }

    pub async fn update_last_login(&self, user_id: &str) -> RepositoryResult<Option<Document>> {
        self.update_by_id(user_id, &Update::new().set("lastLoginAt", now_timestamp()))
            .await
    }

    pub async fn find_active(&self, page: &PageRequest) -> RepositoryResult<Paginated<Document>> {
        // Accounts without the flag count as active
        let query = Query::new().filter("isActive", Filter::Ne(Value::Bool(false)));
        self.paginate(&query, page).await
    }

    pub async fn set_active(
        &self,
        user_id: &str,
        active: bool,
    ) -> RepositoryResult<Option<Document>> {
        self.update_by_id(user_id, &Update::new().set("isActive", active))
            .await
    }
}

fn excluding(query: Query, exclude_id: Option<&str>) -> Query {
    match exclude_id {
        Some(id) => query.filter(ID_FIELD, Filter::Ne(Value::String(id.to_string()))),
        None => query,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};
    use crate::models::{doc, document_id};
    use crate::repositories::RepositoryError;
    use serde_json::json;

    async fn users() -> anyhow::Result<UserRepository> {
        let store = LibsqlStore::new(LibsqlConfig::in_memory())?;
        store.connect().await?;
        Ok(UserRepository::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_find_by_email_ignores_case() -> anyhow::Result<()> {
        let users = users().await?;
        users
            .create(doc(json!({"email": "A@X.com", "username": "a"})))
            .await?;

        let found = users.find_by_email("a@x.COM").await?.expect("found");
        assert_eq!(found["email"], json!("a@x.com"));
        assert!(users.find_by_email("b@x.com").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_email_exists_excludes_own_record() -> anyhow::Result<()> {
        let users = users().await?;
        let me = users
            .create(doc(json!({"email": "a@x.com", "username": "a"})))
            .await?;
        let my_id = document_id(&me).expect("id");

        assert!(users.email_exists("A@X.COM", None).await?);
        assert!(!users.email_exists("a@x.com", Some(&my_id)).await?);
        assert!(users.username_exists("a", Some("999")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_email_and_duplicate_are_rejected() -> anyhow::Result<()> {
        let users = users().await?;
        let err = users
            .create(doc(json!({"email": "nope", "username": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)));

        users
            .create(doc(json!({"email": "a@x.com", "username": "a"})))
            .await?;
        let dup = users
            .create(doc(json!({"email": "A@x.com", "username": "b"})))
            .await
            .unwrap_err();
        assert!(dup.is_conflict());
        Ok(())
    }

    #[tokio::test]
    async fn test_set_active_and_last_login() -> anyhow::Result<()> {
        let users = users().await?;
        let user = users
            .create(doc(json!({"email": "a@x.com", "username": "a"})))
            .await?;
        let id = document_id(&user).expect("id");

        let updated = users.set_active(&id, false).await?.expect("exists");
        assert_eq!(updated["isActive"], json!(false));
        let page = users.find_active(&PageRequest::default()).await?;
        assert_eq!(page.pagination.total, 0);

        let logged_in = users.update_last_login(&id).await?.expect("exists");
        assert!(logged_in["lastLoginAt"].is_string());
        Ok(())
    }
}
