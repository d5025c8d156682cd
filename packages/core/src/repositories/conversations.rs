//! Conversations: chat threads owned by a user.

use crate::db::StoreAdapter;
use crate::models::{
    collections, now_timestamp, Document, Filter, PageRequest, Paginated, Query, QueryOptions,
    SortOrder, Update,
};
use crate::repositories::base::{filter_eq, RecordPolicy, Repository};
use crate::repositories::error::RepositoryResult;
use crate::search::{SearchIndexer, SearchOptions};
use serde_json::{json, Value};
use std::ops::Deref;
use std::sync::Arc;

struct ConversationPolicy;

impl RecordPolicy for ConversationPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["userId"]
    }

    fn normalize(&self, data: &mut Document) {
        if let Some(Value::String(title)) = data.get_mut("title") {
            *title = title.trim().to_string();
        }
    }

    /// Records written without counters (document backend) read as fresh threads
    fn after_load(&self, mut doc: Document) -> Document {
        doc.entry("messageCount").or_insert_with(|| json!(0));
        doc.entry("isArchived").or_insert(Value::Bool(false));
        doc
    }

    fn search_fields(&self) -> &'static [&'static str] {
        &["title"]
    }
}

#[derive(Clone, Debug)]
pub struct ConversationRepository {
    repo: Repository,
}

impl Deref for ConversationRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl ConversationRepository {
    pub fn new(store: Arc<dyn StoreAdapter>, indexer: SearchIndexer) -> Self {
        Self {
            repo: Repository::new(collections::CONVERSATIONS, store)
                .with_policy(ConversationPolicy)
                .with_indexer(indexer),
        }
    }

    /// A user's conversations, most recently updated first
    pub async fn find_by_user(
        &self,
        user_id: &str,
        include_archived: bool,
        page: &PageRequest,
    ) -> RepositoryResult<Paginated<Document>> {
        let mut query = Query::new().eq("userId", user_id);
        if !include_archived {
            query = query.filter("isArchived", Filter::Ne(Value::Bool(true)));
        }
        let mut page = page.clone();
        if page.sort.is_empty() {
            page = page.sort_by("updatedAt", SortOrder::Desc);
        }
        self.paginate(&query, &page).await
    }

    pub async fn archive(&self, id: &str, archived: bool) -> RepositoryResult<Option<Document>> {
        self.update_by_id(id, &Update::new().set("isArchived", archived))
            .await
    }

    /// Bump the message counter and last-activity time
    pub async fn increment_message_count(&self, id: &str) -> RepositoryResult<Option<Document>> {
        self.update_by_id(
            id,
            &Update::new()
                .inc("messageCount", 1)
                .set("lastMessageAt", now_timestamp()),
        )
        .await
    }

    /// Title search within a user's conversations
    ///
    /// Uses the search engine when available, otherwise a case-insensitive
    /// substring match on the title.
    pub async fn search(
        &self,
        user_id: &str,
        text: &str,
        limit: u64,
    ) -> RepositoryResult<Vec<Document>> {
        let options = SearchOptions::default()
            .limit(limit)
            .filter(filter_eq("userId", user_id));
        if let Some(found) = self.search_index(text, &options).await {
            return Ok(found);
        }

        let query = Query::new()
            .eq("userId", user_id)
            .filter("title", Filter::contains_ci(text));
        self.find_many(
            &query,
            &QueryOptions::new()
                .sort_by("updatedAt", SortOrder::Desc)
                .limit(limit),
        )
        .await
    }
}
