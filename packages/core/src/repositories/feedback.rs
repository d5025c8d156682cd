//! Ratings users leave on assistant messages.

use crate::db::StoreAdapter;
use crate::models::{
    collections, Accumulator, AggregateSpec, Document, FindOneAndUpdateOptions, Query,
    QueryOptions, SortOrder, Update, ValidationError,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use serde::Serialize;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 5;

struct FeedbackPolicy;

impl RecordPolicy for FeedbackPolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["messageId", "userId", "rating"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        if let Some(rating) = data.get("rating") {
            if !rating
                .as_i64()
                .is_some_and(|r| (MIN_RATING..=MAX_RATING).contains(&r))
            {
                return Err(ValidationError::invalid(
                    "rating",
                    format!("must be an integer from {} to {}", MIN_RATING, MAX_RATING),
                ));
            }
        }
        Ok(())
    }
}

/// Aggregate rating of one message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSummary {
    pub count: u64,
    pub average: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct FeedbackRepository {
    repo: Repository,
}

impl Deref for FeedbackRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl FeedbackRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::FEEDBACK, store).with_policy(FeedbackPolicy),
        }
    }

    /// Record a user's rating of a message, replacing their earlier one
    pub async fn submit(
        &self,
        message_id: &str,
        user_id: &str,
        rating: i64,
        comment: Option<&str>,
    ) -> RepositoryResult<Option<Document>> {
        let mut update = Update::new().set("rating", rating);
        if let Some(comment) = comment {
            update = update.set("comment", comment);
        }
        self.find_one_and_update(
            &Query::new().eq("messageId", message_id).eq("userId", user_id),
            &update,
            FindOneAndUpdateOptions { upsert: true },
        )
        .await
    }

    pub async fn find_by_message(&self, message_id: &str) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().eq("messageId", message_id),
            &QueryOptions::new().sort_by("createdAt", SortOrder::Asc),
        )
        .await
    }

    pub async fn find_by_user(&self, user_id: &str, limit: u64) -> RepositoryResult<Vec<Document>> {
        self.find_many(
            &Query::new().eq("userId", user_id),
            &QueryOptions::new()
                .sort_by("createdAt", SortOrder::Desc)
                .limit(limit),
        )
        .await
    }

    pub async fn average_rating(&self, message_id: &str) -> RepositoryResult<RatingSummary> {
        let spec = AggregateSpec::new(Query::new().eq("messageId", message_id))
            .accumulate("count", Accumulator::Count)
            .accumulate("average", Accumulator::Avg("rating".to_string()));
        let rows = self.aggregate(&spec).await?;
        let row = rows.first();
        let count = row
            .and_then(|r| r.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let average = if count == 0 {
            None
        } else {
            row.and_then(|r| r.get("average")).and_then(Value::as_f64)
        };
        Ok(RatingSummary { count, average })
    }
}
