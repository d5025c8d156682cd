//! Model usage accounting.

use crate::db::StoreAdapter;
use crate::models::{
    collections, format_timestamp, Accumulator, AggregateSpec, Document, Filter, Query,
    ValidationError, ID_FIELD,
};
use crate::repositories::base::{RecordPolicy, Repository, WriteOperation};
use crate::repositories::error::RepositoryResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::ops::Deref;
use std::sync::Arc;

const TOKEN_FIELDS: &[&str] = &["promptTokens", "completionTokens", "totalTokens"];

struct UsagePolicy;

impl RecordPolicy for UsagePolicy {
    fn required_fields(&self) -> &'static [&'static str] {
        &["userId", "model"]
    }

    fn validate(&self, data: &Document, _op: WriteOperation) -> Result<(), ValidationError> {
        for field in TOKEN_FIELDS {
            if let Some(value) = data.get(*field) {
                if value.as_u64().is_none() {
                    return Err(ValidationError::invalid(
                        *field,
                        "must be a non-negative integer",
                    ));
                }
            }
        }
        if let Some(cost) = data.get("cost") {
            if !cost.as_f64().is_some_and(|c| c >= 0.0) {
                return Err(ValidationError::invalid("cost", "must be a non-negative number"));
            }
        }
        Ok(())
    }

    /// Derive `totalTokens` when the caller only reports the parts
    fn normalize(&self, data: &mut Document) {
        if data.contains_key("totalTokens") {
            return;
        }
        let prompt = data.get("promptTokens").and_then(Value::as_u64);
        let completion = data.get("completionTokens").and_then(Value::as_u64);
        if prompt.is_some() || completion.is_some() {
            let total = prompt.unwrap_or(0) + completion.unwrap_or(0);
            data.insert("totalTokens".to_string(), json!(total));
        }
    }
}

/// One model call to account for
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub user_id: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

/// Summed usage over a set of log rows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl UsageTotals {
    fn from_row(row: &Document) -> Self {
        let int = |key: &str| row.get(key).and_then(Value::as_f64).unwrap_or(0.0) as u64;
        Self {
            requests: int("requests"),
            prompt_tokens: int("promptTokens"),
            completion_tokens: int("completionTokens"),
            total_tokens: int("totalTokens"),
            cost: row.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub model: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
}

fn totals_spec(filter: Query) -> AggregateSpec {
    AggregateSpec::new(filter)
        .accumulate("requests", Accumulator::Count)
        .accumulate("promptTokens", Accumulator::Sum("promptTokens".to_string()))
        .accumulate(
            "completionTokens",
            Accumulator::Sum("completionTokens".to_string()),
        )
        .accumulate("totalTokens", Accumulator::Sum("totalTokens".to_string()))
        .accumulate("cost", Accumulator::Sum("cost".to_string()))
}

#[derive(Clone, Debug)]
pub struct UsageLogRepository {
    repo: Repository,
}

impl Deref for UsageLogRepository {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl UsageLogRepository {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self {
            repo: Repository::new(collections::USAGE_LOGS, store).with_policy(UsagePolicy),
        }
    }

    pub async fn record(&self, entry: &UsageEntry) -> RepositoryResult<Document> {
        let data = match serde_json::to_value(entry) {
            Ok(Value::Object(map)) => map,
            _ => Document::new(),
        };
        self.create(data).await
    }

    /// Usage of one user, optionally only since `since`
    pub async fn totals_by_user(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> RepositoryResult<UsageTotals> {
        let mut filter = Query::new().eq("userId", user_id);
        if let Some(since) = since {
            filter = filter.filter(
                "createdAt",
                Filter::Gte(Value::String(format_timestamp(since))),
            );
        }
        let rows = self.aggregate(&totals_spec(filter)).await?;
        Ok(rows.first().map(UsageTotals::from_row).unwrap_or_default())
    }

    /// Per-model breakdown of one user's usage, ordered by model name
    pub async fn usage_by_model(&self, user_id: &str) -> RepositoryResult<Vec<ModelUsage>> {
        let spec = totals_spec(Query::new().eq("userId", user_id)).group_by("model");
        let mut usage: Vec<ModelUsage> = self
            .aggregate(&spec)
            .await?
            .iter()
            .filter_map(|row| {
                let model = row.get(ID_FIELD)?.as_str()?.to_string();
                Some(ModelUsage {
                    model,
                    totals: UsageTotals::from_row(row),
                })
            })
            .collect();
        usage.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(usage)
    }
}
