//! Meilisearch HTTP client
//!
//! Write endpoints enqueue asynchronous tasks on the server and answer
//! `202 Accepted`; this client treats an accepted task as success.

use crate::config::SearchConfig;
use crate::search::engine::{IndexStats, SearchEngine, SearchHits, SearchOptions};
use crate::search::error::SearchIndexError;
use crate::search::settings::{IndexSettings, INDEX_PRIMARY_KEY};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// `SearchEngine` over the Meilisearch REST API
pub struct MeilisearchEngine {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl MeilisearchEngine {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build a client from configuration; `None` when search is inactive
    pub fn from_config(config: &SearchConfig) -> Result<Option<Self>, SearchIndexError> {
        let Some(url) = config.url.as_deref().filter(|_| config.is_active()) else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Some(Self::new(client, url, config.api_key.clone())))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SearchIndexError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<MeiliError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(SearchIndexError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MeiliError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeiliSearchResponse {
    hits: Vec<Value>,
    estimated_total_hits: Option<u64>,
    processing_time_ms: Option<u64>,
}

#[async_trait]
impl SearchEngine for MeilisearchEngine {
    async fn health(&self) -> Result<(), SearchIndexError> {
        self.send(self.client.get(self.url("/health"))).await?;
        Ok(())
    }

    async fn configure_index(
        &self,
        index: &str,
        settings: &IndexSettings,
    ) -> Result<(), SearchIndexError> {
        let create = self
            .client
            .post(self.url("/indexes"))
            .json(&json!({"uid": index, "primaryKey": INDEX_PRIMARY_KEY}));
        match self.send(create).await {
            Ok(_) => {}
            // Index already exists
            Err(SearchIndexError::Rejected { status: 409, .. }) => {}
            Err(e) => return Err(e),
        }

        let update = self
            .client
            .patch(self.url(&format!("/indexes/{}/settings", index)))
            .json(settings);
        self.send(update).await?;
        Ok(())
    }

    async fn add_documents(
        &self,
        index: &str,
        documents: &[Value],
    ) -> Result<(), SearchIndexError> {
        if documents.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .post(self.url(&format!("/indexes/{}/documents", index)))
            .query(&[("primaryKey", INDEX_PRIMARY_KEY)])
            .json(documents);
        self.send(request).await?;
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<(), SearchIndexError> {
        let request = self
            .client
            .delete(self.url(&format!("/indexes/{}/documents/{}", index, id)));
        self.send(request).await?;
        Ok(())
    }

    async fn delete_all_documents(&self, index: &str) -> Result<(), SearchIndexError> {
        let request = self
            .client
            .delete(self.url(&format!("/indexes/{}/documents", index)));
        self.send(request).await?;
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchHits, SearchIndexError> {
        let mut body = json!({
            "q": query,
            "attributesToRetrieve": [INDEX_PRIMARY_KEY],
        });
        if let Some(limit) = options.limit {
            body["limit"] = json!(limit);
        }
        if let Some(offset) = options.offset {
            body["offset"] = json!(offset);
        }
        if let Some(filter) = &options.filter {
            body["filter"] = json!(filter);
        }

        let request = self
            .client
            .post(self.url(&format!("/indexes/{}/search", index)))
            .json(&body);
        let response: MeiliSearchResponse = self.send(request).await?.json().await?;

        let ids = response
            .hits
            .iter()
            .filter_map(|hit| match hit.get(INDEX_PRIMARY_KEY)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        Ok(SearchHits {
            ids,
            estimated_total: response.estimated_total_hits,
            processing_time_ms: response.processing_time_ms,
        })
    }

    async fn stats(&self, index: &str) -> Result<IndexStats, SearchIndexError> {
        let request = self
            .client
            .get(self.url(&format!("/indexes/{}/stats", index)));
        Ok(self.send(request).await?.json().await?)
    }
}
