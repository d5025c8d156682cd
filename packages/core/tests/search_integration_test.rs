//! Search indexing through the manager, against a mocked Meilisearch
//!
//! The engine is a wiremock server; the store is an in-memory backend, so
//! these tests exercise configuration, write-path indexing, rank-order
//! hydration and the store fallback end to end.

use serde_json::json;
use unistore_core::models::{doc, document_id, Query, INDEXED_FIELD};
use unistore_core::{DalConfig, DatabaseManager};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, backend: &str) -> anyhow::Result<DalConfig> {
    let text = format!(
        r#"
backend = "{backend}"

[relational]
path = ":memory:"

[document]
url = "mem://"

[search]
url = "{}"
api_key = "test-key"
batch_size = 2
"#,
        server.uri()
    );
    Ok(DalConfig::from_toml(&text)?)
}

async fn accepting_engine() -> MockServer {
    let server = MockServer::start().await;
    let accepted = ResponseTemplate::new(202).set_body_json(json!({"taskUid": 1}));
    Mock::given(method("POST"))
        .and(path("/indexes"))
        .respond_with(accepted.clone())
        .mount(&server)
        .await;
    for index in ["conversations", "messages", "documents"] {
        Mock::given(method("PATCH"))
            .and(path(format!("/indexes/{index}/settings")))
            .respond_with(accepted.clone())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/indexes/{index}/documents")))
            .respond_with(accepted.clone())
            .mount(&server)
            .await;
    }
    server
}

#[tokio::test]
async fn test_created_messages_are_indexed_and_searched_in_rank_order() -> anyhow::Result<()> {
    let server = accepting_engine().await;
    let manager = DatabaseManager::new();
    manager.initialize(&config_for(&server, "relational")?).await?;
    assert!(manager.search_indexer()?.is_enabled());

    let messages = manager.repositories()?.messages.clone();
    let first = messages
        .create(doc(json!({"conversationId": "c1", "role": "user", "content": "hello there"})))
        .await?;
    let second = messages
        .create(doc(json!({"conversationId": "c1", "role": "assistant", "content": "hello back"})))
        .await?;
    let first_id = document_id(&first).expect("id");
    let second_id = document_id(&second).expect("id");

    // Accepted writes stamp the sync marker
    assert_eq!(
        messages
            .count(&Query::new().eq(INDEXED_FIELD, true))
            .await?,
        2
    );

    Mock::given(method("POST"))
        .and(path("/indexes/messages/search"))
        .and(body_partial_json(json!({"q": "hello", "filter": "conversationId = \"c1\""})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": [{"id": second_id}, {"id": "deleted-meanwhile"}, {"id": first_id}],
            "estimatedTotalHits": 3
        })))
        .expect(1)
        .mount(&server)
        .await;

    let found = messages.search_messages("hello", Some("c1"), 10).await?;
    let ids: Vec<String> = found.iter().filter_map(document_id).collect();
    assert_eq!(ids, vec![second_id, first_id]);

    manager.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_failing_engine_does_not_fail_writes_or_searches() -> anyhow::Result<()> {
    let server = accepting_engine().await;
    let manager = DatabaseManager::new();
    manager.initialize(&config_for(&server, "document")?).await?;

    // Engine starts rejecting everything
    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"message": "unavailable"})))
        .mount(&server)
        .await;

    let messages = manager.repositories()?.messages.clone();
    messages
        .create(doc(json!({"conversationId": "c1", "role": "user", "content": "Rust borrow checker"})))
        .await?;
    messages
        .create(doc(json!({"conversationId": "c2", "role": "user", "content": "unrelated"})))
        .await?;
    assert_eq!(
        messages
            .count(&Query::new().eq(INDEXED_FIELD, true))
            .await?,
        0
    );

    // Falls back to a case-insensitive store match
    let found = messages.search_messages("BORROW", None, 10).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("conversationId"), Some(&json!("c1")));

    // The sync pass reports the failure instead of erroring
    let reports = manager.sync_search_index(None).await?;
    let report = &reports["messages"];
    assert_eq!(report.indexed, 0);
    assert!(report.error.is_some());

    manager.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_sync_indexes_backlog_in_batches() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let manager = DatabaseManager::new();
    // No engine mocks yet: configuration fails and the manager carries on
    manager.initialize(&config_for(&server, "relational")?).await?;

    let messages = manager.repositories()?.messages.clone();
    for i in 0..5 {
        messages
            .create(doc(json!({"conversationId": "c1", "role": "user", "content": format!("note {i}")})))
            .await?;
    }
    assert_eq!(
        messages
            .count(&Query::new().eq(INDEXED_FIELD, true))
            .await?,
        0
    );

    Mock::given(method("POST"))
        .and(path("/indexes/messages/documents"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"taskUid": 2})))
        .expect(3)
        .mount(&server)
        .await;

    let reports = manager.sync_search_index(None).await?;
    let report = &reports["messages"];
    assert_eq!(report.indexed, 5);
    assert_eq!(report.batches, 3);
    assert!(report.error.is_none());
    assert_eq!(
        messages
            .count(&Query::new().eq(INDEXED_FIELD, true))
            .await?,
        5
    );

    manager.disconnect().await?;
    Ok(())
}
