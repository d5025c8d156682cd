//! Per-collection index layout and document preparation.

use crate::models::{collections, Document, ID_FIELD};
use serde::Serialize;
use serde_json::{Map, Value};

/// Primary key attribute in every index
pub const INDEX_PRIMARY_KEY: &str = "id";

/// Attribute settings for one search index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSettings {
    pub searchable_attributes: &'static [&'static str],
    pub filterable_attributes: &'static [&'static str],
    pub sortable_attributes: &'static [&'static str],
}

impl IndexSettings {
    /// Every attribute copied into the index besides the primary key
    pub fn attributes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.searchable_attributes
            .iter()
            .chain(self.filterable_attributes)
            .chain(self.sortable_attributes)
            .copied()
    }
}

static SEARCHABLE: &[(&str, IndexSettings)] = &[
    (
        collections::MESSAGES,
        IndexSettings {
            searchable_attributes: &["content"],
            filterable_attributes: &["conversationId", "userId", "role"],
            sortable_attributes: &["createdAt"],
        },
    ),
    (
        collections::CONVERSATIONS,
        IndexSettings {
            searchable_attributes: &["title"],
            filterable_attributes: &["userId", "isArchived"],
            sortable_attributes: &["createdAt", "updatedAt"],
        },
    ),
    (
        collections::DOCUMENTS,
        IndexSettings {
            searchable_attributes: &["title", "content"],
            filterable_attributes: &["knowledgeBaseId", "userId", "status"],
            sortable_attributes: &["createdAt"],
        },
    ),
];

/// Index settings for a collection, `None` when it is not search-integrated
pub fn index_settings(collection: &str) -> Option<&'static IndexSettings> {
    SEARCHABLE
        .iter()
        .find(|(name, _)| *name == collection)
        .map(|(_, settings)| settings)
}

/// Collections mirrored into the search engine
pub fn searchable_collections() -> impl Iterator<Item = &'static str> {
    SEARCHABLE.iter().map(|(name, _)| *name)
}

/// Shape a stored document for the engine
///
/// Keeps only indexed attributes and renames `_id` to `id`. Returns `None`
/// for unsearchable collections and documents without an id.
pub fn prepare_for_indexing(collection: &str, doc: &Document) -> Option<Value> {
    let settings = index_settings(collection)?;
    let id = crate::models::document_id(doc)?;

    let mut prepared = Map::new();
    prepared.insert(INDEX_PRIMARY_KEY.to_string(), Value::String(id));
    for attribute in settings.attributes() {
        if attribute == ID_FIELD {
            continue;
        }
        if let Some(value) = doc.get(attribute) {
            if !value.is_null() {
                prepared.insert(attribute.to_string(), value.clone());
            }
        }
    }
    Some(Value::Object(prepared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::doc;
    use serde_json::json;

    #[test]
    fn test_prepare_renames_id_and_drops_unindexed_fields() {
        let message = doc(json!({
            "_id": "m1",
            "content": "hello",
            "conversationId": "c1",
            "metadata": {"raw": true},
            "model": null
        }));
        let prepared = prepare_for_indexing("messages", &message).unwrap();
        assert_eq!(
            prepared,
            json!({"id": "m1", "content": "hello", "conversationId": "c1"})
        );
    }

    #[test]
    fn test_unsearchable_collection_is_skipped() {
        assert!(index_settings("users").is_none());
        assert!(prepare_for_indexing("users", &doc(json!({"_id": "1"}))).is_none());
        assert_eq!(searchable_collections().count(), 3);
    }
}
