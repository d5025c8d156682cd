//! Canonical document representation shared by both backends.

use serde_json::{Map, Value};

/// One record, independent of backend: field name → JSON value.
pub type Document = Map<String, Value>;

/// Canonical identifier field present on every document handed to callers
pub const ID_FIELD: &str = "_id";

/// Creation timestamp (RFC3339, UTC)
pub const CREATED_AT_FIELD: &str = "createdAt";

/// Last-modification timestamp (RFC3339, UTC)
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Search-sync marker: whether the document is mirrored in the search index
pub const INDEXED_FIELD: &str = "indexed";

/// Search-sync marker: when the document was last mirrored
pub const INDEXED_AT_FIELD: &str = "indexedAt";

/// Read the canonical identifier of a document as a string.
///
/// Numeric identifiers are rendered in decimal so callers always compare
/// strings, regardless of which backend produced the document.
pub fn document_id(doc: &Document) -> Option<String> {
    match doc.get(ID_FIELD)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Current time as an RFC3339 string, the timestamp format used everywhere
pub fn now_timestamp() -> String {
    format_timestamp(chrono::Utc::now())
}

/// Fixed-width RFC3339 (microseconds, `Z`), so stored timestamps sort as text
pub fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Fill `createdAt` and `updatedAt` on a new record, keeping caller values
pub fn stamp_created(doc: &mut Document) {
    let now = now_timestamp();
    doc.entry(UPDATED_AT_FIELD)
        .or_insert_with(|| Value::String(now.clone()));
    doc.entry(CREATED_AT_FIELD).or_insert(Value::String(now));
}

/// Build a `Document` from a `json!` object literal.
///
/// Non-object values yield an empty document.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_id_renders_numbers_as_strings() {
        let d = doc(json!({"_id": 42}));
        assert_eq!(document_id(&d).as_deref(), Some("42"));

        let d = doc(json!({"_id": "abc"}));
        assert_eq!(document_id(&d).as_deref(), Some("abc"));

        let d = doc(json!({"name": "no id"}));
        assert!(document_id(&d).is_none());
    }

    #[test]
    fn timestamps_sort_as_text() {
        let earlier = chrono::Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1500);
        assert!(format_timestamp(earlier) < format_timestamp(later));
        assert!(format_timestamp(earlier).ends_with('Z'));
    }

    #[test]
    fn doc_ignores_non_objects() {
        assert!(doc(json!([1, 2, 3])).is_empty());
    }

    #[test]
    fn stamp_created_keeps_caller_timestamps() {
        let mut fresh = doc(json!({"title": "t"}));
        stamp_created(&mut fresh);
        assert_eq!(fresh.get(CREATED_AT_FIELD), fresh.get(UPDATED_AT_FIELD));
        assert!(fresh.get(CREATED_AT_FIELD).is_some_and(Value::is_string));

        let mut imported = doc(json!({"createdAt": "2020-01-01T00:00:00.000000Z"}));
        stamp_created(&mut imported);
        assert_eq!(imported["createdAt"], json!("2020-01-01T00:00:00.000000Z"));
        assert_ne!(imported["updatedAt"], imported["createdAt"]);
    }
}
