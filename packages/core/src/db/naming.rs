//! Collection and Field Name Mapping
//!
//! Static configuration that maps canonical (document-style) names to the
//! relational schema:
//!
//! - collection → table, identifier column, and column value kinds
//! - camelCase field → snake_case column, with a small override table for
//!   columns that do not follow the case transform
//!
//! `validate_mappings` runs when the relational adapter is constructed so a
//! collection without a table spec fails at startup rather than at the first
//! query that touches it.

use crate::db::error::{StoreError, StoreResult};
use crate::models::{collections, ID_FIELD};

/// How the identifier column is typed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// `INTEGER PRIMARY KEY AUTOINCREMENT`, assigned by the database
    Integer,
    /// Text identifier, generated as a UUID v4 when the caller omits it
    Text,
}

/// Relational layout of one logical collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub collection: &'static str,
    pub table: &'static str,
    /// Column rendered as the canonical `_id`
    pub id_column: &'static str,
    pub id_kind: IdKind,
    /// Columns holding serialized JSON (parsed back on read)
    pub json_columns: &'static [&'static str],
    /// Integer columns that carry booleans
    pub bool_columns: &'static [&'static str],
}

impl TableSpec {
    pub fn is_json_column(&self, column: &str) -> bool {
        self.json_columns.contains(&column)
    }

    pub fn is_bool_column(&self, column: &str) -> bool {
        self.bool_columns.contains(&column)
    }

    /// Column for a canonical top-level field name
    pub fn column_for(&self, field: &str) -> String {
        if field == ID_FIELD {
            self.id_column.to_string()
        } else {
            field_to_column(field)
        }
    }

    /// Canonical field for a column; `None` for columns hidden from documents
    pub fn field_for(&self, column: &str) -> Option<String> {
        if column == self.id_column {
            Some(ID_FIELD.to_string())
        } else if column == "id" {
            // Native row id on tables keyed by a domain identifier
            None
        } else {
            Some(column_to_field(column))
        }
    }
}

/// Collection → table layout
pub static TABLES: &[TableSpec] = &[
    TableSpec {
        collection: collections::USERS,
        table: "users",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["preferences"],
        bool_columns: &["is_active"],
    },
    TableSpec {
        collection: collections::CONVERSATIONS,
        table: "conversations",
        id_column: "conversation_id",
        id_kind: IdKind::Text,
        json_columns: &["metadata"],
        bool_columns: &["is_archived", "indexed"],
    },
    TableSpec {
        collection: collections::MESSAGES,
        table: "messages",
        id_column: "message_id",
        id_kind: IdKind::Text,
        json_columns: &["metadata"],
        bool_columns: &["indexed"],
    },
    TableSpec {
        collection: collections::KNOWLEDGE_BASES,
        table: "knowledge_bases",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["settings"],
        bool_columns: &["is_public"],
    },
    TableSpec {
        collection: collections::DOCUMENTS,
        table: "kb_documents",
        id_column: "document_id",
        id_kind: IdKind::Text,
        json_columns: &["metadata"],
        bool_columns: &["indexed"],
    },
    TableSpec {
        collection: collections::AGENTS,
        table: "agents",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["tools", "config"],
        bool_columns: &["is_active"],
    },
    TableSpec {
        collection: collections::TOOLS,
        table: "tools",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["parameters"],
        bool_columns: &["is_enabled"],
    },
    TableSpec {
        collection: collections::API_KEYS,
        table: "api_keys",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["scopes"],
        bool_columns: &["revoked"],
    },
    TableSpec {
        collection: collections::SESSIONS,
        table: "user_sessions",
        id_column: "token",
        id_kind: IdKind::Text,
        json_columns: &["data"],
        bool_columns: &[],
    },
    TableSpec {
        collection: collections::SETTINGS,
        table: "user_settings",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["value"],
        bool_columns: &[],
    },
    TableSpec {
        collection: collections::USAGE_LOGS,
        table: "usage_logs",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &[],
        bool_columns: &[],
    },
    TableSpec {
        collection: collections::FEEDBACK,
        table: "message_feedback",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["tags"],
        bool_columns: &[],
    },
    TableSpec {
        collection: collections::FILES,
        table: "files",
        id_column: "file_id",
        id_kind: IdKind::Text,
        json_columns: &["metadata"],
        bool_columns: &[],
    },
    TableSpec {
        collection: collections::NOTIFICATIONS,
        table: "notifications",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["data"],
        bool_columns: &["is_read"],
    },
    TableSpec {
        collection: collections::AUDIT_LOGS,
        table: "audit_logs",
        id_column: "id",
        id_kind: IdKind::Integer,
        json_columns: &["details"],
        bool_columns: &[],
    },
];

/// Field ↔ column pairs that do not follow the camel/snake transform
pub static FIELD_OVERRIDES: &[(&str, &str)] = &[
    ("knowledgeBaseId", "kb_id"),
    ("passwordHash", "password_digest"),
];

/// Table layout for a collection
pub fn table_spec(collection: &str) -> StoreResult<&'static TableSpec> {
    TABLES
        .iter()
        .find(|spec| spec.collection == collection)
        .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
}

/// Column name for a canonical field (top-level segment only)
pub fn field_to_column(field: &str) -> String {
    FIELD_OVERRIDES
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, c)| c.to_string())
        .unwrap_or_else(|| camel_to_snake(field))
}

/// Canonical field name for a column
pub fn column_to_field(column: &str) -> String {
    FIELD_OVERRIDES
        .iter()
        .find(|(_, c)| *c == column)
        .map(|(f, _)| f.to_string())
        .unwrap_or_else(|| snake_to_camel(column))
}

/// `messageCount` → `message_count`
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `message_count` → `messageCount`
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' && !out.is_empty() {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Startup self-check: every collection has exactly one well-formed table spec
pub fn validate_mappings(known: &[&str]) -> StoreResult<()> {
    for collection in known {
        let matches = TABLES.iter().filter(|s| s.collection == *collection).count();
        if matches != 1 {
            return Err(StoreError::connection(format!(
                "collection '{}' has {} table mappings, expected exactly one",
                collection, matches
            )));
        }
    }

    for spec in TABLES {
        if spec.table.is_empty() || spec.id_column.is_empty() {
            return Err(StoreError::connection(format!(
                "collection '{}' has an incomplete table mapping",
                spec.collection
            )));
        }
        let declared = spec.json_columns.iter().chain(spec.bool_columns.iter());
        for column in declared {
            if camel_to_snake(column) != *column {
                return Err(StoreError::connection(format!(
                    "column '{}' on table '{}' is not snake_case",
                    column, spec.table
                )));
            }
        }
    }

    for (field, column) in FIELD_OVERRIDES {
        if field_to_column(field) != *column || column_to_field(column) != *field {
            return Err(StoreError::connection(format!(
                "field override '{}' <-> '{}' is ambiguous",
                field, column
            )));
        }
    }
    Ok(())
}
