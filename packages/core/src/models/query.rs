//! Query, Update and Option Types
//!
//! The canonical query dialect understood by both adapters. Queries are
//! expressed in document-style (camelCase) field names; adapters translate
//! to backend naming internally.
//!
//! # Dialect
//!
//! `Query::from_json` accepts the familiar operator-object form:
//!
//! ```rust
//! # use unistore_core::models::Query;
//! # use serde_json::json;
//! let q = Query::from_json(&json!({
//!     "role": "user",
//!     "tokenCount": {"$gte": 10, "$lt": 500},
//!     "$or": [{"archived": false}, {"pinned": true}]
//! }))
//! .unwrap();
//! assert_eq!(q.fields.len(), 2);
//! ```
//!
//! Operators outside the supported set are rejected with
//! `StoreError::QueryTranslation` instead of being compared as opaque JSON.

use crate::db::StoreError;
use crate::models::document::{
    now_timestamp, Document, INDEXED_AT_FIELD, INDEXED_FIELD, UPDATED_AT_FIELD,
};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Predicate applied to a single field
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    /// `true`: field present and not null; `false`: absent or null
    Exists(bool),
    /// Substring match
    Contains {
        needle: String,
        case_insensitive: bool,
    },
    /// Every inner predicate must hold (e.g. `{"$gt": 1, "$lt": 5}`)
    And(Vec<Filter>),
}

impl Filter {
    /// Case-insensitive substring match
    pub fn contains_ci(needle: impl Into<String>) -> Self {
        Self::Contains {
            needle: needle.into(),
            case_insensitive: true,
        }
    }

    fn from_operator_object(field: &str, ops: &Map<String, Value>) -> Result<Self, StoreError> {
        let case_insensitive = match ops.get("$options") {
            None => false,
            Some(Value::String(o)) if o.is_empty() || o == "i" => o == "i",
            Some(other) => {
                return Err(StoreError::translation(format!(
                    "unsupported $options {} on field '{}'",
                    other, field
                )))
            }
        };

        let mut filters = Vec::new();
        for (op, value) in ops {
            let filter = match op.as_str() {
                "$eq" => Filter::Eq(value.clone()),
                "$ne" => Filter::Ne(value.clone()),
                "$gt" => Filter::Gt(value.clone()),
                "$gte" => Filter::Gte(value.clone()),
                "$lt" => Filter::Lt(value.clone()),
                "$lte" => Filter::Lte(value.clone()),
                "$in" => Filter::In(expect_array(field, op, value)?),
                "$nin" => Filter::NotIn(expect_array(field, op, value)?),
                "$exists" => match value {
                    Value::Bool(b) => Filter::Exists(*b),
                    _ => {
                        return Err(StoreError::translation(format!(
                            "$exists on '{}' expects a boolean",
                            field
                        )))
                    }
                },
                "$contains" => Filter::Contains {
                    needle: expect_string(field, op, value)?,
                    case_insensitive,
                },
                "$regex" => {
                    let pattern = expect_string(field, op, value)?;
                    if pattern.chars().any(is_regex_meta) {
                        return Err(StoreError::translation(format!(
                            "$regex on '{}' only supports literal substrings, got '{}'",
                            field, pattern
                        )));
                    }
                    Filter::Contains {
                        needle: pattern,
                        case_insensitive,
                    }
                }
                "$options" => continue,
                other => {
                    return Err(StoreError::translation(format!(
                        "unsupported operator '{}' on field '{}'",
                        other, field
                    )))
                }
            };
            filters.push(filter);
        }

        match filters.len() {
            0 => Err(StoreError::translation(format!(
                "empty operator object on field '{}'",
                field
            ))),
            1 => Ok(filters.remove(0)),
            _ => Ok(Filter::And(filters)),
        }
    }
}

fn is_regex_meta(c: char) -> bool {
    matches!(
        c,
        '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\'
    )
}

fn expect_array(field: &str, op: &str, value: &Value) -> Result<Vec<Value>, StoreError> {
    value.as_array().cloned().ok_or_else(|| {
        StoreError::translation(format!("{} on '{}' expects an array", op, field))
    })
}

fn expect_string(field: &str, op: &str, value: &Value) -> Result<String, StoreError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| StoreError::translation(format!("{} on '{}' expects a string", op, field)))
}

/// Check that a field path is made of identifier segments (`a`, `a.b_c`).
///
/// Both translators embed field names in statement text, so anything else
/// is rejected before it reaches a backend.
pub fn check_field_path(path: &str) -> Result<(), StoreError> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::translation(format!(
            "invalid field name '{}'",
            path
        )))
    }
}

/// Conjunction of field predicates with optional `$or` / `$and` groups
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Field predicates, kept sorted so translation is deterministic
    pub fields: BTreeMap<String, Filter>,
    /// At least one of these sub-queries must match
    pub any_of: Vec<Query>,
    /// Every one of these sub-queries must match
    pub all_of: Vec<Query>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query matching a single canonical identifier
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq(crate::models::ID_FIELD, Value::String(id.into()))
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Filter::Eq(value.into()))
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Filter::Ne(value.into()))
    }

    /// Add a predicate; a second predicate on the same field is AND-ed in
    pub fn filter(mut self, field: impl Into<String>, filter: Filter) -> Self {
        let field = field.into();
        let merged = match self.fields.remove(&field) {
            None => filter,
            Some(Filter::And(mut existing)) => {
                existing.push(filter);
                Filter::And(existing)
            }
            Some(existing) => Filter::And(vec![existing, filter]),
        };
        self.fields.insert(field, merged);
        self
    }

    pub fn or(mut self, alternatives: Vec<Query>) -> Self {
        self.any_of.extend(alternatives);
        self
    }

    pub fn and(mut self, clauses: Vec<Query>) -> Self {
        self.all_of.extend(clauses);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.any_of.is_empty() && self.all_of.is_empty()
    }

    /// Top-level equality predicates as a document, used to seed upserts
    pub fn equality_fields(&self) -> Document {
        self.fields
            .iter()
            .filter_map(|(field, filter)| match filter {
                Filter::Eq(value) => Some((field.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Parse the operator-object dialect
    pub fn from_json(value: &Value) -> Result<Self, StoreError> {
        let obj = value
            .as_object()
            .ok_or_else(|| StoreError::translation("query must be a JSON object"))?;
        Self::from_document(obj)
    }

    pub fn from_document(obj: &Document) -> Result<Self, StoreError> {
        let mut query = Query::new();
        for (key, value) in obj {
            match key.as_str() {
                "$or" | "$and" => {
                    let items = value.as_array().ok_or_else(|| {
                        StoreError::translation(format!("{} expects an array of queries", key))
                    })?;
                    let parsed = items
                        .iter()
                        .map(Query::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    if key == "$or" {
                        query.any_of.extend(parsed);
                    } else {
                        query.all_of.extend(parsed);
                    }
                }
                k if k.starts_with('$') => {
                    return Err(StoreError::translation(format!(
                        "unsupported top-level operator '{}'",
                        k
                    )))
                }
                field => {
                    check_field_path(field)?;
                    let filter = match value {
                        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                            if !ops.keys().all(|k| k.starts_with('$')) {
                                return Err(StoreError::translation(format!(
                                    "field '{}' mixes operators and plain keys",
                                    field
                                )));
                            }
                            Filter::from_operator_object(field, ops)?
                        }
                        other => Filter::Eq(other.clone()),
                    };
                    query = query.filter(field, filter);
                }
            }
        }
        Ok(query)
    }
}

/// Field modifications applied by update operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    /// Fields overwritten with new values (`$set`)
    pub set: Document,
    /// Numeric fields incremented by a delta (`$inc`)
    pub inc: BTreeMap<String, Number>,
    /// Fields removed / nulled (`$unset`)
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn inc(mut self, field: impl Into<String>, delta: impl Into<Number>) -> Self {
        self.inc.insert(field.into(), delta.into());
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty() && self.unset.is_empty()
    }

    /// Every field name this update touches
    pub fn touched_fields(&self) -> impl Iterator<Item = &str> {
        self.set
            .keys()
            .map(String::as_str)
            .chain(self.inc.keys().map(String::as_str))
            .chain(self.unset.iter().map(String::as_str))
    }

    /// Copy that also refreshes `updatedAt`
    ///
    /// Left alone when the caller writes `updatedAt` itself or only touches
    /// the search-sync markers.
    pub fn touched(&self) -> Update {
        let mut update = self.clone();
        let explicit = update.touched_fields().any(|f| f == UPDATED_AT_FIELD);
        let markers_only = update
            .touched_fields()
            .all(|f| f == INDEXED_FIELD || f == INDEXED_AT_FIELD);
        if !explicit && !markers_only {
            update
                .set
                .insert(UPDATED_AT_FIELD.to_string(), Value::String(now_timestamp()));
        }
        update
    }

    /// Parse `{"$set": {...}, "$inc": {...}, "$unset": [...]}` or a plain document
    pub fn from_json(value: &Value) -> Result<Self, StoreError> {
        let obj = value
            .as_object()
            .ok_or_else(|| StoreError::translation("update must be a JSON object"))?;
        if !obj.keys().any(|k| k.starts_with('$')) {
            return Ok(Self::from(obj.clone()));
        }

        let mut update = Update::new();
        for (key, value) in obj {
            match key.as_str() {
                "$set" => {
                    let fields = value.as_object().ok_or_else(|| {
                        StoreError::translation("$set expects an object")
                    })?;
                    update.set.extend(fields.clone());
                }
                "$inc" => {
                    let fields = value.as_object().ok_or_else(|| {
                        StoreError::translation("$inc expects an object")
                    })?;
                    for (field, delta) in fields {
                        let n = match delta {
                            Value::Number(n) => n.clone(),
                            _ => {
                                return Err(StoreError::translation(format!(
                                    "$inc on '{}' expects a number",
                                    field
                                )))
                            }
                        };
                        update.inc.insert(field.clone(), n);
                    }
                }
                "$unset" => match value {
                    Value::Array(items) => {
                        for item in items {
                            let field = item.as_str().ok_or_else(|| {
                                StoreError::translation("$unset array expects field names")
                            })?;
                            update.unset.push(field.to_string());
                        }
                    }
                    Value::Object(fields) => update.unset.extend(fields.keys().cloned()),
                    _ => return Err(StoreError::translation("$unset expects an array or object")),
                },
                other => {
                    return Err(StoreError::translation(format!(
                        "unsupported update operator '{}'",
                        other
                    )))
                }
            }
        }
        for field in update.touched_fields() {
            check_field_path(field)?;
        }
        Ok(update)
    }

    /// Apply this update to an in-memory document
    pub fn apply_to(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            doc.insert(field.clone(), value.clone());
        }
        for (field, delta) in &self.inc {
            let current = match doc.get(field) {
                Some(Value::Number(n)) => Some(n.clone()),
                _ => None,
            };
            doc.insert(field.clone(), Value::Number(add_numbers(current.as_ref(), delta)));
        }
        for field in &self.unset {
            doc.insert(field.clone(), Value::Null);
        }
    }
}

impl From<Document> for Update {
    fn from(set: Document) -> Self {
        Self {
            set,
            ..Self::default()
        }
    }
}

fn add_numbers(current: Option<&Number>, delta: &Number) -> Number {
    let current = current.cloned().unwrap_or_else(|| Number::from(0));
    match (current.as_i64(), delta.as_i64()) {
        (Some(a), Some(b)) => Number::from(a.saturating_add(b)),
        _ => {
            let sum = current.as_f64().unwrap_or(0.0) + delta.as_f64().unwrap_or(0.0);
            Number::from_f64(sum).unwrap_or_else(|| Number::from(0))
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Relation-expansion hint: replace `path` (a reference id) with the
/// referenced document from `collection`. Honored by the document backend only.
#[derive(Debug, Clone, PartialEq)]
pub struct Populate {
    pub path: String,
    pub collection: String,
}

/// Sort, paging, projection and population options for reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub projection: Option<Vec<String>>,
    pub populate: Vec<Populate>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn populate(mut self, path: impl Into<String>, collection: impl Into<String>) -> Self {
        self.populate.push(Populate {
            path: path.into(),
            collection: collection.into(),
        });
        self
    }
}

/// Aggregation accumulator
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

impl Accumulator {
    /// Field the accumulator reads, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Accumulator::Count => None,
            Accumulator::Sum(f) | Accumulator::Avg(f) | Accumulator::Min(f) | Accumulator::Max(f) => {
                Some(f)
            }
        }
    }
}

/// Grouped aggregation: `filter`, optional `group_by`, named accumulators.
///
/// Each result row carries the group value under `_id` (null when ungrouped)
/// and one field per accumulator alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSpec {
    pub filter: Query,
    pub group_by: Option<String>,
    pub accumulators: Vec<(String, Accumulator)>,
}

impl AggregateSpec {
    pub fn new(filter: Query) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    pub fn accumulate(mut self, alias: impl Into<String>, accumulator: Accumulator) -> Self {
        self.accumulators.push((alias.into(), accumulator));
        self
    }

    pub(crate) fn check(&self) -> Result<(), StoreError> {
        if self.accumulators.is_empty() {
            return Err(StoreError::translation(
                "aggregate requires at least one accumulator",
            ));
        }
        if let Some(group) = &self.group_by {
            check_field_path(group)?;
        }
        for (alias, acc) in &self.accumulators {
            check_field_path(alias)?;
            if alias == crate::models::ID_FIELD {
                return Err(StoreError::translation("accumulator alias '_id' is reserved"));
            }
            if let Some(field) = acc.field() {
                check_field_path(field)?;
            }
        }
        Ok(())
    }
}

/// Options for `find_one_and_update`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOneAndUpdateOptions {
    /// Create the record from query equality fields + update when absent
    pub upsert: bool,
}
