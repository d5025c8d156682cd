//! Query → SQL Translation
//!
//! Turns canonical `Query` values into SQLite `WHERE` fragments with
//! positional `?` parameters. Values are never interpolated into statement
//! text; field names are validated identifiers mapped through
//! [`naming`](crate::db::naming) and double-quoted.
//!
//! # Translation Rules
//!
//! | Filter | SQL |
//! |--------|-----|
//! | `Eq(v)` | `col = ?` (`IS NULL` for null) |
//! | `Ne(v)` | `(col <> ? OR col IS NULL)` |
//! | `Gt/Gte/Lt/Lte` | `col > ?` … |
//! | `In([..])` | `col IN (?, ?)`; empty set matches nothing |
//! | `NotIn([..])` | `(col NOT IN (?, ?) OR col IS NULL)` |
//! | `Exists(b)` | `col IS [NOT] NULL` |
//! | `Contains` | `instr(col, ?) > 0`, or `LOWER(col) LIKE LOWER(?)` case-insensitively |
//!
//! Dotted paths (`metadata.source`) address JSON columns via
//! `json_extract(col, ?)` with the path bound as a parameter.

use crate::db::error::{StoreError, StoreResult};
use crate::db::naming::{IdKind, TableSpec};
use crate::models::{
    check_field_path, Accumulator, AggregateSpec, Filter, Query, SortOrder, ID_FIELD,
};
use libsql::Value as SqlValue;
use serde_json::{Number, Value};

/// A statement fragment together with its bound parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Translator bound to one table layout
#[derive(Debug, Clone, Copy)]
pub struct SqlTranslator {
    spec: &'static TableSpec,
}

impl SqlTranslator {
    pub fn new(spec: &'static TableSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &'static TableSpec {
        self.spec
    }

    /// Quoted table name
    pub fn table(&self) -> String {
        quote_ident(self.spec.table)
    }

    /// `" WHERE …"` for a non-empty query, empty string otherwise
    pub fn where_clause(&self, query: &Query) -> StoreResult<SqlFragment> {
        let mut params = Vec::new();
        match self.translate_query(query, &mut params)? {
            Some(condition) => Ok(SqlFragment {
                sql: format!(" WHERE {}", condition),
                params,
            }),
            None => Ok(SqlFragment::default()),
        }
    }

    fn translate_query(
        &self,
        query: &Query,
        params: &mut Vec<SqlValue>,
    ) -> StoreResult<Option<String>> {
        let mut parts = Vec::new();

        for (field, filter) in &query.fields {
            parts.push(self.translate_filter(field, filter, params)?);
        }

        for clause in &query.all_of {
            if let Some(sql) = self.translate_query(clause, params)? {
                parts.push(sql);
            }
        }

        if !query.any_of.is_empty() {
            let mut alternatives = Vec::with_capacity(query.any_of.len());
            for alternative in &query.any_of {
                alternatives.push(
                    self.translate_query(alternative, params)?
                        .unwrap_or_else(|| "1 = 1".to_string()),
                );
            }
            parts.push(format!("({})", alternatives.join(" OR ")));
        }

        if parts.is_empty() {
            Ok(None)
        } else if parts.len() == 1 {
            Ok(parts.pop())
        } else {
            Ok(Some(parts.join(" AND ")))
        }
    }

    fn translate_filter(
        &self,
        field: &str,
        filter: &Filter,
        params: &mut Vec<SqlValue>,
    ) -> StoreResult<String> {
        let sql = match filter {
            Filter::Eq(Value::Null) => format!("{} IS NULL", self.target(field, params)?),
            Filter::Ne(Value::Null) => format!("{} IS NOT NULL", self.target(field, params)?),
            Filter::Eq(value) => {
                let target = self.target(field, params)?;
                params.push(self.filter_value(field, value)?);
                format!("{} = ?", target)
            }
            Filter::Ne(value) => {
                let target = self.target(field, params)?;
                params.push(self.filter_value(field, value)?);
                // NULL <> x is NULL in SQL; missing values count as "not equal"
                let again = self.target(field, params)?;
                format!("({} <> ? OR {} IS NULL)", target, again)
            }
            Filter::Gt(value) => self.comparison(field, ">", value, params)?,
            Filter::Gte(value) => self.comparison(field, ">=", value, params)?,
            Filter::Lt(value) => self.comparison(field, "<", value, params)?,
            Filter::Lte(value) => self.comparison(field, "<=", value, params)?,
            Filter::In(values) => {
                if values.is_empty() {
                    return Ok("0 = 1".to_string());
                }
                let target = self.target(field, params)?;
                let (placeholders, has_null) = self.value_list(field, values, params)?;
                match (placeholders.is_empty(), has_null) {
                    (true, _) => format!("{} IS NULL", target),
                    (false, false) => format!("{} IN ({})", target, placeholders.join(", ")),
                    (false, true) => {
                        let again = self.target(field, params)?;
                        format!(
                            "({} IN ({}) OR {} IS NULL)",
                            target,
                            placeholders.join(", "),
                            again
                        )
                    }
                }
            }
            Filter::NotIn(values) => {
                if values.is_empty() {
                    return Ok("1 = 1".to_string());
                }
                let target = self.target(field, params)?;
                let (placeholders, has_null) = self.value_list(field, values, params)?;
                match (placeholders.is_empty(), has_null) {
                    (true, _) => format!("{} IS NOT NULL", target),
                    (false, true) => {
                        let again = self.target(field, params)?;
                        format!(
                            "({} NOT IN ({}) AND {} IS NOT NULL)",
                            target,
                            placeholders.join(", "),
                            again
                        )
                    }
                    (false, false) => {
                        let again = self.target(field, params)?;
                        format!(
                            "({} NOT IN ({}) OR {} IS NULL)",
                            target,
                            placeholders.join(", "),
                            again
                        )
                    }
                }
            }
            Filter::Exists(true) => format!("{} IS NOT NULL", self.target(field, params)?),
            Filter::Exists(false) => format!("{} IS NULL", self.target(field, params)?),
            Filter::Contains {
                needle,
                case_insensitive,
            } => {
                let target = self.target(field, params)?;
                if *case_insensitive {
                    params.push(SqlValue::Text(format!("%{}%", escape_like(needle))));
                    format!("LOWER({}) LIKE LOWER(?) ESCAPE '\\'", target)
                } else {
                    params.push(SqlValue::Text(needle.clone()));
                    format!("instr({}, ?) > 0", target)
                }
            }
            Filter::And(filters) => {
                if filters.is_empty() {
                    return Err(StoreError::translation(format!(
                        "empty conjunction on field '{}'",
                        field
                    )));
                }
                let mut parts = Vec::with_capacity(filters.len());
                for inner in filters {
                    parts.push(self.translate_filter(field, inner, params)?);
                }
                format!("({})", parts.join(" AND "))
            }
        };
        Ok(sql)
    }

    fn comparison(
        &self,
        field: &str,
        op: &str,
        value: &Value,
        params: &mut Vec<SqlValue>,
    ) -> StoreResult<String> {
        if value.is_null() {
            return Err(StoreError::translation(format!(
                "cannot order-compare '{}' against null",
                field
            )));
        }
        let target = self.target(field, params)?;
        params.push(self.filter_value(field, value)?);
        Ok(format!("{} {} ?", target, op))
    }

    /// One placeholder per non-null value; reports whether null was listed
    fn value_list(
        &self,
        field: &str,
        values: &[Value],
        params: &mut Vec<SqlValue>,
    ) -> StoreResult<(Vec<&'static str>, bool)> {
        let mut placeholders = Vec::new();
        let mut has_null = false;
        for value in values {
            if value.is_null() {
                has_null = true;
                continue;
            }
            params.push(self.filter_value(field, value)?);
            placeholders.push("?");
        }
        Ok((placeholders, has_null))
    }

    /// Column expression for a canonical field path
    ///
    /// JSON columns hold encoded text, so whole-column comparisons go through
    /// `json_extract` to compare the decoded value.
    fn target(&self, field: &str, params: &mut Vec<SqlValue>) -> StoreResult<String> {
        check_field_path(field)?;
        match field.split_once('.') {
            None => {
                let column = self.spec.column_for(field);
                if self.spec.is_json_column(&column) {
                    Ok(format!("json_extract({}, '$')", quote_ident(&column)))
                } else {
                    Ok(quote_ident(&column))
                }
            }
            Some((head, rest)) => {
                let column = self.spec.column_for(head);
                params.push(SqlValue::Text(format!("$.{}", rest)));
                Ok(format!("json_extract({}, ?)", quote_ident(&column)))
            }
        }
    }

    /// Convert a filter operand, resolving numeric string ids on integer-keyed tables
    fn filter_value(&self, field: &str, value: &Value) -> StoreResult<SqlValue> {
        if field == ID_FIELD && self.spec.id_kind == IdKind::Integer {
            if let Value::String(s) = value {
                if let Ok(n) = s.parse::<i64>() {
                    return Ok(SqlValue::Integer(n));
                }
            }
        }
        match value {
            Value::Array(_) | Value::Object(_) => Err(StoreError::translation(format!(
                "cannot compare '{}' against a structured value",
                field
            ))),
            other => Ok(json_to_sql(other)),
        }
    }

    /// `" ORDER BY …"` or empty
    pub fn order_by(&self, sort: &[(String, SortOrder)]) -> StoreResult<String> {
        if sort.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(sort.len());
        for (field, order) in sort {
            check_field_path(field)?;
            if field.contains('.') {
                return Err(StoreError::translation(format!(
                    "sorting on nested path '{}' is not supported",
                    field
                )));
            }
            parts.push(format!(
                "{} {}",
                quote_ident(&self.spec.column_for(field)),
                order.as_keyword()
            ));
        }
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    /// Select list for an optional projection; the identifier column is always included
    pub fn select_list(&self, projection: Option<&[String]>) -> StoreResult<String> {
        let Some(fields) = projection else {
            return Ok("*".to_string());
        };
        let mut columns = vec![quote_ident(self.spec.id_column)];
        for field in fields {
            check_field_path(field)?;
            if field.contains('.') {
                return Err(StoreError::translation(format!(
                    "projection of nested path '{}' is not supported",
                    field
                )));
            }
            let column = quote_ident(&self.spec.column_for(field));
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        Ok(columns.join(", "))
    }

    /// `SELECT` statement for an aggregation, with its parameters
    pub fn aggregate(&self, spec: &AggregateSpec) -> StoreResult<SqlFragment> {
        spec.check()?;
        let where_clause = self.where_clause(&spec.filter)?;

        let mut select = Vec::new();
        let group_column = match &spec.group_by {
            Some(group) => {
                if group.contains('.') {
                    return Err(StoreError::translation(format!(
                        "grouping on nested path '{}' is not supported",
                        group
                    )));
                }
                let column = quote_ident(&self.spec.column_for(group));
                select.push(format!("{} AS {}", column, quote_ident(ID_FIELD)));
                Some(column)
            }
            None => {
                select.push(format!("NULL AS {}", quote_ident(ID_FIELD)));
                None
            }
        };

        for (alias, acc) in &spec.accumulators {
            let expr = match acc {
                Accumulator::Count => "COUNT(*)".to_string(),
                Accumulator::Sum(f) => format!("TOTAL({})", self.aggregate_column(f)?),
                Accumulator::Avg(f) => format!("AVG({})", self.aggregate_column(f)?),
                Accumulator::Min(f) => format!("MIN({})", self.aggregate_column(f)?),
                Accumulator::Max(f) => format!("MAX({})", self.aggregate_column(f)?),
            };
            select.push(format!("{} AS {}", expr, quote_ident(alias)));
        }

        let mut sql = format!(
            "SELECT {} FROM {}{}",
            select.join(", "),
            self.table(),
            where_clause.sql
        );
        if let Some(column) = group_column {
            sql.push_str(&format!(" GROUP BY {} ORDER BY {}", column, column));
        }
        Ok(SqlFragment {
            sql,
            params: where_clause.params,
        })
    }

    fn aggregate_column(&self, field: &str) -> StoreResult<String> {
        if field.contains('.') {
            return Err(StoreError::translation(format!(
                "aggregating nested path '{}' is not supported",
                field
            )));
        }
        Ok(quote_ident(&self.spec.column_for(field)))
    }

    /// Convert a document value for storage in `column`
    pub fn write_value(&self, column: &str, value: &Value) -> StoreResult<SqlValue> {
        if column == self.spec.id_column && self.spec.id_kind == IdKind::Integer {
            if let Value::String(s) = value {
                return s
                    .parse::<i64>()
                    .map(SqlValue::Integer)
                    .map_err(|_| StoreError::serialization(format!("invalid integer id '{}'", s)));
            }
        }
        Ok(match value {
            Value::Null => SqlValue::Null,
            v if self.spec.is_json_column(column) => SqlValue::Text(serde_json::to_string(v)?),
            Value::Array(_) | Value::Object(_) => SqlValue::Text(serde_json::to_string(value)?),
            other => json_to_sql(other),
        })
    }

    /// Convert a stored value in `column` back into a document value
    pub fn read_value(&self, column: &str, value: SqlValue) -> Value {
        match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) if column == self.spec.id_column => Value::String(i.to_string()),
            SqlValue::Integer(i) if self.spec.is_bool_column(column) => Value::Bool(i != 0),
            SqlValue::Integer(i) => Value::Number(Number::from(i)),
            SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            SqlValue::Text(s) if self.spec.is_json_column(column) => {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            }
            SqlValue::Text(s) => Value::String(s),
            SqlValue::Blob(bytes) => {
                Value::Array(bytes.into_iter().map(|b| Value::Number(b.into())).collect())
            }
        }
    }
}

/// Scalar JSON → SQL value (booleans become 0/1)
fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Double-quote an identifier (identifiers are pre-validated)
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape LIKE wildcards for use with `ESCAPE '\'`
fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Count `?` placeholders outside string literals
pub fn placeholder_count(sql: &str) -> usize {
    let mut count = 0;
    let mut in_literal = false;
    for c in sql.chars() {
        match c {
            '\'' => in_literal = !in_literal,
            '?' if !in_literal => count += 1,
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::naming::table_spec;
    use serde_json::json;

    fn translator(collection: &str) -> SqlTranslator {
        SqlTranslator::new(table_spec(collection).unwrap())
    }

    fn assert_balanced(fragment: &SqlFragment) {
        assert_eq!(
            placeholder_count(&fragment.sql),
            fragment.params.len(),
            "placeholders vs params in: {}",
            fragment.sql
        );
    }

    #[test]
    fn empty_query_has_no_where_clause() {
        let fragment = translator("users").where_clause(&Query::new()).unwrap();
        assert!(fragment.sql.is_empty());
        assert!(fragment.params.is_empty());
    }

    #[test]
    fn scalar_equality_maps_field_names() {
        let q = Query::new().eq("userId", "u-1").eq("isArchived", false);
        let fragment = translator("conversations").where_clause(&q).unwrap();
        assert_eq!(
            fragment.sql,
            " WHERE \"is_archived\" = ? AND \"user_id\" = ?"
        );
        assert_eq!(
            fragment.params,
            vec![SqlValue::Integer(0), SqlValue::Text("u-1".into())]
        );
    }

    #[test]
    fn canonical_id_resolves_table_identifier() {
        let fragment = translator("conversations")
            .where_clause(&Query::by_id("c-1"))
            .unwrap();
        assert_eq!(fragment.sql, " WHERE \"conversation_id\" = ?");

        let fragment = translator("users").where_clause(&Query::by_id("7")).unwrap();
        assert_eq!(fragment.sql, " WHERE \"id\" = ?");
        assert_eq!(fragment.params, vec![SqlValue::Integer(7)]);
    }

    #[test]
    fn operators_produce_balanced_parameters() {
        let q = Query::from_json(&json!({
            "tokenCount": {"$gte": 5, "$lt": 50},
            "role": {"$in": ["user", "assistant"]},
            "status": {"$nin": ["deleted"]},
            "metadata.source": {"$ne": "import"},
            "content": {"$regex": "Hello", "$options": "i"},
            "$or": [{"userId": "a"}, {"userId": {"$exists": false}}]
        }))
        .unwrap();
        let fragment = translator("messages").where_clause(&q).unwrap();
        assert_balanced(&fragment);
        assert!(fragment.sql.contains("json_extract(\"metadata\", ?)"));
        assert!(fragment.sql.contains("LOWER(\"content\") LIKE LOWER(?)"));
        assert!(fragment.sql.contains("\"role\" IN (?, ?)"));
    }

    #[test]
    fn nested_path_in_list_keeps_parameter_order() {
        let q = Query::new().filter(
            "metadata.source",
            Filter::In(vec![json!("web"), json!("api")]),
        );
        let fragment = translator("messages").where_clause(&q).unwrap();
        assert_eq!(
            fragment.sql,
            " WHERE json_extract(\"metadata\", ?) IN (?, ?)"
        );
        assert_eq!(
            fragment.params,
            vec![
                SqlValue::Text("$.source".into()),
                SqlValue::Text("web".into()),
                SqlValue::Text("api".into()),
            ]
        );
    }

    #[test]
    fn field_order_does_not_change_translation() {
        let a = Query::from_json(&json!({"role": "user", "userId": "u"})).unwrap();
        let b = Query::new().eq("userId", "u").eq("role", "user");
        let t = translator("messages");
        assert_eq!(t.where_clause(&a).unwrap(), t.where_clause(&b).unwrap());
    }

    #[test]
    fn empty_in_matches_nothing() {
        let q = Query::new().filter("role", Filter::In(vec![]));
        let fragment = translator("messages").where_clause(&q).unwrap();
        assert_eq!(fragment.sql, " WHERE 0 = 1");
        assert_balanced(&fragment);
    }

    #[test]
    fn null_equality_uses_is_null() {
        let q = Query::new().eq("readAt", Value::Null);
        let fragment = translator("notifications").where_clause(&q).unwrap();
        assert_eq!(fragment.sql, " WHERE \"read_at\" IS NULL");
    }

    #[test]
    fn structured_equality_is_rejected() {
        let q = Query::new().eq("metadata", json!({"a": 1}));
        let err = translator("messages").where_clause(&q).unwrap_err();
        assert!(matches!(err, StoreError::QueryTranslation(_)));
    }

    #[test]
    fn like_wildcards_are_escaped() {
        let q = Query::new().filter("content", Filter::contains_ci("50%_off"));
        let fragment = translator("messages").where_clause(&q).unwrap();
        assert_eq!(fragment.params, vec![SqlValue::Text("%50\\%\\_off%".into())]);
    }

    #[test]
    fn order_and_projection() {
        let t = translator("messages");
        assert_eq!(
            t.order_by(&[("createdAt".into(), SortOrder::Desc)]).unwrap(),
            " ORDER BY \"created_at\" DESC"
        );
        let projection = vec!["content".to_string(), "role".to_string()];
        assert_eq!(
            t.select_list(Some(&projection)).unwrap(),
            "\"message_id\", \"content\", \"role\""
        );
    }

    #[test]
    fn aggregate_groups_under_canonical_id() {
        let spec = AggregateSpec::new(Query::new().eq("userId", "u"))
            .group_by("model")
            .accumulate("total", Accumulator::Count)
            .accumulate("tokens", Accumulator::Sum("promptTokens".into()));
        let fragment = translator("usage_logs").aggregate(&spec).unwrap();
        assert_eq!(
            fragment.sql,
            "SELECT \"model\" AS \"_id\", COUNT(*) AS \"total\", TOTAL(\"prompt_tokens\") AS \"tokens\" \
             FROM \"usage_logs\" WHERE \"user_id\" = ? GROUP BY \"model\" ORDER BY \"model\""
        );
        assert_balanced(&fragment);
    }

    #[test]
    fn read_value_restores_types() {
        let t = translator("messages");
        assert_eq!(t.read_value("indexed", SqlValue::Integer(1)), json!(true));
        assert_eq!(
            t.read_value("metadata", SqlValue::Text("{\"a\":1}".into())),
            json!({"a": 1})
        );
        assert_eq!(t.read_value("token_count", SqlValue::Integer(3)), json!(3));

        let users = translator("users");
        assert_eq!(users.read_value("id", SqlValue::Integer(9)), json!("9"));
    }

    #[test]
    fn json_column_compares_decoded_value() {
        let q = Query::new()
            .eq("value", "dark")
            .filter("key", Filter::In(vec![json!("theme")]));
        let fragment = translator("settings").where_clause(&q).unwrap();
        assert_eq!(
            fragment.sql,
            " WHERE \"key\" IN (?) AND json_extract(\"value\", '$') = ?"
        );
        assert_eq!(
            fragment.params,
            vec![SqlValue::Text("theme".into()), SqlValue::Text("dark".into())]
        );
        assert_balanced(&fragment);
    }
}
