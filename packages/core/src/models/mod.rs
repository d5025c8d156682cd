//! Data Models
//!
//! Backend-agnostic data structures shared by adapters and repositories:
//!
//! - `Document` - canonical record (`_id` + camelCase fields)
//! - `Query` / `Filter` / `Update` - the canonical query dialect
//! - `QueryOptions` / `AggregateSpec` - read shaping
//! - `PageRequest` / `Paginated` - repository pagination
//! - `ValidationError` - repository rule violations
//! - [`collections`] - the known logical collection names

pub mod collections;
mod document;
mod pagination;
mod query;
mod validation;

pub use document::{
    doc, document_id, format_timestamp, now_timestamp, stamp_created, Document, CREATED_AT_FIELD,
    ID_FIELD, INDEXED_AT_FIELD, INDEXED_FIELD, UPDATED_AT_FIELD,
};
pub use pagination::{
    PageRequest, Paginated, PaginationInfo, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};
pub use query::{
    check_field_path, Accumulator, AggregateSpec, Filter, FindOneAndUpdateOptions, Populate,
    Query, QueryOptions, SortOrder, Update,
};
pub use validation::ValidationError;
