use crate::models::document::Document;
use crate::models::query::SortOrder;
use serde::Serialize;

/// Default page size when the caller does not specify one
pub const DEFAULT_PAGE_LIMIT: u64 = 20;

/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: u64 = 100;

/// Page request for `Repository::paginate` (pages are 1-based)
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub page: u64,
    pub limit: u64,
    pub sort: Vec<(String, SortOrder)>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            sort: Vec::new(),
        }
    }
}

impl PageRequest {
    pub fn new(page: u64, limit: u64) -> Self {
        Self {
            page,
            limit,
            sort: Vec::new(),
        }
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    /// Page and limit clamped into their valid ranges
    pub fn normalized(&self) -> (u64, u64) {
        let page = self.page.max(1);
        let limit = self.limit.clamp(1, MAX_PAGE_LIMIT);
        (page, limit)
    }
}

/// Pagination metadata returned alongside a page of records
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    pub pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationInfo {
    pub fn new(page: u64, limit: u64, total: u64) -> Self {
        let pages = if limit == 0 { 0 } else { total.div_ceil(limit) };
        Self {
            page,
            limit,
            total,
            pages,
            has_next: page < pages,
            has_prev: page > 1,
        }
    }
}

/// One page of records plus its metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paginated<T = Document> {
    pub data: Vec<T>,
    pub pagination: PaginationInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_arithmetic() {
        let info = PaginationInfo::new(1, 10, 25);
        assert_eq!(info.pages, 3);
        assert!(info.has_next);
        assert!(!info.has_prev);

        let info = PaginationInfo::new(3, 10, 25);
        assert!(!info.has_next);
        assert!(info.has_prev);

        let info = PaginationInfo::new(1, 10, 0);
        assert_eq!(info.pages, 0);
        assert!(!info.has_next);
    }

    #[test]
    fn page_request_is_clamped() {
        assert_eq!(PageRequest::new(0, 0).normalized(), (1, 1));
        assert_eq!(PageRequest::new(2, 5000).normalized(), (2, MAX_PAGE_LIMIT));
    }
}
