//! Offset pagination for list calls

use serde::{Deserialize, Serialize};

/// Maximum rows per page
const MAX_LIMIT: u32 = 1000;

/// Default rows per page
const DEFAULT_LIMIT: u32 = 10;

/// Pagination parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Rows per page (1..=1000)
    pub limit: u32,
    /// Rows to skip
    pub offset: u64,
}

impl Pagination {
    /// Create pagination with validation.
    ///
    /// A zero limit means "use the default"; larger limits are clamped.
    pub fn new(limit: u32, offset: u64) -> Self {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit.min(MAX_LIMIT) };
        Self { limit, offset }
    }

    /// LIMIT to send to the database: one extra row tells us whether a next page exists.
    pub fn fetch_limit(&self) -> i64 {
        i64::from(self.limit) + 1
    }

    /// OFFSET to send to the database.
    pub fn sql_offset(&self) -> i64 {
        i64::try_from(self.offset).unwrap_or(i64::MAX)
    }

    /// Pagination for the page after this one.
    pub fn next(&self) -> Self {
        Self {
            limit: self.limit,
            offset: self.offset + u64::from(self.limit),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    /// Items for current page
    pub items: Vec<T>,
    /// Offset of the next page, if there is one
    pub next_offset: Option<u64>,
}

impl<T> Paginated<T> {
    /// Build a page from rows fetched with `Pagination::fetch_limit`.
    pub fn from_rows(mut rows: Vec<T>, page: Pagination) -> Self {
        let has_next = rows.len() > page.limit as usize;
        if has_next {
            rows.truncate(page.limit as usize);
        }
        Self {
            items: rows,
            next_offset: has_next.then(|| page.next().offset),
        }
    }

    /// Check if there's a next page.
    pub fn has_next(&self) -> bool {
        self.next_offset.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_limit() {
        assert_eq!(Pagination::new(0, 0).limit, 10);
        assert_eq!(Pagination::new(5000, 0).limit, 1000);
        assert_eq!(Pagination::new(25, 0).limit, 25);
    }

    #[test]
    fn fetches_one_extra_row() {
        let p = Pagination::new(20, 40);
        assert_eq!(p.fetch_limit(), 21);
        assert_eq!(p.sql_offset(), 40);
        assert_eq!(p.next().offset, 60);
    }

    #[test]
    fn detects_next_page() {
        let page = Pagination::new(2, 0);
        let paginated = Paginated::from_rows(vec![1, 2, 3], page);
        assert_eq!(paginated.items, vec![1, 2]);
        assert_eq!(paginated.next_offset, Some(2));
        assert!(paginated.has_next());

        let paginated = Paginated::from_rows(vec![1, 2], page);
        assert_eq!(paginated.items, vec![1, 2]);
        assert!(!paginated.has_next());
    }
}
