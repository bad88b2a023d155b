//! Offset pagination shared by every paginated read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive creation-time bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }
}

/// Page selection. `page` is zero-based.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationArgs {
    #[serde(default)]
    pub page: u32,
    pub per_page: Option<u32>,
    pub date_range: Option<DateRange>,
}

impl PaginationArgs {
    pub fn page(page: u32, per_page: u32) -> Self {
        Self {
            page,
            per_page: Some(per_page),
            date_range: None,
        }
    }

    pub fn with_date_range(mut self, date_range: DateRange) -> Self {
        self.date_range = Some(date_range);
        self
    }
}

/// One page of results plus the totals needed to fetch the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, per_page: u32) -> Self {
        let has_more = has_more(page, per_page, items.len(), total);
        Self {
            items,
            total,
            page,
            per_page,
            has_more,
        }
    }

    pub fn empty(page: u32, per_page: u32) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page,
            per_page,
            has_more: false,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            has_more: self.has_more,
        }
    }
}

/// Row offset of a page.
pub fn offset(page: u32, per_page: u32) -> u64 {
    u64::from(page) * u64::from(per_page)
}

/// `true` iff rows remain after this page.
pub fn has_more(page: u32, per_page: u32, returned: usize, total: u64) -> bool {
    offset(page, per_page) + (returned as u64) < total
}
