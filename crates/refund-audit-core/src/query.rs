//! Windowed read access to a task's rows.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, ReviewError};
use crate::runtime::types::ReviewRow;

pub const MAX_PAGE_SIZE: u32 = 500;

/// Which rows a query covers. Ordering is always by row index.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RowScope {
    #[default]
    All,
    /// Rows with a final verdict (`ok` or `bad`).
    Processed,
    Pending,
}

/// A validated `(page, page_size)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Result<Self> {
        if page == 0 {
            return Err(ReviewError::Validation("page must be >= 1".into()));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ReviewError::Validation(format!(
                "page_size must be within 1..={MAX_PAGE_SIZE}"
            )));
        }
        Ok(Self { page, page_size })
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsPage {
    pub task_id: String,
    pub scope: RowScope,
    /// Source header row, in order.
    pub columns: Vec<String>,
    pub rows: Vec<ReviewRow>,
    /// Cardinality of the scope at query time.
    pub total_rows: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

/// Number of pages needed for `total_rows`; an empty scope still has one page.
pub fn total_pages(total_rows: u64, page_size: u32) -> u64 {
    total_rows.div_ceil(u64::from(page_size)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn page_bounds_are_validated() {
        assert!(PageRequest::new(0, 10).is_err());
        assert!(PageRequest::new(1, 0).is_err());
        assert!(PageRequest::new(1, 501).is_err());
        assert_eq!(PageRequest::new(3, 20).unwrap().offset(), 40);
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(total_pages(0, 20), 1);
        assert_eq!(total_pages(20, 20), 1);
        assert_eq!(total_pages(21, 20), 2);
    }

    #[test]
    fn scope_parses_from_cli_strings() {
        assert_eq!(RowScope::from_str("processed").unwrap(), RowScope::Processed);
        assert!(RowScope::from_str("done").is_err());
    }
}
