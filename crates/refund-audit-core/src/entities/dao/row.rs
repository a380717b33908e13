use sqlx::FromRow;

use super::task::to_u64;
use crate::error::Result;
use crate::runtime::types::{ReviewRow, RowState};
use crate::source::RowKey;

/// `review_rows` joined with its `source_rows` record.
#[derive(Debug, Clone, FromRow)]
pub struct RowRecord {
    pub row_index: i64,
    pub state: String,
    pub verdict: Option<String>,
    pub attempt_error: Option<String>,
    pub id_key: String,
    pub order_key: String,
    pub logistics_key: String,
    pub cells: String,
}

impl RowRecord {
    pub fn into_row(self) -> Result<ReviewRow> {
        let state: RowState = self
            .state
            .parse()
            .map_err(|e: strum::ParseError| sqlx::Error::Decode(Box::new(e)))?;
        Ok(ReviewRow {
            row_no: to_u64(self.row_index) + 1,
            state,
            key: RowKey {
                id: self.id_key,
                order_no: self.order_key,
                logistics_no: self.logistics_key,
            },
            values: serde_json::from_str(&self.cells)?,
            verdict: self.verdict.as_deref().map(serde_json::from_str).transpose()?,
            attempt_error: self.attempt_error,
        })
    }
}

/// A raw `source_rows` record, used for rows outside the review scope.
#[derive(Debug, Clone, FromRow)]
pub struct SourceRecord {
    pub row_index: i64,
    pub id_key: String,
    pub order_key: String,
    pub logistics_key: String,
    pub cells: String,
}

impl SourceRecord {
    pub fn key(&self) -> RowKey {
        RowKey {
            id: self.id_key.clone(),
            order_no: self.order_key.clone(),
            logistics_no: self.logistics_key.clone(),
        }
    }

    pub fn row_no(&self) -> u64 {
        to_u64(self.row_index) + 1
    }

    pub fn values(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_str(&self.cells)?)
    }
}
