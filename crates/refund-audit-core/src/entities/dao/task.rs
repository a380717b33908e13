use sqlx::FromRow;

use super::parse_ts;
use crate::error::Result;
use crate::runtime::types::{Task, TaskSettings, TaskStatus};

/// A row in the `review_tasks` table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: String,
    pub source_name: String,
    pub input_rows: i64,
    pub total: i64,
    pub processed: i64,
    pub ok_rows: i64,
    pub bad_rows: i64,
    pub model_name: String,
    pub max_images: i64,
    pub max_rows: i64,
    pub min_interval_sec: f64,
    pub max_retries: i64,
    pub backoff_base_sec: f64,
    /// JSON array of header names.
    pub source_columns: String,
    /// JSON [`crate::source::ColumnMap`].
    pub column_map: String,
    pub error_message: Option<String>,
    /// JSON array of artifact paths.
    pub artifacts: String,
    /// JSON [`crate::alignment::AlignmentReport`].
    pub alignment_report: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

impl TaskRecord {
    pub fn into_task(self) -> Result<Task> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|e: strum::ParseError| sqlx::Error::Decode(Box::new(e)))?;
        let alignment_report = self
            .alignment_report
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        let task = Task {
            task_id: self.task_id,
            status,
            source_name: self.source_name,
            input_rows: to_u64(self.input_rows),
            total: to_u64(self.total),
            processed: to_u64(self.processed),
            ok_rows: to_u64(self.ok_rows),
            bad_rows: to_u64(self.bad_rows),
            pending: 0,
            progress_ratio: 0.0,
            settings: TaskSettings {
                model_name: self.model_name,
                max_images: to_u32(self.max_images),
                max_rows: to_u32(self.max_rows),
                min_interval_sec: self.min_interval_sec,
                max_retries: to_u32(self.max_retries),
                backoff_base_sec: self.backoff_base_sec,
            },
            source_columns: serde_json::from_str(&self.source_columns)?,
            columns: serde_json::from_str(&self.column_map)?,
            error_message: self.error_message,
            artifacts: serde_json::from_str(&self.artifacts)?,
            alignment_report,
            created_at: parse_ts(&self.created_at, "created_at"),
            updated_at: parse_ts(&self.updated_at, "updated_at"),
            finished_at: self.finished_at.as_deref().map(|raw| parse_ts(raw, "finished_at")),
        };
        Ok(task.with_derived())
    }
}

pub(crate) fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v).unwrap_or_default()
}
