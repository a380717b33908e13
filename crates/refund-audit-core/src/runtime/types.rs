use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::alignment::AlignmentReport;
use crate::source::{ColumnMap, RowKey};

/// Lifecycle state of a review task.
///
/// ```text
/// pending ──► running ──► completed
///                │ ▲
///                ▼ │ resume
///         paused / error
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    /// A task that may still produce verdicts without being recreated.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    /// States from which `resume` is accepted.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Pending | Self::Paused | Self::Error)
    }
}

/// Checkpoint state of one row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    Pending,
    Ok,
    Bad,
}

/// Structured judgment for one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// `Some(true)` when the amount shown in the screenshots matches the
    /// declared amount, `Some(false)` on a mismatch, `None` when undecidable.
    pub is_match: Option<bool>,
    pub expected_amount: Option<f64>,
    pub paid_amount: Option<f64>,
    pub reason: String,
    /// External calls spent on this row (0 for pre-check verdicts).
    pub attempts: u32,
    pub image_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
}

impl Verdict {
    /// Verdict recorded when the external call failed for this row.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Self::default()
        }
    }

    /// Row state this verdict finalizes to; only a confirmed match passes.
    pub fn state(&self) -> RowState {
        if self.is_match == Some(true) {
            RowState::Ok
        } else {
            RowState::Bad
        }
    }

    /// Human-readable note for exports: empty for passing rows.
    pub fn note(&self) -> &str {
        if self.is_match == Some(true) {
            ""
        } else if self.reason.is_empty() {
            "review failed"
        } else {
            &self.reason
        }
    }
}

/// Settings a task was created with, persisted alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub model_name: String,
    pub max_images: u32,
    pub max_rows: u32,
    pub min_interval_sec: f64,
    pub max_retries: u32,
    pub backoff_base_sec: f64,
}

/// Point-in-time snapshot of a task aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub source_name: String,
    /// Rows in the source table, including any beyond the `max_rows` cap.
    pub input_rows: u64,
    pub total: u64,
    pub processed: u64,
    pub ok_rows: u64,
    pub bad_rows: u64,
    pub pending: u64,
    pub progress_ratio: f64,
    pub settings: TaskSettings,
    /// Header row of the source table.
    pub source_columns: Vec<String>,
    pub columns: ColumnMap,
    pub error_message: Option<String>,
    pub artifacts: Vec<String>,
    pub alignment_report: Option<AlignmentReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Recompute the derived fields from the counters.
    pub(crate) fn with_derived(mut self) -> Self {
        self.pending = self.total.saturating_sub(self.processed);
        self.progress_ratio = if self.total == 0 {
            0.0
        } else {
            ((self.processed as f64 / self.total as f64) * 100.0).round() / 100.0
        };
        self
    }
}

/// One row as seen by queries and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRow {
    /// 1-based position in the source table.
    pub row_no: u64,
    pub state: RowState,
    pub key: RowKey,
    pub values: Vec<String>,
    pub verdict: Option<Verdict>,
    pub attempt_error: Option<String>,
}

impl ReviewRow {
    pub fn index(&self) -> u64 {
        self.row_no - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_strings() {
        assert_eq!(TaskStatus::Running.to_string(), "running");
        assert_eq!(TaskStatus::from_str("paused").unwrap(), TaskStatus::Paused);
        assert!(TaskStatus::from_str("interrupted").is_err());
        assert_eq!(RowState::from_str("bad").unwrap(), RowState::Bad);
    }

    #[test]
    fn resumable_and_active_sets() {
        assert!(TaskStatus::Error.is_resumable());
        assert!(!TaskStatus::Error.is_active());
        assert!(!TaskStatus::Running.is_resumable());
        assert!(!TaskStatus::Completed.is_resumable());
        assert!(TaskStatus::Paused.is_active());
    }

    #[test]
    fn only_confirmed_matches_pass() {
        let ok = Verdict { is_match: Some(true), reason: "match".into(), ..Default::default() };
        assert_eq!(ok.state(), RowState::Ok);
        assert_eq!(ok.note(), "");

        let unknown = Verdict::unavailable("timeout");
        assert_eq!(unknown.state(), RowState::Bad);
        assert_eq!(unknown.note(), "timeout");
    }
}
