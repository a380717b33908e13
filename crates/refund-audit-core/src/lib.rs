//! Resumable AI review of refund/logistics records.
//!
//! A [`TaskController`] turns a [`SourceTable`] into a persisted review task
//! and walks its rows one at a time through a [`RowProcessor`], pacing the
//! external calls and checkpointing every verdict in SQLite so a task can be
//! paused, resumed, snapshotted or audited for alignment at any point.

pub mod alignment;
pub mod config;
pub mod entities;
pub mod error;
pub mod processor;
pub mod query;
pub mod runtime;
pub mod snapshot;
pub mod source;

pub use alignment::AlignmentReport;
pub use config::{EngineConfig, ResumeOverride, ReviewConfig, ServiceConfig, min_interval_from_budget};
pub use entities::SqliteStore;
pub use error::{Result, ReviewError};
pub use processor::{DashScopeProcessor, ProcessError, RowProcessor};
pub use query::{RowScope, RowsPage};
pub use runtime::controller::{StartedTask, TaskController};
pub use runtime::types::{ReviewRow, RowState, Task, TaskStatus, Verdict};
pub use snapshot::SnapshotRefs;
pub use source::SourceTable;
