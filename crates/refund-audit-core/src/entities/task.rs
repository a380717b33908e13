use std::future::Future;

use chrono::Utc;

use super::SqliteStore;
use super::dao::{TaskRecord, format_ts};
use crate::alignment::AlignmentReport;
use crate::error::Result;
use crate::runtime::types::{Task, TaskSettings, TaskStatus};
use crate::source::{ColumnMap, SourceTable};

const TASK_COLUMNS: &str = "task_id, status, source_name, input_rows, total, processed, ok_rows, \
     bad_rows, model_name, max_images, max_rows, min_interval_sec, max_retries, \
     backoff_base_sec, source_columns, column_map, error_message, artifacts, \
     alignment_report, created_at, updated_at, finished_at";

/// Everything needed to persist a freshly created task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub settings: TaskSettings,
    pub columns: ColumnMap,
    /// Rows of the source table that will be reviewed (the first `total`).
    pub total: u64,
}

pub trait TaskStore: Send + Sync + 'static {
    /// Insert the task, one checkpoint row per in-scope record, and every
    /// source record, atomically.
    fn insert_task(
        &self,
        task: &NewTask,
        table: &SourceTable,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_task(&self, task_id: &str) -> impl Future<Output = Result<Option<Task>>> + Send;

    /// Status only; polled by the processing loop between rows.
    fn task_status(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<Option<TaskStatus>>> + Send;

    /// Most recent task, optionally restricted to active statuses.
    fn latest_task(&self, active_only: bool) -> impl Future<Output = Result<Option<Task>>> + Send;

    /// `pending|running → running`. Returns `false` if the task was paused
    /// or otherwise left those states in the meantime.
    fn mark_running(&self, task_id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// `running → paused`.
    fn mark_paused(&self, task_id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// `paused|error|pending → running`, clearing the error and optionally
    /// replacing the pacing interval.
    fn mark_resumed(
        &self,
        task_id: &str,
        min_interval_sec: Option<f64>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// `running → error` with `message`.
    fn mark_failed(
        &self,
        task_id: &str,
        message: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// `running → completed`, appending `artifacts` and storing `report`.
    fn mark_completed(
        &self,
        task_id: &str,
        artifacts: &[String],
        report: &AlignmentReport,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn set_alignment_report(
        &self,
        task_id: &str,
        report: &AlignmentReport,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Move tasks left `running` by a previous process to `paused`.
    fn interrupt_running_tasks(&self) -> impl Future<Output = Result<u64>> + Send;
}

impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &NewTask, table: &SourceTable) -> Result<()> {
        let now = format_ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO review_tasks (task_id, status, source_name, input_rows, total, \
             model_name, max_images, max_rows, min_interval_sec, max_retries, backoff_base_sec, \
             source_columns, column_map, artifacts, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, '[]', ?14, ?14)",
        )
        .bind(&task.task_id)
        .bind(TaskStatus::Pending.to_string())
        .bind(&table.name)
        .bind(table.len() as i64)
        .bind(task.total as i64)
        .bind(&task.settings.model_name)
        .bind(i64::from(task.settings.max_images))
        .bind(i64::from(task.settings.max_rows))
        .bind(task.settings.min_interval_sec)
        .bind(i64::from(task.settings.max_retries))
        .bind(task.settings.backoff_base_sec)
        .bind(serde_json::to_string(&table.columns)?)
        .bind(serde_json::to_string(&task.columns)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for (index, values) in table.records.iter().enumerate() {
            let key = task.columns.key_of(&table.columns, values);
            sqlx::query(
                "INSERT INTO source_rows (task_id, row_index, id_key, order_key, logistics_key, cells) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&task.task_id)
            .bind(index as i64)
            .bind(&key.id)
            .bind(&key.order_no)
            .bind(&key.logistics_no)
            .bind(serde_json::to_string(values)?)
            .execute(&mut *tx)
            .await?;

            if (index as u64) < task.total {
                sqlx::query(
                    "INSERT INTO review_rows (task_id, row_index, state) VALUES (?1, ?2, 'pending')",
                )
                .bind(&task.task_id)
                .bind(index as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let record: Option<TaskRecord> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM review_tasks WHERE task_id = ?1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        record.map(TaskRecord::into_task).transpose()
    }

    async fn task_status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM review_tasks WHERE task_id = ?1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(status,)| {
            status
                .parse::<TaskStatus>()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)).into())
        })
        .transpose()
    }

    async fn latest_task(&self, active_only: bool) -> Result<Option<Task>> {
        let sql = if active_only {
            format!(
                "SELECT {TASK_COLUMNS} FROM review_tasks \
                 WHERE status IN ('pending', 'running', 'paused') \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            )
        } else {
            format!(
                "SELECT {TASK_COLUMNS} FROM review_tasks ORDER BY created_at DESC, rowid DESC LIMIT 1"
            )
        };
        let record: Option<TaskRecord> =
            sqlx::query_as(&sql).fetch_optional(&self.pool).await?;
        record.map(TaskRecord::into_task).transpose()
    }

    async fn mark_running(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE review_tasks SET status = 'running', updated_at = ?1 \
             WHERE task_id = ?2 AND status IN ('pending', 'running')",
        )
        .bind(format_ts(Utc::now()))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_paused(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE review_tasks SET status = 'paused', updated_at = ?1 \
             WHERE task_id = ?2 AND status = 'running'",
        )
        .bind(format_ts(Utc::now()))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_resumed(&self, task_id: &str, min_interval_sec: Option<f64>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE review_tasks SET status = 'running', error_message = NULL, finished_at = NULL, \
             min_interval_sec = COALESCE(?1, min_interval_sec), updated_at = ?2 \
             WHERE task_id = ?3 AND status IN ('paused', 'error', 'pending')",
        )
        .bind(min_interval_sec)
        .bind(format_ts(Utc::now()))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, task_id: &str, message: &str) -> Result<bool> {
        let now = format_ts(Utc::now());
        let result = sqlx::query(
            "UPDATE review_tasks SET status = 'error', error_message = ?1, updated_at = ?2, \
             finished_at = ?2 WHERE task_id = ?3 AND status IN ('pending', 'running')",
        )
        .bind(message)
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(
        &self,
        task_id: &str,
        artifacts: &[String],
        report: &AlignmentReport,
    ) -> Result<bool> {
        let now = format_ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT artifacts FROM review_tasks WHERE task_id = ?1")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((existing,)) = existing else {
            return Ok(false);
        };
        let mut all: Vec<String> = serde_json::from_str(&existing)?;
        all.extend(artifacts.iter().cloned());

        let result = sqlx::query(
            "UPDATE review_tasks SET status = 'completed', artifacts = ?1, alignment_report = ?2, \
             updated_at = ?3, finished_at = ?3 WHERE task_id = ?4 AND status = 'running'",
        )
        .bind(serde_json::to_string(&all)?)
        .bind(serde_json::to_string(report)?)
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_alignment_report(&self, task_id: &str, report: &AlignmentReport) -> Result<()> {
        sqlx::query("UPDATE review_tasks SET alignment_report = ?1 WHERE task_id = ?2")
            .bind(serde_json::to_string(report)?)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn interrupt_running_tasks(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE review_tasks SET status = 'paused', updated_at = ?1 WHERE status = 'running'",
        )
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReviewConfig;

    fn settings() -> TaskSettings {
        let cfg = ReviewConfig::default();
        TaskSettings {
            model_name: cfg.model_name,
            max_images: cfg.max_images,
            max_rows: cfg.max_rows,
            min_interval_sec: 0.0,
            max_retries: cfg.max_retries,
            backoff_base_sec: cfg.backoff_base_sec,
        }
    }

    fn table() -> SourceTable {
        let rows = (1..=3)
            .map(|i| vec![format!("id{i}"), format!("L{i}"), "5".into(), "http://x/a.png".into()])
            .collect();
        SourceTable::new(
            "t.csv",
            vec!["id".into(), "logistics_no".into(), "amount".into(), "image".into()],
            rows,
        )
        .unwrap()
    }

    async fn seeded(total: u64) -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let table = table();
        let task = NewTask {
            task_id: "t1".into(),
            settings: settings(),
            columns: ColumnMap::resolve(&table.columns).unwrap(),
            total,
        };
        store.insert_task(&task, &table).await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_and_load_task() {
        let store = seeded(2).await;
        let task = store.get_task("t1").await.unwrap().expect("task exists");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.input_rows, 3);
        assert_eq!(task.total, 2);
        assert_eq!(task.pending, 2);
        assert_eq!(task.source_columns.len(), 4);
        assert!(task.artifacts.is_empty());
        assert!(store.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transitions_are_conditional() {
        let store = seeded(3).await;
        assert!(!store.mark_paused("t1").await.unwrap(), "pending cannot pause");
        assert!(store.mark_running("t1").await.unwrap());
        assert!(store.mark_paused("t1").await.unwrap());
        assert!(!store.mark_running("t1").await.unwrap(), "paused loop must not restart itself");
        assert!(store.mark_resumed("t1", Some(1.5)).await.unwrap());
        assert!(!store.mark_resumed("t1", None).await.unwrap(), "running cannot resume");

        assert!(store.mark_failed("t1", "bad key").await.unwrap());
        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error_message.as_deref(), Some("bad key"));
        assert_eq!(task.settings.min_interval_sec, 1.5);

        assert!(store.mark_resumed("t1", None).await.unwrap());
        let task = store.get_task("t1").await.unwrap().unwrap();
        assert!(task.error_message.is_none());
        assert_eq!(task.settings.min_interval_sec, 1.5);
    }

    #[tokio::test]
    async fn completion_appends_artifacts() {
        let store = seeded(3).await;
        store.mark_running("t1").await.unwrap();
        let report = AlignmentReport::default();
        assert!(
            store
                .mark_completed("t1", &["a.csv".into(), "b.csv".into()], &report)
                .await
                .unwrap()
        );
        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.artifacts, vec!["a.csv", "b.csv"]);
        assert!(task.finished_at.is_some());
        assert_eq!(task.alignment_report, Some(report.clone()));
        assert!(!store.mark_completed("t1", &[], &report).await.unwrap());
    }

    #[tokio::test]
    async fn recover_pauses_running_tasks_and_latest_filters() {
        let store = seeded(3).await;
        assert_eq!(store.latest_task(true).await.unwrap().unwrap().task_id, "t1");
        store.mark_running("t1").await.unwrap();
        assert_eq!(store.interrupt_running_tasks().await.unwrap(), 1);
        assert_eq!(store.task_status("t1").await.unwrap(), Some(TaskStatus::Paused));

        store.mark_resumed("t1", None).await.unwrap();
        store.mark_completed("t1", &[], &AlignmentReport::default()).await.unwrap();
        assert!(store.latest_task(true).await.unwrap().is_none());
        assert_eq!(store.latest_task(false).await.unwrap().unwrap().task_id, "t1");
    }
}
