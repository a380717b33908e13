use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::alignment::{self, AlignmentReport};
use crate::config::{EngineConfig, ResumeOverride, ReviewConfig, require_api_key};
use crate::entities::{NewTask, RowStore, SqliteStore, TaskStore};
use crate::error::{Result, ReviewError};
use crate::processor::{ProcessSettings, RowInput, RowProcessor};
use crate::query::{PageRequest, RowScope, RowsPage, total_pages};
use crate::runtime::limiter::RateLimiter;
use crate::runtime::pool::WorkerPool;
use crate::runtime::registry::{LoopTicket, TaskRegistry};
use crate::runtime::types::{Task, TaskSettings, TaskStatus, Verdict};
use crate::snapshot::{self, SnapshotRefs};
use crate::source::{ColumnMap, SourceTable};

/// Returned by [`TaskController::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedTask {
    pub task_id: String,
    pub status: TaskStatus,
}

/// Owns task lifecycles and schedules their processing loops.
///
/// Cheap to clone; every clone drives the same store, registry and worker
/// pool.
///
/// # Usage
///
/// ```rust,ignore
/// let store = SqliteStore::connect("sqlite::memory:").await?;
/// let processor = Arc::new(DashScopeProcessor::new(&config.service)?);
/// let controller = TaskController::new(store, processor, config);
/// let started = controller.start(table, ReviewConfig::default()).await?;
/// controller.wait_idle(&started.task_id).await;
/// ```
pub struct TaskController<S = SqliteStore> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for TaskController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    store: S,
    registry: TaskRegistry,
    processor: Arc<dyn RowProcessor>,
    pool: WorkerPool,
    config: EngineConfig,
}

impl<S> TaskController<S>
where
    S: TaskStore + RowStore,
{
    pub fn new(store: S, processor: Arc<dyn RowProcessor>, config: EngineConfig) -> Self {
        let pool = WorkerPool::new(config.workers);
        Self {
            inner: Arc::new(Inner {
                store,
                registry: TaskRegistry::new(),
                processor,
                pool,
                config,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Stop handing out worker slots. Loops still waiting for one exit
    /// without processing a row; loops already processing keep going until
    /// paused.
    pub fn close(&self) {
        self.inner.pool.close();
        info!("worker pool closed");
    }

    /// Pause tasks a previous process left `running`. Call once at startup.
    pub async fn recover(&self) -> Result<u64> {
        let interrupted = self.inner.store.interrupt_running_tasks().await?;
        if interrupted > 0 {
            warn!(interrupted, "paused tasks left running by a previous process");
        }
        Ok(interrupted)
    }

    /// Create a task over the first `max_rows` rows of `table` and schedule
    /// its processing loop. Returns without waiting for any row.
    pub async fn start(&self, table: SourceTable, config: ReviewConfig) -> Result<StartedTask> {
        let started = self.create(table, config).await?;
        self.spawn_loop(&started.task_id).await;
        Ok(started)
    }

    /// Persist a `pending` task without scheduling it; [`Self::resume`]
    /// starts it later.
    pub async fn create(&self, table: SourceTable, config: ReviewConfig) -> Result<StartedTask> {
        let config = config.validated()?;
        require_api_key(&self.inner.config, config.api_key.as_deref())?;
        let columns = ColumnMap::resolve(&table.columns)?;

        let total = table.len().min(config.max_rows as usize) as u64;
        let task_id = new_task_id();
        let task = NewTask {
            task_id: task_id.clone(),
            settings: TaskSettings {
                model_name: config.model_name,
                max_images: config.max_images,
                max_rows: config.max_rows,
                min_interval_sec: config.min_interval_sec,
                max_retries: config.max_retries,
                backoff_base_sec: config.backoff_base_sec,
            },
            columns,
            total,
        };
        self.inner.store.insert_task(&task, &table).await?;
        if let Some(key) = non_blank(config.api_key.as_deref()) {
            self.inner.registry.set_api_key(&task_id, key).await;
        }
        info!(
            task_id = %task_id,
            source = %table.name,
            input_rows = table.len(),
            total,
            "review task created"
        );
        Ok(StartedTask {
            task_id,
            status: TaskStatus::Pending,
        })
    }

    pub async fn status(&self, task_id: &str) -> Result<Task> {
        self.inner
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ReviewError::not_found(task_id))
    }

    /// One page of rows in `scope`, ordered by row index.
    pub async fn rows(
        &self,
        task_id: &str,
        scope: RowScope,
        page: u32,
        page_size: u32,
    ) -> Result<RowsPage> {
        let request = PageRequest::new(page, page_size)?;
        let task = self.status(task_id).await?;
        let (total_rows, rows) = self.inner.store.rows_page(task_id, scope, request).await?;
        Ok(RowsPage {
            task_id: task.task_id,
            scope,
            columns: task.source_columns,
            rows,
            total_rows,
            page,
            page_size,
            total_pages: total_pages(total_rows, page_size),
        })
    }

    /// Stop the loop after the row currently in flight.
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let status = self.current_status(task_id).await?;
        if status != TaskStatus::Running || !self.inner.store.mark_paused(task_id).await? {
            let status = self.current_status(task_id).await?;
            return Err(ReviewError::NotRunning {
                task_id: task_id.to_owned(),
                status,
            });
        }
        let signalled = self.inner.registry.request_pause(task_id).await;
        info!(task_id, signalled, "pause requested");
        Ok(())
    }

    /// Continue a `paused`, `error` or `pending` task from its first pending
    /// row, optionally with a new key or pacing interval.
    ///
    /// A loop that was just paused or failed may still be finishing its row
    /// in flight; resume waits for it before scheduling the next one.
    pub async fn resume(&self, task_id: &str, overrides: ResumeOverride) -> Result<()> {
        let overrides = overrides.validated()?;
        let mut status = self.current_status(task_id).await?;
        let invalid = |status: TaskStatus, reason: &str| ReviewError::InvalidTransition {
            task_id: task_id.to_owned(),
            action: "resume",
            status,
            reason: reason.to_owned(),
        };

        if self.inner.registry.is_active(task_id).await {
            if !matches!(status, TaskStatus::Paused | TaskStatus::Error) {
                return Err(invalid(status, "a processing loop is still active"));
            }
            debug!(task_id, %status, "waiting for the previous loop to stop");
            self.wait_idle(task_id).await;
            status = self.current_status(task_id).await?;
        }
        if !status.is_resumable() {
            return Err(invalid(status, "only paused, error or pending tasks can resume"));
        }

        let new_key = non_blank(overrides.api_key.as_deref());
        let explicit = match &new_key {
            Some(key) => Some(key.clone()),
            None => self.inner.registry.api_key(task_id).await,
        };
        require_api_key(&self.inner.config, explicit.as_deref())?;

        if !self
            .inner
            .store
            .mark_resumed(task_id, overrides.min_interval_sec)
            .await?
        {
            let status = self.current_status(task_id).await?;
            return Err(invalid(status, "status changed concurrently"));
        }
        if let Some(key) = new_key {
            self.inner.registry.set_api_key(task_id, key).await;
        }
        info!(
            task_id,
            from = %status,
            min_interval_sec = ?overrides.min_interval_sec,
            "review task resumed"
        );

        if !self.spawn_loop(task_id).await {
            return Err(invalid(TaskStatus::Running, "a processing loop is still active"));
        }
        Ok(())
    }

    /// Compare the source keys with the processed rows and store the report
    /// on the task. Safe to call while the task is running.
    pub async fn alignment_check(&self, task_id: &str) -> Result<AlignmentReport> {
        self.current_status(task_id).await?;
        let (source, processed) = self.inner.store.alignment_keys(task_id).await?;
        let report = alignment::compare(&source, &processed);
        self.inner
            .store
            .set_alignment_report(task_id, &report)
            .await?;
        info!(
            task_id,
            can_compare = report.can_compare,
            ok = report.ok,
            missing_rows = report.missing_rows,
            extra_rows = report.extra_rows,
            "alignment checked"
        );
        Ok(report)
    }

    /// Export the current row partitions without touching task state.
    pub async fn snapshot(&self, task_id: &str) -> Result<SnapshotRefs> {
        let task = self.status(task_id).await?;
        let rows = self.inner.store.row_snapshot(task_id).await?;
        let dir = self.inner.config.artifact_dir.clone();
        let refs = tokio::task::spawn_blocking(move || {
            snapshot::write_snapshot(&dir, &task.task_id, &task.source_columns, &rows)
        })
        .await
        .map_err(|e| ReviewError::Io(std::io::Error::other(e)))??;
        info!(
            task_id,
            processed = refs.processed,
            unprocessed = refs.unprocessed,
            "snapshot written"
        );
        Ok(refs)
    }

    /// Id of the most recently created task, optionally only among active ones.
    pub async fn latest(&self, active_only: bool) -> Result<Option<String>> {
        Ok(self
            .inner
            .store
            .latest_task(active_only)
            .await?
            .map(|task| task.task_id))
    }

    /// Resolve once no processing loop is scheduled for `task_id`.
    pub async fn wait_idle(&self, task_id: &str) {
        if let Some(mut done) = self.inner.registry.done_receiver(task_id).await {
            let _ = done.wait_for(|done| *done).await;
        }
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.inner.registry.is_active(task_id).await
    }

    async fn current_status(&self, task_id: &str) -> Result<TaskStatus> {
        self.inner
            .store
            .task_status(task_id)
            .await?
            .ok_or_else(|| ReviewError::not_found(task_id))
    }

    /// Register and spawn a loop; `false` if one is already active.
    async fn spawn_loop(&self, task_id: &str) -> bool {
        let Some(ticket) = self.inner.registry.try_register(task_id).await else {
            return false;
        };
        let inner = Arc::clone(&self.inner);
        let task_id = task_id.to_owned();
        let span = info_span!("review_task", task_id = %task_id, generation = ticket.generation);
        tokio::spawn(run_loop(inner, task_id, ticket).instrument(span));
        true
    }
}

/// Supervise one driver run. A driver that errors or panics leaves the task
/// in `error`; the registry entry is released either way.
async fn run_loop<S>(inner: Arc<Inner<S>>, task_id: String, ticket: LoopTicket)
where
    S: TaskStore + RowStore,
{
    let ticket = Arc::new(ticket);
    let driver = tokio::spawn({
        let inner = Arc::clone(&inner);
        let task_id = task_id.clone();
        let ticket = Arc::clone(&ticket);
        async move { drive(&inner, &task_id, &ticket).await }.in_current_span()
    });

    let failure = match driver.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(join_err) if join_err.is_panic() => {
            Some("internal error: review loop panicked".to_owned())
        }
        Err(join_err) => Some(format!("internal error: {join_err}")),
    };
    if let Some(message) = failure {
        error!(error = %message, "review loop aborted");
        if let Err(mark_err) = inner.store.mark_failed(&task_id, &message).await {
            error!(error = %mark_err, "failed to record task error");
        }
    }
    inner.registry.finish(&task_id, ticket.generation).await;
    drop(ticket);
}

async fn drive<S>(inner: &Inner<S>, task_id: &str, ticket: &LoopTicket) -> Result<()>
where
    S: TaskStore + RowStore,
{
    let Some(_permit) = inner.pool.acquire().await else {
        warn!("worker pool closed, loop not started");
        return Ok(());
    };
    if ticket.pause_requested() || !inner.store.mark_running(task_id).await? {
        info!("task left runnable state before the loop started");
        return Ok(());
    }

    let task = inner
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| ReviewError::not_found(task_id))?;
    let explicit = inner.registry.api_key(task_id).await;
    let Some(api_key) = inner.config.effective_api_key(explicit.as_deref()) else {
        let message = "missing DashScope API key: resume with a key or set DASHSCOPE_API_KEY";
        error!(reason = message, "review loop cannot start");
        inner.store.mark_failed(task_id, message).await?;
        return Ok(());
    };

    let settings = ProcessSettings {
        model_name: task.settings.model_name.clone(),
        api_key,
        max_images: task.settings.max_images,
        max_retries: task.settings.max_retries,
        backoff_base_sec: task.settings.backoff_base_sec,
    };
    let amount_at = column_index(&task.source_columns, &task.columns.amount)?;
    let image_at = column_index(&task.source_columns, &task.columns.image)?;
    let mut limiter = RateLimiter::from_secs(task.settings.min_interval_sec);
    info!(
        total = task.total,
        processed = task.processed,
        min_interval_sec = task.settings.min_interval_sec,
        "review loop started"
    );

    loop {
        if ticket.pause_requested() {
            info!("pause observed, loop stopped");
            return Ok(());
        }
        match inner.store.task_status(task_id).await? {
            Some(TaskStatus::Running) => {}
            status => {
                info!(status = ?status, "task no longer running, loop stopped");
                return Ok(());
            }
        }
        let Some(row) = inner.store.next_pending_row(task_id).await? else {
            break;
        };

        limiter.acquire().await;
        let input = RowInput {
            row_no: row.row_no,
            amount: cell(&row.values, amount_at),
            images: cell(&row.values, image_at),
        };
        let (verdict, attempt_error) = match inner.processor.process(&input, &settings).await {
            Ok(verdict) => (verdict, None),
            Err(e) if e.is_fatal() => {
                error!(row_index = row.index(), error = %e, "task-fatal processing error");
                inner.store.mark_failed(task_id, &e.to_string()).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(row_index = row.index(), error = %e, "row processing failed");
                let message = e.to_string();
                (Verdict::unavailable(message.clone()), Some(message))
            }
        };

        let committed = inner
            .store
            .commit_row(task_id, row.index(), &verdict, attempt_error.as_deref())
            .await?;
        debug!(
            row_index = row.index(),
            state = %verdict.state(),
            committed,
            "row finalized"
        );
    }

    complete(inner, task_id, &task).await
}

async fn complete<S>(inner: &Inner<S>, task_id: &str, task: &Task) -> Result<()>
where
    S: TaskStore + RowStore,
{
    let (source, processed) = inner.store.alignment_keys(task_id).await?;
    let report = alignment::compare(&source, &processed);
    let rows = inner.store.row_snapshot(task_id).await?;

    let dir = inner.config.artifact_dir.clone();
    let id = task_id.to_owned();
    let columns = task.source_columns.clone();
    let artifacts = tokio::task::spawn_blocking(move || {
        snapshot::write_completion(&dir, &id, &columns, &rows)
    })
    .await
    .map_err(|e| ReviewError::Io(std::io::Error::other(e)))??;

    if inner
        .store
        .mark_completed(task_id, &artifacts, &report)
        .await?
    {
        info!(
            artifacts = artifacts.len(),
            aligned = report.ok,
            "review task completed"
        );
    } else {
        warn!("task left running before completion was recorded");
    }
    Ok(())
}

fn column_index(columns: &[String], name: &str) -> Result<usize> {
    columns.iter().position(|c| c == name).ok_or_else(|| {
        ReviewError::Source(format!("column {name:?} is missing from the stored header"))
    })
}

fn cell(values: &[String], at: usize) -> String {
    values.get(at).cloned().unwrap_or_default()
}

fn non_blank(key: Option<&str>) -> Option<String> {
    key.map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_owned)
}

/// `ai_{yyyymmdd_hhmmss}_{6 hex}`.
fn new_task_id() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(6);
    format!("ai_{}_{suffix}", Utc::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_prefixed_and_unique() {
        let a = new_task_id();
        let b = new_task_id();
        assert!(a.starts_with("ai_"));
        assert_eq!(a.len(), "ai_20260101_000000_abcdef".len());
        assert_ne!(a, b);
    }

    #[test]
    fn cells_outside_the_row_are_empty() {
        let values = vec!["a".to_owned()];
        assert_eq!(cell(&values, 0), "a");
        assert_eq!(cell(&values, 3), "");
    }

    #[test]
    fn blank_keys_are_ignored() {
        assert_eq!(non_blank(Some("  ")), None);
        assert_eq!(non_blank(Some(" sk ")).as_deref(), Some("sk"));
        assert_eq!(non_blank(None), None);
    }
}
