use std::future::Future;

use chrono::Utc;

use super::SqliteStore;
use super::dao::{RowRecord, SourceRecord, format_ts};
use crate::error::Result;
use crate::query::{PageRequest, RowScope};
use crate::runtime::types::{ReviewRow, RowState, Verdict};
use crate::source::RowKey;

const ROW_SELECT: &str = "SELECT r.row_index, r.state, r.verdict, r.attempt_error, \
     s.id_key, s.order_key, s.logistics_key, s.cells \
     FROM review_rows r \
     JOIN source_rows s ON s.task_id = r.task_id AND s.row_index = r.row_index";

/// Rows of one task read under a single transaction.
#[derive(Debug, Clone, Default)]
pub struct RowSnapshot {
    /// Checkpoint rows, ordered by index.
    pub rows: Vec<ReviewRow>,
    /// Source records past the review cap, ordered by index.
    pub overflow: Vec<SourceRecord>,
}

pub trait RowStore: Send + Sync + 'static {
    /// Lowest-index row still `pending`.
    fn next_pending_row(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<Option<ReviewRow>>> + Send;

    /// Finalize a row and bump the task counters in one transaction.
    ///
    /// Only a `pending` row is updated; returns `false` (and leaves the
    /// counters alone) if the row was already finalized.
    fn commit_row(
        &self,
        task_id: &str,
        row_index: u64,
        verdict: &Verdict,
        attempt_error: Option<&str>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Scope cardinality plus one page of rows, read together.
    fn rows_page(
        &self,
        task_id: &str,
        scope: RowScope,
        page: PageRequest,
    ) -> impl Future<Output = Result<(u64, Vec<ReviewRow>)>> + Send;

    fn row_snapshot(&self, task_id: &str) -> impl Future<Output = Result<RowSnapshot>> + Send;

    /// `(source keys within the review scope, keys of finalized rows)`.
    fn alignment_keys(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<(Vec<RowKey>, Vec<RowKey>)>> + Send;
}

fn scope_filter(scope: RowScope) -> &'static str {
    match scope {
        RowScope::All => "",
        RowScope::Processed => " AND r.state <> 'pending'",
        RowScope::Pending => " AND r.state = 'pending'",
    }
}

impl RowStore for SqliteStore {
    async fn next_pending_row(&self, task_id: &str) -> Result<Option<ReviewRow>> {
        let record: Option<RowRecord> = sqlx::query_as(&format!(
            "{ROW_SELECT} WHERE r.task_id = ?1 AND r.state = 'pending' ORDER BY r.row_index LIMIT 1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(RowRecord::into_row).transpose()
    }

    async fn commit_row(
        &self,
        task_id: &str,
        row_index: u64,
        verdict: &Verdict,
        attempt_error: Option<&str>,
    ) -> Result<bool> {
        let state = verdict.state();
        let now = format_ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE review_rows SET state = ?1, verdict = ?2, attempt_error = ?3, updated_at = ?4 \
             WHERE task_id = ?5 AND row_index = ?6 AND state = 'pending'",
        )
        .bind(state.to_string())
        .bind(serde_json::to_string(verdict)?)
        .bind(attempt_error)
        .bind(&now)
        .bind(task_id)
        .bind(row_index as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        let (ok, bad) = match state {
            RowState::Ok => (1_i64, 0_i64),
            _ => (0, 1),
        };
        sqlx::query(
            "UPDATE review_tasks SET processed = processed + 1, ok_rows = ok_rows + ?1, \
             bad_rows = bad_rows + ?2, updated_at = ?3 WHERE task_id = ?4",
        )
        .bind(ok)
        .bind(bad)
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn rows_page(
        &self,
        task_id: &str,
        scope: RowScope,
        page: PageRequest,
    ) -> Result<(u64, Vec<ReviewRow>)> {
        let filter = scope_filter(scope);
        let mut tx = self.pool.begin().await?;

        let (total,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM review_rows r WHERE r.task_id = ?1{filter}"
        ))
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;

        let records: Vec<RowRecord> = sqlx::query_as(&format!(
            "{ROW_SELECT} WHERE r.task_id = ?1{filter} ORDER BY r.row_index LIMIT ?2 OFFSET ?3"
        ))
        .bind(task_id)
        .bind(i64::from(page.page_size))
        .bind(page.offset() as i64)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        let rows = records
            .into_iter()
            .map(RowRecord::into_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((u64::try_from(total).unwrap_or_default(), rows))
    }

    async fn row_snapshot(&self, task_id: &str) -> Result<RowSnapshot> {
        let mut tx = self.pool.begin().await?;

        let records: Vec<RowRecord> =
            sqlx::query_as(&format!("{ROW_SELECT} WHERE r.task_id = ?1 ORDER BY r.row_index"))
                .bind(task_id)
                .fetch_all(&mut *tx)
                .await?;

        let overflow: Vec<SourceRecord> = sqlx::query_as(
            "SELECT s.row_index, s.id_key, s.order_key, s.logistics_key, s.cells \
             FROM source_rows s \
             WHERE s.task_id = ?1 AND NOT EXISTS ( \
                 SELECT 1 FROM review_rows r WHERE r.task_id = s.task_id AND r.row_index = s.row_index) \
             ORDER BY s.row_index",
        )
        .bind(task_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        let rows = records
            .into_iter()
            .map(RowRecord::into_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(RowSnapshot { rows, overflow })
    }

    async fn alignment_keys(&self, task_id: &str) -> Result<(Vec<RowKey>, Vec<RowKey>)> {
        let mut tx = self.pool.begin().await?;

        let source: Vec<SourceRecord> = sqlx::query_as(
            "SELECT s.row_index, s.id_key, s.order_key, s.logistics_key, s.cells \
             FROM source_rows s \
             JOIN review_rows r ON r.task_id = s.task_id AND r.row_index = s.row_index \
             WHERE s.task_id = ?1 ORDER BY s.row_index",
        )
        .bind(task_id)
        .fetch_all(&mut *tx)
        .await?;

        let processed: Vec<SourceRecord> = sqlx::query_as(
            "SELECT s.row_index, s.id_key, s.order_key, s.logistics_key, s.cells \
             FROM source_rows s \
             JOIN review_rows r ON r.task_id = s.task_id AND r.row_index = s.row_index \
             WHERE s.task_id = ?1 AND r.state <> 'pending' ORDER BY s.row_index",
        )
        .bind(task_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((
            source.iter().map(SourceRecord::key).collect(),
            processed.iter().map(SourceRecord::key).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{NewTask, TaskStore};
    use crate::runtime::types::TaskSettings;
    use crate::source::{ColumnMap, SourceTable};

    async fn seeded(rows: usize, total: u64) -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let records = (1..=rows)
            .map(|i| vec![format!("id{i}"), "5".into(), "http://x/a.png".into()])
            .collect();
        let table = SourceTable::new(
            "t.csv",
            vec!["id".into(), "amount".into(), "image".into()],
            records,
        )
        .unwrap();
        let task = NewTask {
            task_id: "t1".into(),
            settings: TaskSettings {
                model_name: "m".into(),
                max_images: 4,
                max_rows: total as u32,
                min_interval_sec: 0.0,
                max_retries: 0,
                backoff_base_sec: 1.0,
            },
            columns: ColumnMap::resolve(&table.columns).unwrap(),
            total,
        };
        store.insert_task(&task, &table).await.unwrap();
        store
    }

    fn pass() -> Verdict {
        Verdict { is_match: Some(true), reason: "match".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn commit_is_idempotent_and_counts_once() {
        let store = seeded(3, 3).await;
        let first = store.next_pending_row("t1").await.unwrap().unwrap();
        assert_eq!(first.row_no, 1);
        assert_eq!(first.state, RowState::Pending);
        assert_eq!(first.key.id, "id1");

        assert!(store.commit_row("t1", 0, &pass(), None).await.unwrap());
        assert!(!store.commit_row("t1", 0, &pass(), None).await.unwrap());
        assert!(
            store
                .commit_row("t1", 1, &Verdict::unavailable("timeout"), Some("timeout"))
                .await
                .unwrap()
        );

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!((task.processed, task.ok_rows, task.bad_rows), (2, 1, 1));
        assert_eq!(store.next_pending_row("t1").await.unwrap().unwrap().row_no, 3);
    }

    #[tokio::test]
    async fn pages_follow_scope_and_order() {
        let store = seeded(5, 5).await;
        store.commit_row("t1", 1, &pass(), None).await.unwrap();
        store.commit_row("t1", 3, &pass(), None).await.unwrap();

        let (total, rows) = store
            .rows_page("t1", RowScope::Processed, PageRequest::new(1, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.iter().map(|r| r.row_no).collect::<Vec<_>>(), vec![2, 4]);

        let (total, rows) = store
            .rows_page("t1", RowScope::Pending, PageRequest::new(2, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows.iter().map(|r| r.row_no).collect::<Vec<_>>(), vec![5]);

        let (total, rows) = store
            .rows_page("t1", RowScope::All, PageRequest::new(9, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn snapshot_and_keys_respect_the_cap() {
        let store = seeded(4, 2).await;
        store.commit_row("t1", 0, &pass(), None).await.unwrap();

        let snap = store.row_snapshot("t1").await.unwrap();
        assert_eq!(snap.rows.len(), 2);
        assert_eq!(snap.overflow.iter().map(SourceRecord::row_no).collect::<Vec<_>>(), vec![3, 4]);

        let (source, processed) = store.alignment_keys("t1").await.unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].id, "id1");
    }
}
