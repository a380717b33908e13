//! Partition exports of a task's rows.
//!
//! Snapshots never touch task or row state. Each call writes a fresh file set
//! named `{timestamp}_{task_id}_{kind}_{batch}.csv` so concurrent or repeated
//! calls never overwrite each other.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{RowSnapshot, SourceRecord};
use crate::error::Result;
use crate::runtime::types::{ReviewRow, RowState};

const AI_COLUMNS: [&str; 4] = ["ai_paid_amount", "ai_match", "ai_note", "ai_error"];

/// Disjoint views over one row read.
#[derive(Debug, Default)]
pub struct Partition<'a> {
    pub processed: Vec<&'a ReviewRow>,
    pub unprocessed: Vec<&'a ReviewRow>,
    pub ok: Vec<&'a ReviewRow>,
    pub bad: Vec<&'a ReviewRow>,
}

pub fn partition(rows: &[ReviewRow]) -> Partition<'_> {
    let mut out = Partition::default();
    for row in rows {
        match row.state {
            RowState::Pending => out.unprocessed.push(row),
            RowState::Ok => {
                out.processed.push(row);
                out.ok.push(row);
            }
            RowState::Bad => {
                out.processed.push(row);
                out.bad.push(row);
            }
        }
    }
    out
}

/// File references and counts produced by one snapshot call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRefs {
    pub task_id: String,
    pub processed_ref: String,
    pub unprocessed_ref: String,
    pub ok_ref: String,
    pub bad_ref: String,
    /// Source rows beyond the review cap, when there are any.
    pub overflow_ref: Option<String>,
    pub processed: u64,
    pub unprocessed: u64,
    pub ok: u64,
    pub bad: u64,
    pub overflow: u64,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn write_snapshot(
    dir: &Path,
    task_id: &str,
    columns: &[String],
    snapshot: &RowSnapshot,
) -> Result<SnapshotRefs> {
    std::fs::create_dir_all(dir)?;
    let created_at = Utc::now();
    let namer = FileNamer::new(dir, task_id, created_at);
    let parts = partition(&snapshot.rows);

    let processed_ref = write_review_rows(&namer.path("processed"), columns, &parts.processed)?;
    let unprocessed_ref =
        write_review_rows(&namer.path("unprocessed"), columns, &parts.unprocessed)?;
    let ok_ref = write_review_rows(&namer.path("ok"), columns, &parts.ok)?;
    let bad_ref = write_review_rows(&namer.path("bad"), columns, &parts.bad)?;
    let overflow_ref = if snapshot.overflow.is_empty() {
        None
    } else {
        Some(write_source_rows(&namer.path("overflow"), columns, &snapshot.overflow)?)
    };

    Ok(SnapshotRefs {
        task_id: task_id.to_owned(),
        processed_ref,
        unprocessed_ref,
        ok_ref,
        bad_ref,
        overflow_ref,
        processed: parts.processed.len() as u64,
        unprocessed: parts.unprocessed.len() as u64,
        ok: parts.ok.len() as u64,
        bad: parts.bad.len() as u64,
        overflow: snapshot.overflow.len() as u64,
        created_at,
    })
}

/// Write the files a finished task keeps: `ok`, `bad`, and `overflow` when
/// the source extended past the cap. Returns their references in that order.
pub(crate) fn write_completion(
    dir: &Path,
    task_id: &str,
    columns: &[String],
    snapshot: &RowSnapshot,
) -> Result<Vec<String>> {
    std::fs::create_dir_all(dir)?;
    let namer = FileNamer::new(dir, task_id, Utc::now());
    let parts = partition(&snapshot.rows);

    let mut refs = vec![
        write_review_rows(&namer.path("ok"), columns, &parts.ok)?,
        write_review_rows(&namer.path("bad"), columns, &parts.bad)?,
    ];
    if !snapshot.overflow.is_empty() {
        refs.push(write_source_rows(&namer.path("overflow"), columns, &snapshot.overflow)?);
    }
    Ok(refs)
}

struct FileNamer<'a> {
    dir: &'a Path,
    prefix: String,
    batch: String,
}

impl<'a> FileNamer<'a> {
    fn new(dir: &'a Path, task_id: &str, at: DateTime<Utc>) -> Self {
        let mut batch = Uuid::new_v4().simple().to_string();
        batch.truncate(6);
        Self {
            dir,
            prefix: format!("{}_{task_id}", at.format("%Y%m%d_%H%M%S")),
            batch,
        }
    }

    fn path(&self, kind: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{kind}_{}.csv", self.prefix, self.batch))
    }
}

fn header(columns: &[String]) -> Vec<&str> {
    std::iter::once("row_no")
        .chain(columns.iter().map(String::as_str))
        .chain(AI_COLUMNS)
        .collect()
}

fn write_review_rows(path: &Path, columns: &[String], rows: &[&ReviewRow]) -> Result<String> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(header(columns))?;
    for row in rows {
        let (paid, matched, note) = match &row.verdict {
            Some(v) => (
                v.paid_amount.map(|a| format!("{a:.2}")).unwrap_or_default(),
                (v.is_match == Some(true)).to_string(),
                v.note().to_owned(),
            ),
            None => Default::default(),
        };
        let record = std::iter::once(row.row_no.to_string())
            .chain(padded(&row.values, columns.len()))
            .chain([paid, matched, note, row.attempt_error.clone().unwrap_or_default()]);
        wtr.write_record(record)?;
    }
    wtr.flush()?;
    Ok(path.display().to_string())
}

fn write_source_rows(path: &Path, columns: &[String], rows: &[SourceRecord]) -> Result<String> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(header(columns))?;
    for row in rows {
        let values = row.values()?;
        let record = std::iter::once(row.row_no().to_string())
            .chain(padded(&values, columns.len()))
            .chain(std::iter::repeat_n(String::new(), AI_COLUMNS.len()));
        wtr.write_record(record)?;
    }
    wtr.flush()?;
    Ok(path.display().to_string())
}

fn padded(values: &[String], width: usize) -> impl Iterator<Item = String> + '_ {
    values
        .iter()
        .cloned()
        .chain(std::iter::repeat(String::new()))
        .take(width)
}
