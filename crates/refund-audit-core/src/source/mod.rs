//! Source tables: the ordered, named-column input a review task runs over.

pub mod cells;
pub mod columns;

use std::io::Read;
use std::path::Path;

use crate::error::{Result, ReviewError};

pub use cells::RowKey;
pub use columns::ColumnMap;

/// An ordered table of string cells with a header row.
///
/// Every record has exactly `columns.len()` cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTable {
    /// Display name (usually the file name) recorded on the task.
    pub name: String,
    pub columns: Vec<String>,
    pub records: Vec<Vec<String>>,
}

impl SourceTable {
    /// Build a table from already-split cells, padding or truncating each
    /// record to the header width.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<String>,
        records: Vec<Vec<String>>,
    ) -> Result<Self> {
        let columns: Vec<String> = columns.into_iter().map(|c| c.trim().to_owned()).collect();
        if columns.is_empty() || columns.iter().all(String::is_empty) {
            return Err(ReviewError::Validation("source table has no header row".into()));
        }
        let width = columns.len();
        let records: Vec<Vec<String>> = records
            .into_iter()
            .map(|mut r| {
                r.resize(width, String::new());
                r
            })
            .collect();
        if records.is_empty() {
            return Err(ReviewError::Validation("source table has no data rows".into()));
        }
        Ok(Self {
            name: name.into(),
            columns,
            records,
        })
    }

    /// Read a CSV document whose first record is the header row.
    pub fn from_csv_reader<R: Read>(name: impl Into<String>, reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let columns: Vec<String> = rdr.headers()?.iter().map(str::to_owned).collect();
        let mut records = Vec::new();
        for record in rdr.records() {
            let record = record?;
            if record.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            records.push(record.iter().map(str::to_owned).collect());
        }
        Self::new(name, columns, records)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            ReviewError::Source(format!("failed to open {}: {e}", path.display()))
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_csv_reader(name, file)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_are_padded_and_truncated() {
        let data = " id ,amount,image\n1,5\n2,6,http://x/a.png,extra\n,,\n";
        let table = SourceTable::from_csv_reader("t.csv", data.as_bytes()).unwrap();
        assert_eq!(table.columns, vec!["id", "amount", "image"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.records[0], vec!["1", "5", ""]);
        assert_eq!(table.records[1], vec!["2", "6", "http://x/a.png"]);
    }

    #[test]
    fn empty_tables_are_rejected() {
        let err = SourceTable::from_csv_reader("t.csv", "id,amount\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ReviewError::Validation(_)));

        let err = SourceTable::new("t", vec![], vec![vec!["1".into()]]).unwrap_err();
        assert!(matches!(err, ReviewError::Validation(_)));
    }

    #[test]
    fn missing_file_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SourceTable::from_csv_path(dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, ReviewError::Source(_)));
    }
}
