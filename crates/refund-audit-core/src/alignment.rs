//! Source/output alignment check.
//!
//! Proves that the rows a task has finalized still correspond one-to-one with
//! the rows it was created from. Keys are compared as multisets so a row that
//! appears twice in the source must also be finalized twice.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::source::RowKey;

/// Upper bound on `missing_samples` / `extra_samples`.
pub const MAX_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum KeyField {
    Id,
    OrderNo,
    LogisticsNo,
}

impl KeyField {
    const ALL: [KeyField; 3] = [KeyField::Id, KeyField::OrderNo, KeyField::LogisticsNo];

    fn get(self, key: &RowKey) -> &str {
        match self {
            KeyField::Id => &key.id,
            KeyField::OrderNo => &key.order_no,
            KeyField::LogisticsNo => &key.logistics_no,
        }
    }
}

/// A key that is present on one side only, with its surplus multiplicity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySample {
    #[serde(flatten)]
    pub key: RowKey,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub can_compare: bool,
    pub ok: bool,
    pub message: String,
    pub source_rows: u64,
    pub processed_rows: u64,
    pub compared_fields: Vec<KeyField>,
    pub missing_rows: u64,
    pub extra_rows: u64,
    pub source_duplicate_logistics: u64,
    pub processed_duplicate_logistics: u64,
    pub missing_samples: Vec<KeySample>,
    pub extra_samples: Vec<KeySample>,
}

/// Compare the source key list against the processed key list.
pub fn compare(source: &[RowKey], processed: &[RowKey]) -> AlignmentReport {
    let mut report = AlignmentReport {
        source_rows: source.len() as u64,
        processed_rows: processed.len() as u64,
        ..Default::default()
    };

    if source.is_empty() || processed.is_empty() {
        report.message = "source or processed rows are empty; nothing to compare".into();
        return report;
    }

    let src_fields = available_fields(source);
    let dst_fields = available_fields(processed);
    let common: Vec<KeyField> = KeyField::ALL
        .into_iter()
        .filter(|f| src_fields.contains(f) && dst_fields.contains(f))
        .collect();

    if common.is_empty() {
        report.message = format!(
            "no common key field to compare: source has [{}], processed has [{}]",
            join_fields(&src_fields),
            join_fields(&dst_fields),
        );
        return report;
    }

    let src_counts = count_keys(source, &common);
    let dst_counts = count_keys(processed, &common);
    let missing = difference(&src_counts, &dst_counts);
    let extra = difference(&dst_counts, &src_counts);

    report.can_compare = true;
    report.missing_rows = missing.values().sum();
    report.extra_rows = extra.values().sum();
    report.ok = report.missing_rows == 0 && report.extra_rows == 0;
    report.source_duplicate_logistics = duplicate_logistics(source);
    report.processed_duplicate_logistics = duplicate_logistics(processed);
    report.missing_samples = samples(missing);
    report.extra_samples = samples(extra);
    report.message = if report.ok {
        format!("aligned on [{}]", join_fields(&common))
    } else {
        format!(
            "{} missing, {} extra on [{}]",
            report.missing_rows,
            report.extra_rows,
            join_fields(&common)
        )
    };
    report.compared_fields = common;
    report
}

fn available_fields(keys: &[RowKey]) -> Vec<KeyField> {
    KeyField::ALL
        .into_iter()
        .filter(|f| keys.iter().any(|k| !f.get(k).is_empty()))
        .collect()
}

fn join_fields(fields: &[KeyField]) -> String {
    fields.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn project(key: &RowKey, fields: &[KeyField]) -> RowKey {
    let pick = |f: KeyField| {
        if fields.contains(&f) {
            f.get(key).to_owned()
        } else {
            String::new()
        }
    };
    RowKey {
        id: pick(KeyField::Id),
        order_no: pick(KeyField::OrderNo),
        logistics_no: pick(KeyField::LogisticsNo),
    }
}

fn count_keys(keys: &[RowKey], fields: &[KeyField]) -> BTreeMap<RowKey, u64> {
    let mut counts = BTreeMap::new();
    for key in keys {
        *counts.entry(project(key, fields)).or_insert(0) += 1;
    }
    counts
}

fn difference(left: &BTreeMap<RowKey, u64>, right: &BTreeMap<RowKey, u64>) -> BTreeMap<RowKey, u64> {
    left.iter()
        .filter_map(|(key, &n)| {
            let surplus = n.saturating_sub(right.get(key).copied().unwrap_or(0));
            (surplus > 0).then(|| (key.clone(), surplus))
        })
        .collect()
}

fn duplicate_logistics(keys: &[RowKey]) -> u64 {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for key in keys.iter().filter(|k| !k.logistics_no.is_empty()) {
        *counts.entry(key.logistics_no.as_str()).or_insert(0) += 1;
    }
    counts.values().filter(|&&n| n > 1).count() as u64
}

fn samples(diff: BTreeMap<RowKey, u64>) -> Vec<KeySample> {
    diff.into_iter()
        .take(MAX_SAMPLES)
        .map(|(key, count)| KeySample { key, count })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, order: &str, logistics: &str) -> RowKey {
        RowKey {
            id: id.into(),
            order_no: order.into(),
            logistics_no: logistics.into(),
        }
    }

    #[test]
    fn missing_and_extra_in_both_directions() {
        let a = key("A", "oA", "LA");
        let b = key("B", "oB", "LB");
        let c = key("C", "oC", "LC");
        let d = key("D", "oD", "LD");

        let report = compare(&[a.clone(), b.clone(), c.clone()], &[b, c, d.clone()]);
        assert!(report.can_compare);
        assert!(!report.ok);
        assert_eq!(report.missing_rows, 1);
        assert_eq!(report.extra_rows, 1);
        assert_eq!(report.missing_samples, vec![KeySample { key: a, count: 1 }]);
        assert_eq!(report.extra_samples, vec![KeySample { key: d, count: 1 }]);
        assert_eq!(
            report.compared_fields,
            vec![KeyField::Id, KeyField::OrderNo, KeyField::LogisticsNo]
        );
    }

    #[test]
    fn duplicate_logistics_counted_per_side() {
        let source = [key("id1", "ord1", "log1"), key("id2", "ord2", "log1")];
        let processed = [key("id1", "ord1", "log1")];
        let report = compare(&source, &processed);
        assert_eq!(report.source_duplicate_logistics, 1);
        assert_eq!(report.processed_duplicate_logistics, 0);
        assert_eq!(report.missing_rows, 1);
        assert_eq!(report.extra_rows, 0);
    }

    #[test]
    fn identical_multisets_are_ok() {
        let rows = [key("1", "", "L1"), key("1", "", "L1"), key("2", "", "L2")];
        let report = compare(&rows, &rows);
        assert!(report.ok);
        assert_eq!(report.compared_fields, vec![KeyField::Id, KeyField::LogisticsNo]);
        // A repeated source row must be finalized as many times.
        let report = compare(&rows, &rows[1..]);
        assert_eq!(report.missing_rows, 1);
        assert_eq!(report.missing_samples[0].count, 1);
    }

    #[test]
    fn no_common_field_is_incomparable() {
        let report = compare(&[key("1", "", "")], &[key("", "", "L1")]);
        assert!(!report.can_compare);
        assert!(!report.ok);
        assert!(report.message.contains("id"), "{}", report.message);
        assert!(report.message.contains("logistics_no"), "{}", report.message);
    }

    #[test]
    fn empty_side_is_incomparable() {
        let report = compare(&[key("1", "o", "L")], &[]);
        assert!(!report.can_compare);
        assert_eq!(report.source_rows, 1);
        assert_eq!(report.processed_rows, 0);
    }

    #[test]
    fn samples_are_capped_and_ordered() {
        let source: Vec<RowKey> = (0..50).rev().map(|i| key(&format!("{i:03}"), "", "")).collect();
        let processed = vec![key("999", "", "")];
        let first = compare(&source, &processed);
        let second = compare(&source, &processed);
        assert_eq!(first.missing_rows, 50);
        assert_eq!(first.missing_samples.len(), MAX_SAMPLES);
        assert_eq!(first.missing_samples[0].key.id, "000");
        assert_eq!(first, second);
    }
}
