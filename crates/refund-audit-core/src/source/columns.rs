//! Header resolution for the refund/logistics export format.
//!
//! Exports come from several storefront tools, each with its own spelling of
//! the same columns. Resolution tries the exact candidate list first, then a
//! case-insensitive keyword match over headers not yet claimed.

use serde::{Deserialize, Serialize};

use super::cells::RowKey;
use crate::error::{Result, ReviewError};

pub const AMOUNT_CANDIDATES: &[&str] = &[
    "*寄回快递实付金额",
    "寄回快递实付金额",
    "*寄回运费金额",
    "寄回运费金额",
    "退回运费金额",
    "*退回运费金额",
    "amount",
    "refund_amount",
];
pub const IMAGE_CANDIDATES: &[&str] = &[
    "*商品瑕疵+金额截图",
    "商品瑕疵+金额截图",
    "寄回运费截图",
    "运费截图",
    "截图",
    "图片URL",
    "图片链接",
    "image",
    "image_url",
    "screenshot",
];
pub const ID_CANDIDATES: &[&str] = &[
    "ID", "id", "*ID", "旺旺ID", "*旺旺ID", "用户ID", "买家ID", "会员ID",
];
pub const ORDER_CANDIDATES: &[&str] = &[
    "订单号",
    "*订单号",
    "订单编号",
    "主订单号",
    "子订单号",
    "多笔订单号",
    "订单号（多笔订单分开提交）",
    "*订单号（多笔订单分开提交）",
    "order_no",
    "order_id",
];
pub const LOGISTICS_CANDIDATES: &[&str] = &[
    "*寄回换货快递单号",
    "寄回换货快递单号",
    "*退回物流单号",
    "退回物流单号",
    "寄回物流单号",
    "快递单号",
    "logistics_no",
    "tracking_no",
];

const AMOUNT_KEYWORDS: &[&str] = &["运费金额", "实付金额", "amount"];
const IMAGE_KEYWORDS: &[&str] = &["截图", "图片", "image", "screenshot"];
const LOGISTICS_KEYWORDS: &[&str] = &["物流", "快递", "logistics", "tracking"];
const ORDER_KEYWORDS: &[&str] = &["订单", "order"];
const ID_KEYWORDS: &[&str] = &["id", "旺旺"];

/// Resolved header names for the columns the engine reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub amount: String,
    pub image: String,
    pub id: Option<String>,
    pub order_no: Option<String>,
    pub logistics_no: Option<String>,
}

impl ColumnMap {
    /// Resolve the column map for `columns`.
    ///
    /// Fails with [`ReviewError::Validation`] when the amount or image column
    /// cannot be found; the key columns are optional.
    pub fn resolve(columns: &[String]) -> Result<Self> {
        let mut claimed: Vec<&str> = Vec::new();

        let amount = find_column(columns, AMOUNT_CANDIDATES, AMOUNT_KEYWORDS, &claimed);
        claimed.extend(amount);
        let image = find_column(columns, IMAGE_CANDIDATES, IMAGE_KEYWORDS, &claimed);
        claimed.extend(image);
        let logistics_no = find_column(columns, LOGISTICS_CANDIDATES, LOGISTICS_KEYWORDS, &claimed);
        claimed.extend(logistics_no);
        let order_no = find_column(columns, ORDER_CANDIDATES, ORDER_KEYWORDS, &claimed);
        claimed.extend(order_no);
        let id = find_column(columns, ID_CANDIDATES, ID_KEYWORDS, &claimed);

        let mut missing = Vec::new();
        if amount.is_none() {
            missing.push(format!("amount (candidates: {})", AMOUNT_CANDIDATES.join(", ")));
        }
        if image.is_none() {
            missing.push(format!("screenshot (candidates: {})", IMAGE_CANDIDATES.join(", ")));
        }
        match (amount, image) {
            (Some(amount), Some(image)) => Ok(Self {
                amount: amount.to_owned(),
                image: image.to_owned(),
                id: id.map(str::to_owned),
                order_no: order_no.map(str::to_owned),
                logistics_no: logistics_no.map(str::to_owned),
            }),
            _ => Err(ReviewError::Validation(format!(
                "missing required columns: {}",
                missing.join("; ")
            ))),
        }
    }

    /// Read the alignment key of one record.
    pub fn key_of(&self, columns: &[String], values: &[String]) -> RowKey {
        let cell = |name: &Option<String>| -> &str {
            name.as_deref()
                .and_then(|n| columns.iter().position(|c| c == n))
                .and_then(|i| values.get(i))
                .map_or("", String::as_str)
        };
        RowKey::from_cells(cell(&self.id), cell(&self.order_no), cell(&self.logistics_no))
    }

    /// Names of the key fields that could not be resolved.
    pub fn missing_key_columns(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.id.is_none() {
            missing.push("id");
        }
        if self.order_no.is_none() {
            missing.push("order_no");
        }
        if self.logistics_no.is_none() {
            missing.push("logistics_no");
        }
        missing
    }
}

fn find_column<'a>(
    columns: &'a [String],
    candidates: &[&str],
    keywords: &[&str],
    claimed: &[&str],
) -> Option<&'a str> {
    let free = |c: &&'a String| !claimed.contains(&c.as_str());

    for candidate in candidates {
        if let Some(col) = columns.iter().filter(free).find(|c| c.as_str() == *candidate) {
            return Some(col.as_str());
        }
    }
    columns
        .iter()
        .filter(free)
        .find(|c| {
            let name = c.trim().to_lowercase();
            keywords.iter().any(|k| name.contains(&k.to_lowercase()))
        })
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_exact_candidates() {
        let columns = cols(&["旺旺ID", "订单号", "寄回物流单号", "寄回运费金额", "运费截图"]);
        let map = ColumnMap::resolve(&columns).unwrap();
        assert_eq!(map.amount, "寄回运费金额");
        assert_eq!(map.image, "运费截图");
        assert_eq!(map.id.as_deref(), Some("旺旺ID"));
        assert_eq!(map.order_no.as_deref(), Some("订单号"));
        assert_eq!(map.logistics_no.as_deref(), Some("寄回物流单号"));
        assert!(map.missing_key_columns().is_empty());
    }

    #[test]
    fn falls_back_to_keywords() {
        let columns = cols(&["Refund Amount (CNY)", "Screenshot Links", "Tracking Number"]);
        let map = ColumnMap::resolve(&columns).unwrap();
        assert_eq!(map.amount, "Refund Amount (CNY)");
        assert_eq!(map.image, "Screenshot Links");
        assert_eq!(map.logistics_no.as_deref(), Some("Tracking Number"));
        assert_eq!(map.missing_key_columns(), vec!["id", "order_no"]);
    }

    #[test]
    fn missing_required_columns_are_named() {
        let err = ColumnMap::resolve(&cols(&["id", "order_no"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("amount"), "{msg}");
        assert!(msg.contains("screenshot"), "{msg}");
    }

    #[test]
    fn key_of_normalizes_cells() {
        let columns = cols(&["id", "order_no", "logistics_no", "amount", "image"]);
        let map = ColumnMap::resolve(&columns).unwrap();
        let key = map.key_of(&columns, &cols(&["7", "1.2E+3", "SF 001-2", "5", ""]));
        assert_eq!(key, RowKey::from_cells("7", "1200", "SF0012"));
    }
}
