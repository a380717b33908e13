//! Cell-level normalization: money amounts, identifiers and image links.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

static MONEY_CLEAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^0-9.\-]").expect("valid money regex"));
static NON_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]").expect("valid alnum regex"));
static SCI_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-]?)(\d*)(?:\.(\d*))?[eE]([+-]?\d+)$").expect("valid scientific regex")
});
static INTEGRAL_FLOAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([+-]?\d+)\.0+$").expect("valid float regex"));
static URL_IN_PARENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((https?://[^\s)]+)\)").expect("valid url regex"));
static URL_GENERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(https?://[^\s\]"')]+)"#).expect("valid url regex"));
static PREVIEW_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__|;|\s+").expect("valid split regex"));

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".bmp"];

/// Largest exponent expanded in an identifier; bigger ones keep the raw text.
const MAX_IDENTIFIER_EXPONENT: u64 = 64;

/// Natural identity of a row, used by the alignment check.
///
/// Empty strings stand for "absent in the source data".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub id: String,
    pub order_no: String,
    pub logistics_no: String,
}

impl RowKey {
    /// Build a key from raw cells, applying identifier and tracking-number
    /// normalization.
    pub fn from_cells(id: &str, order_no: &str, logistics_no: &str) -> Self {
        Self {
            id: normalize_identifier(id),
            order_no: normalize_identifier(order_no),
            logistics_no: normalize_logistics(logistics_no),
        }
    }
}

/// Parse a money amount written the way spreadsheets export it
/// (`"￥12.50"`, `"1,200 元"`, `" 8 "`).
pub fn parse_money(raw: &str) -> Option<f64> {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '￥' | '¥' | '元' | ','))
        .collect();
    let cleaned = MONEY_CLEAN.replace_all(&stripped, "");
    if matches!(cleaned.as_ref(), "" | "." | "-" | "-.") {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Normalize an identifier cell: expand scientific notation produced by
/// spreadsheet exports and drop a zero fractional part.
pub fn normalize_identifier(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }
    if let Some(expanded) = expand_scientific(value) {
        return expanded;
    }
    if let Some(caps) = INTEGRAL_FLOAT.captures(value) {
        return caps[1].to_owned();
    }
    value.to_owned()
}

/// Keep only ASCII letters and digits of a tracking number.
pub fn normalize_logistics(raw: &str) -> String {
    NON_ALNUM.replace_all(raw.trim(), "").into_owned()
}

fn expand_scientific(value: &str) -> Option<String> {
    let caps = SCI_NUMBER.captures(value)?;
    let sign = caps.get(1).map_or("", |m| m.as_str());
    let int_part = caps.get(2).map_or("", |m| m.as_str());
    let frac_part = caps.get(3).map_or("", |m| m.as_str());
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let exponent: i64 = caps[4].parse().ok()?;
    if exponent.unsigned_abs() > MAX_IDENTIFIER_EXPONENT {
        return None;
    }

    let digits = format!("{int_part}{frac_part}");
    let point = i64::try_from(int_part.len()).ok()?.checked_add(exponent)?;

    let (whole, fraction) = if point <= 0 {
        let zeros = "0".repeat(point.unsigned_abs() as usize);
        (String::from("0"), format!("{zeros}{digits}"))
    } else if point as usize >= digits.len() {
        let zeros = "0".repeat(point as usize - digits.len());
        (format!("{digits}{zeros}"), String::new())
    } else {
        let (w, f) = digits.split_at(point as usize);
        (w.to_owned(), f.to_owned())
    };

    let whole = whole.trim_start_matches('0');
    let whole = if whole.is_empty() { "0" } else { whole };
    let fraction = fraction.trim_end_matches('0');

    let body = if fraction.is_empty() {
        whole.to_owned()
    } else {
        format!("{whole}.{fraction}")
    };
    if body == "0" {
        return Some(body);
    }
    Some(format!("{}{body}", if sign == "-" { "-" } else { "" }))
}

/// Extract up to `max_images` image references from a screenshot cell.
///
/// Markdown-style `(url)` links are collected first, then bare links. Preview
/// pages that wrap the real images in a `url=` query parameter are expanded.
/// Links with an image extension win; otherwise any `http` link is used.
pub fn extract_image_urls(cell: &str, max_images: usize) -> Vec<String> {
    let raw = cell.trim();
    if raw.is_empty() || max_images == 0 {
        return Vec::new();
    }

    let found: Vec<&str> = URL_IN_PARENS
        .captures_iter(raw)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .chain(URL_GENERIC.find_iter(raw).map(|m| m.as_str()))
        .collect();
    let urls = dedupe(found, None);

    let picked = pick_image_urls(&urls, max_images);
    if !picked.is_empty() {
        return picked;
    }

    if raw.starts_with("http") {
        let expanded = expand_preview_url(raw);
        let images: Vec<String> = expanded.iter().filter(|u| is_image_url(u)).cloned().collect();
        let chosen = if images.is_empty() { expanded } else { images };
        return chosen.into_iter().take(max_images).collect();
    }
    Vec::new()
}

fn pick_image_urls(urls: &[String], max_images: usize) -> Vec<String> {
    let expanded: Vec<String> = urls.iter().flat_map(|u| expand_preview_url(u)).collect();

    let images = dedupe(
        expanded.iter().map(String::as_str).filter(|u| is_image_url(u)),
        Some(max_images),
    );
    if !images.is_empty() {
        return images;
    }
    dedupe(
        expanded.iter().map(String::as_str).filter(|u| u.starts_with("http")),
        Some(max_images),
    )
}

/// Expand a preview link of the form `...?url=<img1>__<img2>` into the
/// embedded links; any other link is returned unchanged.
pub fn expand_preview_url(link: &str) -> Vec<String> {
    let link = link.trim();
    if link.is_empty() {
        return Vec::new();
    }
    if let Ok(parsed) = Url::parse(link) {
        if let Some((_, embedded)) = parsed.query_pairs().find(|(k, _)| k == "url") {
            let parts: Vec<String> = PREVIEW_SPLIT
                .split(&embedded)
                .map(str::trim)
                .filter(|p| p.starts_with("http"))
                .map(str::to_owned)
                .collect();
            if !parts.is_empty() {
                return parts;
            }
        }
    }
    vec![link.to_owned()]
}

fn is_image_url(link: &str) -> bool {
    let lower = link.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn dedupe<'a>(values: impl IntoIterator<Item = &'a str>, cap: Option<usize>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values {
        let item = value.trim();
        if item.is_empty() || !seen.insert(item) {
            continue;
        }
        out.push(item.to_owned());
        if cap.is_some_and(|c| out.len() >= c) {
            break;
        }
    }
    out
}
