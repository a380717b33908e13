//! Prompt construction and reply parsing for the shipping-fee check.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::ProcessError;
use crate::source::cells::parse_money;

/// Amounts within this distance are considered equal.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

static JSON_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").expect("valid json block regex"));

/// Build the instruction sent alongside the screenshots.
pub fn build_prompt(expected_amount: f64) -> String {
    format!(
        "You are a finance reviewer for after-sales refunds. The user uploaded one or more \
screenshots of the same return shipment, ordered top to bottom.\n\
Find the amount (in yuan) of the return shipping fee, labelled e.g. 寄回运费, 快递费, 配送费, \
邮费, 寄件费用, 实付运费 or 总运费, and compare it with the declared amount.\n\
\n\
Declared return shipping fee: expected_amount = {expected_amount:.2} yuan.\n\
\n\
Rules:\n\
1) Only treat an amount explicitly tied to a shipping-fee label as the shipping fee.\n\
2) When several amounts appear (goods amount, order total, paid, discount, refund), prefer \
the one adjacent to the shipping-fee label; never use the goods amount.\n\
3) A fee shown as 0, 0.00, ¥0 or 免运费 is 0.\n\
4) If no screenshot shows a shipping-fee field, return paid_amount = null and say why in \
reason (no fee field found, screenshots are not shipping receipts, image unreadable).\n\
5) Amounts within {AMOUNT_TOLERANCE} are equal: is_match = true; otherwise false; null when \
the fee cannot be read.\n\
6) Do not guess. If unsure, return null.\n\
\n\
Output JSON only, no other text, with fields:\n\
- paid_amount: number or null\n\
- is_match: true/false or null\n\
- reason: short explanation"
    )
}

/// The model's judgment after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub paid_amount: Option<f64>,
    pub is_match: Option<bool>,
    pub reason: String,
}

/// Parse the model's text reply.
///
/// Accepts a bare JSON object or the first `{...}` block inside surrounding
/// prose or code fences. A missing `is_match` is derived from `paid_amount`.
pub fn parse_reply(raw: &str, expected_amount: f64) -> Result<Judgment, ProcessError> {
    let object = serde_json::from_str::<Value>(raw.trim())
        .ok()
        .filter(Value::is_object)
        .or_else(|| {
            JSON_BLOCK
                .find(raw)
                .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
                .filter(Value::is_object)
        })
        .ok_or_else(|| {
            ProcessError::ExternalService(format!(
                "model output is not JSON: {}",
                truncate(raw, 200)
            ))
        })?;

    let paid_amount = match object.get("paid_amount") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_money(s),
        _ => None,
    };
    let is_match = match object.get("is_match") {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
    .or_else(|| paid_amount.map(|paid| amounts_match(paid, expected_amount)));

    let reason = match object.get("reason") {
        Some(Value::String(s)) => s.trim().to_owned(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let reason = if !reason.is_empty() {
        reason
    } else if is_match == Some(true) {
        "match".to_owned()
    } else if paid_amount.is_none() {
        "amount not recognised".to_owned()
    } else {
        "mismatch".to_owned()
    };

    Ok(Judgment {
        paid_amount,
        is_match,
        reason,
    })
}

pub fn amounts_match(paid: f64, expected: f64) -> bool {
    (paid - expected).abs() <= AMOUNT_TOLERANCE + 1e-9
}

fn truncate(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_expected_amount() {
        let prompt = build_prompt(8.0);
        assert!(prompt.contains("expected_amount = 8.00"));
        assert!(prompt.contains("paid_amount"));
    }

    #[test]
    fn parses_plain_json() {
        let j = parse_reply(r#"{"paid_amount": 8, "is_match": true, "reason": "fee 8.00"}"#, 8.0)
            .unwrap();
        assert_eq!(j.paid_amount, Some(8.0));
        assert_eq!(j.is_match, Some(true));
        assert_eq!(j.reason, "fee 8.00");
    }

    #[test]
    fn extracts_json_from_fenced_output() {
        let raw = "Here you go:\n```json\n{\"paid_amount\": \"¥12.00\", \"reason\": \"\"}\n```";
        let j = parse_reply(raw, 10.0).unwrap();
        assert_eq!(j.paid_amount, Some(12.0));
        assert_eq!(j.is_match, Some(false), "derived from the amounts");
        assert_eq!(j.reason, "mismatch");
    }

    #[test]
    fn derives_match_within_tolerance() {
        let j = parse_reply(r#"{"paid_amount": 9.995}"#, 10.0).unwrap();
        assert_eq!(j.is_match, Some(true));
        assert_eq!(j.reason, "match");
    }

    #[test]
    fn unreadable_amount_stays_undecided() {
        let j = parse_reply(r#"{"paid_amount": null, "is_match": null}"#, 10.0).unwrap();
        assert_eq!(j.is_match, None);
        assert_eq!(j.reason, "amount not recognised");
    }

    #[test]
    fn prose_is_malformed() {
        let err = parse_reply("I cannot see any fee in these images.", 5.0).unwrap_err();
        assert!(matches!(err, ProcessError::ExternalService(_)));
        assert!(!err.is_fatal());
    }
}
