//! Row processors turn one source row into a [`Verdict`].
//!
//! The controller only sees the [`RowProcessor`] trait; the production
//! implementation is [`DashScopeProcessor`], tests plug in stubs.

pub mod dashscope;
pub mod prompt;

use async_trait::async_trait;
use thiserror::Error;

use crate::runtime::types::Verdict;
use crate::source::cells::{extract_image_urls, parse_money};

pub use dashscope::DashScopeProcessor;

/// Failure of the external judgment call for one row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// Network error, timeout, non-success status or unparseable reply.
    /// Recorded on the row; the task keeps going.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// The service rejected the credentials. Stops the task.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ProcessError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessError::Auth(_))
    }
}

/// The cells of one row a processor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowInput {
    pub row_no: u64,
    /// Raw declared-amount cell.
    pub amount: String,
    /// Raw screenshot cell (links, markdown links or preview pages).
    pub images: String,
}

/// Per-task knobs handed to the processor with every row.
#[derive(Clone, PartialEq)]
pub struct ProcessSettings {
    pub model_name: String,
    pub api_key: String,
    pub max_images: u32,
    pub max_retries: u32,
    pub backoff_base_sec: f64,
}

impl std::fmt::Debug for ProcessSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSettings")
            .field("model_name", &self.model_name)
            .field("api_key", &"<redacted>")
            .field("max_images", &self.max_images)
            .field("max_retries", &self.max_retries)
            .field("backoff_base_sec", &self.backoff_base_sec)
            .finish()
    }
}

#[async_trait]
pub trait RowProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        row: &RowInput,
        settings: &ProcessSettings,
    ) -> Result<Verdict, ProcessError>;
}

/// A row that passed the local checks and needs an external judgment.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRow {
    pub expected_amount: f64,
    pub image_urls: Vec<String>,
}

/// Run the checks that need no external call.
///
/// Returns the final verdict directly when the row cannot be judged: an
/// unparseable declared amount is a mismatch, a row without usable images is
/// undecided.
pub fn precheck(row: &RowInput, max_images: u32) -> Result<PreparedRow, Verdict> {
    let Some(expected_amount) = parse_money(&row.amount) else {
        return Err(Verdict {
            is_match: Some(false),
            reason: "amount field is not numeric".into(),
            ..Verdict::default()
        });
    };
    let image_urls = extract_image_urls(&row.images, max_images as usize);
    if image_urls.is_empty() {
        return Err(Verdict {
            is_match: None,
            expected_amount: Some(expected_amount),
            reason: "no usable image url".into(),
            ..Verdict::default()
        });
    }
    Ok(PreparedRow {
        expected_amount,
        image_urls,
    })
}
