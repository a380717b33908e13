//! Engine-wide settings and per-task review configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{Result, ReviewError};

/// Pacing interval used when a rate budget cannot produce a usable ratio.
pub const DEFAULT_MIN_INTERVAL_SEC: f64 = 0.8;

/// Default DashScope multimodal generation endpoint.
pub const DEFAULT_DASHSCOPE_ENDPOINT: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/multimodal-generation/generation";

/// Derive the per-row pacing interval from a "`seconds` per `rows`" budget.
///
/// Falls back to [`DEFAULT_MIN_INTERVAL_SEC`] when the ratio is non-positive
/// or non-finite (zero rows, NaN input, negative seconds, …).
pub fn min_interval_from_budget(seconds: f64, rows: f64) -> f64 {
    let ratio = seconds / rows;
    if ratio.is_finite() && ratio > 0.0 {
        ratio
    } else {
        DEFAULT_MIN_INTERVAL_SEC
    }
}

/// Settings shared by every task the engine runs.
///
/// Built once at process start (the binary reads them from the environment)
/// and handed to [`crate::TaskController::new`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// sqlx SQLite URL, e.g. `sqlite://refund_audit.db` or `sqlite::memory:`.
    pub database_url: String,
    /// Directory receiving snapshot and completion CSV files.
    pub artifact_dir: PathBuf,
    /// Number of task loops allowed to process rows at the same time.
    pub workers: usize,
    /// API key used when a task does not carry its own.
    pub default_api_key: Option<String>,
    pub service: ServiceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://refund_audit.db".to_owned(),
            artifact_dir: PathBuf::from("data/artifacts"),
            workers: 2,
            default_api_key: None,
            service: ServiceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Resolve the key a task should run with: the explicit one if non-blank,
    /// otherwise the engine default.
    pub fn effective_api_key(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .or_else(|| {
                self.default_api_key
                    .as_deref()
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
            })
            .map(str::to_owned)
    }
}

/// Connection settings for the external judgment service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub endpoint: String,
    /// Upper bound for a single HTTP exchange; expiry is a per-row failure.
    pub request_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_DASHSCOPE_ENDPOINT.to_owned(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Caller-supplied configuration for one review task.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReviewConfig {
    #[validate(custom(function = "validate_not_blank"))]
    pub model_name: String,

    /// Per-task credentials; never persisted.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[validate(range(min = 1, max = 10))]
    pub max_images: u32,

    #[validate(range(min = 1, max = 10000))]
    pub max_rows: u32,

    #[validate(range(min = 0.0, max = 3600.0), custom(function = "validate_finite"))]
    pub min_interval_sec: f64,

    #[validate(range(min = 0, max = 10))]
    pub max_retries: u32,

    #[validate(range(min = 0.1, max = 60.0), custom(function = "validate_finite"))]
    pub backoff_base_sec: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            model_name: "qwen3-vl-flash".to_owned(),
            api_key: None,
            max_images: 4,
            max_rows: 300,
            min_interval_sec: DEFAULT_MIN_INTERVAL_SEC,
            max_retries: 4,
            backoff_base_sec: 1.0,
        }
    }
}

impl ReviewConfig {
    /// Run the declarative range checks and return the config with its model
    /// name trimmed.
    pub fn validated(mut self) -> Result<Self> {
        self.validate()?;
        self.model_name = self.model_name.trim().to_owned();
        Ok(self)
    }
}

/// Optional settings re-applied when a task is resumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeOverride {
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub min_interval_sec: Option<f64>,
}

impl ResumeOverride {
    pub fn validated(self) -> Result<Self> {
        if let Some(secs) = self.min_interval_sec {
            if !secs.is_finite() || !(0.0..=3600.0).contains(&secs) {
                return Err(ReviewError::Validation(format!(
                    "min_interval_sec must be within 0..=3600, got {secs}"
                )));
            }
        }
        Ok(self)
    }
}

fn validate_not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some("must not be blank".into());
        return Err(err);
    }
    Ok(())
}

fn validate_finite(value: f64) -> std::result::Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::new("not_finite"))
    }
}

/// Reject a config that cannot run because no credentials resolve.
pub(crate) fn require_api_key(engine: &EngineConfig, explicit: Option<&str>) -> Result<String> {
    engine.effective_api_key(explicit).ok_or_else(|| {
        ReviewError::Validation(
            "missing DashScope API key: pass one with the task or set DASHSCOPE_API_KEY".into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_ratio_falls_back_when_unusable() {
        assert!((min_interval_from_budget(60.0, 75.0) - 0.8).abs() < 1e-9);
        assert!((min_interval_from_budget(30.0, 60.0) - 0.5).abs() < 1e-9);
        assert_eq!(min_interval_from_budget(0.0, 10.0), DEFAULT_MIN_INTERVAL_SEC);
        assert_eq!(min_interval_from_budget(10.0, 0.0), DEFAULT_MIN_INTERVAL_SEC);
        assert_eq!(min_interval_from_budget(-5.0, 10.0), DEFAULT_MIN_INTERVAL_SEC);
        assert_eq!(min_interval_from_budget(f64::NAN, 10.0), DEFAULT_MIN_INTERVAL_SEC);
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = ReviewConfig::default().validated().expect("defaults validate");
        assert_eq!(cfg.max_images, 4);
        assert_eq!(cfg.max_rows, 300);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cases = [
            ReviewConfig { max_images: 0, ..Default::default() },
            ReviewConfig { max_images: 11, ..Default::default() },
            ReviewConfig { max_rows: 0, ..Default::default() },
            ReviewConfig { max_rows: 10_001, ..Default::default() },
            ReviewConfig { min_interval_sec: -0.1, ..Default::default() },
            ReviewConfig { min_interval_sec: f64::NAN, ..Default::default() },
            ReviewConfig { max_retries: 11, ..Default::default() },
            ReviewConfig { backoff_base_sec: 0.0, ..Default::default() },
            ReviewConfig { backoff_base_sec: f64::INFINITY, ..Default::default() },
            ReviewConfig { model_name: "   ".into(), ..Default::default() },
        ];
        for cfg in cases {
            let err = cfg.clone().validated().unwrap_err();
            assert!(
                matches!(err, ReviewError::Validation(_)),
                "expected validation error for {cfg:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn model_name_is_trimmed() {
        let cfg = ReviewConfig { model_name: "  qwen-vl-plus ".into(), ..Default::default() }
            .validated()
            .unwrap();
        assert_eq!(cfg.model_name, "qwen-vl-plus");
    }

    #[test]
    fn resume_override_validates_interval() {
        assert!(ResumeOverride { min_interval_sec: Some(-1.0), ..Default::default() }
            .validated()
            .is_err());
        assert!(ResumeOverride { min_interval_sec: Some(0.0), ..Default::default() }
            .validated()
            .is_ok());
        assert!(ResumeOverride::default().validated().is_ok());
    }

    #[test]
    fn effective_key_prefers_explicit_then_default() {
        let engine = EngineConfig {
            default_api_key: Some("env-key".into()),
            ..Default::default()
        };
        assert_eq!(engine.effective_api_key(Some(" task-key ")).as_deref(), Some("task-key"));
        assert_eq!(engine.effective_api_key(Some("  ")).as_deref(), Some("env-key"));
        assert_eq!(engine.effective_api_key(None).as_deref(), Some("env-key"));

        let bare = EngineConfig::default();
        assert!(bare.effective_api_key(None).is_none());
        assert!(require_api_key(&bare, None).is_err());
    }
}
