//! CLI configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use refund_audit_core::config::DEFAULT_DASHSCOPE_ENDPOINT;
use refund_audit_core::{EngineConfig, ServiceConfig};

/// Runtime configuration for refund-audit.
///
/// Every field has a default so the tool works without any environment
/// variables besides the API key.
#[derive(Clone)]
pub struct Config {
    /// sqlx SQLite URL (default: `"sqlite://refund_audit.db"`).
    pub database_url: String,

    /// Directory receiving CSV exports (default: `"data/artifacts"`).
    pub artifact_dir: PathBuf,

    /// Task loops allowed to process rows concurrently.
    pub workers: usize,

    /// Fallback DashScope key for tasks started without one.
    pub dashscope_api_key: Option<String>,

    pub dashscope_endpoint: String,

    /// Per-request timeout for the judgment service, in seconds.
    pub request_timeout_sec: u64,

    /// `tracing` filter string, e.g. `"info"` or `"refund_audit_core=debug"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("artifact_dir", &self.artifact_dir)
            .field("workers", &self.workers)
            .field("dashscope_api_key", &self.dashscope_api_key.as_ref().map(|_| "<set>"))
            .field("dashscope_endpoint", &self.dashscope_endpoint)
            .field("request_timeout_sec", &self.request_timeout_sec)
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("AUDIT_DATABASE_URL", "sqlite://refund_audit.db"),
            artifact_dir: PathBuf::from(env_or("AUDIT_ARTIFACT_DIR", "data/artifacts")),
            workers: parse_env("AUDIT_WORKERS", 2),
            dashscope_api_key: std::env::var("DASHSCOPE_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            dashscope_endpoint: env_or("AUDIT_DASHSCOPE_ENDPOINT", DEFAULT_DASHSCOPE_ENDPOINT),
            request_timeout_sec: parse_env("AUDIT_REQUEST_TIMEOUT_SEC", 60),
            log_level: env_or("AUDIT_LOG", "info"),
            log_json: std::env::var("AUDIT_LOG_JSON")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            log_dir: std::env::var("AUDIT_LOG_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            database_url: self.database_url.clone(),
            artifact_dir: self.artifact_dir.clone(),
            workers: self.workers,
            default_api_key: self.dashscope_api_key.clone(),
            service: ServiceConfig {
                endpoint: self.dashscope_endpoint.clone(),
                request_timeout: Duration::from_secs(self.request_timeout_sec.max(1)),
            },
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
