//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use refund_audit_core::{ResumeOverride, ReviewConfig, RowScope, min_interval_from_budget};

#[derive(Debug, Parser)]
#[command(name = "refund-audit", version)]
#[command(about = "Resumable AI review of refund shipping-fee screenshots", long_about = None)]
pub struct Cli {
    /// Overrides AUDIT_DATABASE_URL.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Overrides AUDIT_ARTIFACT_DIR.
    #[arg(long, global = true)]
    pub artifact_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a review task from a CSV export and process it.
    Start(StartArgs),
    /// Continue a paused, failed or detached task from its first pending row.
    Resume(ResumeArgs),
    /// Ask a running task to stop after the row in flight.
    Pause { task_id: String },
    /// Print the task aggregate.
    Status { task_id: String },
    /// Print one page of rows.
    Rows {
        task_id: String,
        /// all, processed or pending.
        #[arg(long, default_value = "all")]
        scope: RowScope,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
    /// Compare source keys with processed rows.
    Align { task_id: String },
    /// Export processed, unprocessed, ok and bad rows as CSV.
    Snapshot { task_id: String },
    /// Print the most recent task id.
    Latest {
        /// Include completed and failed tasks.
        #[arg(long)]
        all: bool,
    },
    /// Pause tasks left running by a process that exited uncleanly.
    Recover,
}

/// Pacing, given either directly or as a "seconds per rows" budget.
#[derive(Debug, Clone, Args)]
pub struct RateArgs {
    /// Minimum seconds between two external calls.
    #[arg(long, conflicts_with_all = ["rate_seconds", "rate_rows"])]
    pub min_interval: Option<f64>,

    /// Budget window in seconds; used with --rate-rows.
    #[arg(long, requires = "rate_rows")]
    pub rate_seconds: Option<f64>,

    /// Rows allowed per --rate-seconds window.
    #[arg(long, requires = "rate_seconds")]
    pub rate_rows: Option<f64>,
}

impl RateArgs {
    pub fn min_interval_sec(&self) -> Option<f64> {
        match (self.min_interval, self.rate_seconds, self.rate_rows) {
            (Some(secs), _, _) => Some(secs),
            (None, Some(seconds), Some(rows)) => Some(min_interval_from_budget(seconds, rows)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// CSV export with a header row.
    pub csv: PathBuf,

    #[arg(long)]
    pub model: Option<String>,

    /// Per-task key; falls back to DASHSCOPE_API_KEY.
    #[arg(long)]
    pub api_key: Option<String>,

    #[arg(long)]
    pub max_images: Option<u32>,

    #[arg(long)]
    pub max_rows: Option<u32>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub backoff_base: Option<f64>,

    #[command(flatten)]
    pub rate: RateArgs,

    /// Create the task and exit; run it later with `resume`.
    #[arg(long)]
    pub detach: bool,
}

impl StartArgs {
    pub fn review_config(&self) -> ReviewConfig {
        let defaults = ReviewConfig::default();
        ReviewConfig {
            model_name: self.model.clone().unwrap_or(defaults.model_name),
            api_key: self.api_key.clone(),
            max_images: self.max_images.unwrap_or(defaults.max_images),
            max_rows: self.max_rows.unwrap_or(defaults.max_rows),
            min_interval_sec: self
                .rate
                .min_interval_sec()
                .unwrap_or(defaults.min_interval_sec),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff_base_sec: self.backoff_base.unwrap_or(defaults.backoff_base_sec),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ResumeArgs {
    pub task_id: String,

    #[arg(long)]
    pub api_key: Option<String>,

    #[command(flatten)]
    pub rate: RateArgs,
}

impl ResumeArgs {
    pub fn overrides(&self) -> ResumeOverride {
        ResumeOverride {
            api_key: self.api_key.clone(),
            min_interval_sec: self.rate.min_interval_sec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rate_budget_becomes_an_interval() {
        let cli = Cli::parse_from([
            "refund-audit",
            "start",
            "refunds.csv",
            "--rate-seconds",
            "60",
            "--rate-rows",
            "30",
            "--max-rows",
            "10",
        ]);
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        let config = args.review_config();
        assert_eq!(config.min_interval_sec, 2.0);
        assert_eq!(config.max_rows, 10);
        assert_eq!(config.max_images, ReviewConfig::default().max_images);
        assert!(!args.detach);
    }

    #[test]
    fn interval_and_budget_are_exclusive() {
        let res = Cli::try_parse_from([
            "refund-audit",
            "resume",
            "ai_1",
            "--min-interval",
            "1",
            "--rate-seconds",
            "60",
            "--rate-rows",
            "30",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn rows_scope_parses() {
        let cli = Cli::parse_from(["refund-audit", "rows", "ai_1", "--scope", "pending"]);
        let Command::Rows { scope, page, page_size, .. } = cli.command else {
            panic!("expected rows");
        };
        assert_eq!(scope, RowScope::Pending);
        assert_eq!((page, page_size), (1, 50));
    }

    #[test]
    fn resume_without_overrides_keeps_task_settings() {
        let cli = Cli::parse_from(["refund-audit", "resume", "ai_1"]);
        let Command::Resume(args) = cli.command else {
            panic!("expected resume");
        };
        let overrides = args.overrides();
        assert!(overrides.api_key.is_none());
        assert!(overrides.min_interval_sec.is_none());
    }
}
