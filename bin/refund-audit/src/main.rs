//! refund-audit – entry point.
//!
//! Startup order:
//! 1. Parse the command line and configuration from environment variables.
//! 2. Initialise structured tracing (stderr, optionally JSON and a daily file).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Dispatch the subcommand; results are printed to stdout as JSON.
//!
//! `start` and `resume` stay in the foreground until the task goes idle. On
//! Ctrl-C or SIGTERM no further loop is scheduled and the task is paused at
//! the next row boundary first.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use refund_audit_core::{DashScopeProcessor, SourceTable, SqliteStore, TaskController};

use crate::cli::{Cli, Command};
use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(url) = cli.database_url.clone() {
        cfg.database_url = url;
    }
    if let Some(dir) = cli.artifact_dir.clone() {
        cfg.artifact_dir = dir;
    }

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "refund-audit starting");

    // ── 3. Database and engine ─────────────────────────────────────────────────
    let engine = cfg.engine();
    let store = SqliteStore::connect(&engine.database_url)
        .await
        .with_context(|| format!("failed to open {}", engine.database_url))?;
    let processor = DashScopeProcessor::new(&engine.service)?;
    let controller = TaskController::new(store, Arc::new(processor), engine);

    // ── 4. Command ─────────────────────────────────────────────────────────────
    match cli.command {
        Command::Start(args) => {
            let table = SourceTable::from_csv_path(&args.csv)?;
            let config = args.review_config();
            if args.detach {
                let created = controller.create(table, config).await?;
                print_json(&created)?;
            } else {
                let started = controller.start(table, config).await?;
                info!(task_id = %started.task_id, "task started; Ctrl-C pauses it");
                run_in_foreground(&controller, &started.task_id).await?;
            }
        }
        Command::Resume(args) => {
            controller.resume(&args.task_id, args.overrides()).await?;
            run_in_foreground(&controller, &args.task_id).await?;
        }
        Command::Pause { task_id } => {
            controller.pause(&task_id).await?;
            print_json(&controller.status(&task_id).await?)?;
        }
        Command::Status { task_id } => print_json(&controller.status(&task_id).await?)?,
        Command::Rows {
            task_id,
            scope,
            page,
            page_size,
        } => print_json(&controller.rows(&task_id, scope, page, page_size).await?)?,
        Command::Align { task_id } => print_json(&controller.alignment_check(&task_id).await?)?,
        Command::Snapshot { task_id } => print_json(&controller.snapshot(&task_id).await?)?,
        Command::Latest { all } => print_json(&controller.latest(!all).await?)?,
        Command::Recover => {
            let paused = controller.recover().await?;
            print_json(&serde_json::json!({ "paused": paused }))?;
        }
    }

    Ok(())
}

/// Wait for the task loop to go idle, pausing it first on a shutdown signal,
/// then print the final aggregate.
async fn run_in_foreground(controller: &TaskController, task_id: &str) -> anyhow::Result<()> {
    tokio::select! {
        _ = controller.wait_idle(task_id) => {}
        _ = shutdown_signal() => {
            controller.close();
            match controller.pause(task_id).await {
                Ok(()) => info!(task_id, "pausing; waiting for the row in flight"),
                Err(e) => warn!(task_id, error = %e, "pause on shutdown was not applied"),
            }
            controller.wait_idle(task_id).await;
        }
    }
    print_json(&controller.status(task_id).await?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Install the global subscriber. The returned guard flushes the log file on
/// drop and must live until exit.
fn init_tracing(cfg: &Config) -> Option<WorkerGuard> {
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: AUDIT_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "refund-audit.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);
    if cfg.log_json {
        registry.with(stderr_layer.json()).init();
    } else {
        registry.with(stderr_layer).init();
    }
    guard
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
