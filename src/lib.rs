//! Mesa POS - restaurant back office.
//!
//! Orders on tables, billing, inventory, cash boxes and clients over one
//! local SQLite store. The binary speaks a line-delimited JSON protocol on
//! stdin/stdout; see [`commands`] for the command names.

use anyhow::Context;
use std::io::{BufRead, Write};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod auth;
pub mod billing;
pub mod cash_boxes;
pub mod clients;
pub mod commands;
pub mod config;
mod data_helpers;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod inventory;
pub mod orders;
pub mod reports;
pub mod seed;
pub mod tables;

use crate::commands::AppState;
use crate::config::AppConfig;

/// Structured logging: console on stderr plus a daily rolling file.
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(config: &AppConfig) -> anyhow::Result<WorkerGuard> {
    let env_filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new("info,mesa_pos_lib=debug"));

    // Prune old log files before setting up the appender
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log dir {}", config.log_dir.display()))?;
    let pruned = diagnostics::prune_old_logs(&config.log_dir);

    let file_appender =
        tracing_appender::rolling::daily(&config.log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    // stdout carries the protocol
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if pruned > 0 {
        info!(pruned, "Pruned old log files");
    }
    Ok(guard)
}

pub fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let _guard = init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "Starting Mesa POS"
    );

    let db_state = db::init(&config.data_dir).context("Failed to initialize database")?;
    if config.seed_demo_data {
        match seed::seed_demo_data(&db_state) {
            Ok(report) if report.seeded => info!(products = report.products, "Demo data ready"),
            Ok(_) => {}
            Err(e) => warn!("Demo data seeding failed: {e}"),
        }
    }
    let state = AppState::new(db_state, config);

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = commands::handle_line(&state, &line);
        writeln!(out, "{response}").context("Failed to write response")?;
        out.flush().context("Failed to flush response")?;
    }

    info!("Input closed, shutting down");
    Ok(())
}
