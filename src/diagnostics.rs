//! Diagnostics module for Mesa POS.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, database size, row counts and open
//!   sessions / orders
//! - **Log rotation helpers**: used by `lib.rs` to keep the log directory small.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db::{self, DbState};
use crate::error::PosResult;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "mesa";

/// Tables whose row counts are reported by [`get_system_health`].
const COUNTED_TABLES: &[&str] = &[
    "products",
    "warehouses",
    "inventory_movements",
    "clients",
    "dining_tables",
    "orders",
    "invoices",
    "invoice_payments",
    "cash_boxes",
    "cash_box_sessions",
];

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub schema_version: i32,
    pub expected_schema_version: i32,
    pub db_path: String,
    pub db_size_bytes: u64,
    pub row_counts: BTreeMap<String, i64>,
    pub open_orders: i64,
    pub open_cash_sessions: i64,
    pub active_staff_sessions: i64,
    pub log_dir: String,
    pub log_files: usize,
}

/// Collects health information for the status screen.
pub fn get_system_health(db: &DbState, log_dir: &Path) -> PosResult<SystemHealth> {
    let conn = db.conn.lock()?;

    let mut row_counts = BTreeMap::new();
    for table in COUNTED_TABLES {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        row_counts.insert(table.to_string(), n);
    }

    let open_orders: i64 = conn.query_row(
        "SELECT COUNT(*) FROM orders WHERE status NOT IN ('closed', 'cancelled')",
        [],
        |row| row.get(0),
    )?;
    let open_cash_sessions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cash_box_sessions WHERE status = 'open'",
        [],
        |row| row.get(0),
    )?;
    let active_staff_sessions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM staff_sessions WHERE is_active = 1",
        [],
        |row| row.get(0),
    )?;

    Ok(SystemHealth {
        schema_version: db::schema_version(&conn),
        expected_schema_version: db::CURRENT_SCHEMA_VERSION,
        db_path: db.db_path.display().to_string(),
        db_size_bytes: fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0),
        row_counts,
        open_orders,
        open_cash_sessions,
        active_staff_sessions,
        log_dir: log_dir.display().to_string(),
        log_files: list_log_files(log_dir).len(),
    })
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Log files in `log_dir`, newest first.
fn list_log_files(log_dir: &Path) -> Vec<(PathBuf, std::time::SystemTime)> {
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    log_files
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
/// Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }
    let mut removed = 0;
    for (path, _) in list_log_files(log_dir).iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{label}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    fn test_system_health_with_empty_db() {
        let dir = temp_dir("diag_test");
        let db_state = db::init(&dir).unwrap();
        let health = get_system_health(&db_state, &dir.join("logs")).unwrap();
        assert_eq!(health.schema_version, db::CURRENT_SCHEMA_VERSION);
        assert_eq!(health.row_counts.get("invoices"), Some(&0));
        assert_eq!(health.open_cash_sessions, 0);
        assert!(health.db_path.ends_with("mesa.db"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = temp_dir("diag_logs");
        for day in 1..=13 {
            fs::write(dir.join(format!("{LOG_FILE_PREFIX}.2024-01-{day:02}")), "x").unwrap();
        }
        fs::write(dir.join("other.txt"), "keep").unwrap();

        let removed = prune_old_logs(&dir);
        assert_eq!(removed, 3);
        assert_eq!(list_log_files(&dir).len(), MAX_LOG_FILES);
        assert!(dir.join("other.txt").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = std::env::temp_dir().join(format!("diag_missing_{}", uuid::Uuid::new_v4()));
        assert_eq!(prune_old_logs(&dir), 0);
    }
}
