//! Runtime configuration.
//!
//! Process-level settings (where the database and logs live, log filter,
//! demo seeding) come from environment variables. Business settings that
//! an operator can change at runtime live in `local_settings` under the
//! `billing` category.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::db;
use crate::error::{PosError, PosResult};

pub const ENV_DATA_DIR: &str = "MESA_POS_DATA_DIR";
pub const ENV_LOG_DIR: &str = "MESA_POS_LOG_DIR";
pub const ENV_LOG_FILTER: &str = "MESA_POS_LOG";
pub const ENV_SEED_DEMO: &str = "MESA_POS_SEED_DEMO";

const APP_DIR_NAME: &str = "mesa-pos";
const DEFAULT_LOG_FILTER: &str = "info,mesa_pos_lib=debug";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_filter: String,
    pub seed_demo_data: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = non_empty_env(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let log_dir = non_empty_env(ENV_LOG_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));
        let log_filter = non_empty_env("RUST_LOG")
            .or_else(|| non_empty_env(ENV_LOG_FILTER))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let seed_demo_data = non_empty_env(ENV_SEED_DEMO)
            .and_then(|v| parse_flag(&v))
            .unwrap_or(true);

        Self {
            data_dir,
            log_dir,
            log_filter,
            seed_demo_data,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Platform data directory: `%LOCALAPPDATA%`, `$XDG_DATA_HOME`, or
/// `~/.local/share`, plus the app directory name.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

// ---------------------------------------------------------------------------
// Billing settings
// ---------------------------------------------------------------------------

const BILLING_CATEGORY: &str = "billing";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSettings {
    pub currency: String,
    pub invoice_prefix: String,
    pub default_tax_rate: f64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            currency: "EUR".into(),
            invoice_prefix: "INV".into(),
            default_tax_rate: 10.0,
        }
    }
}

/// Partial update accepted by `settings_update_billing`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSettingsUpdate {
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, alias = "invoice_prefix")]
    pub invoice_prefix: Option<String>,
    #[serde(default, alias = "default_tax_rate")]
    pub default_tax_rate: Option<f64>,
}

impl BillingSettings {
    pub fn load(conn: &Connection) -> Self {
        let defaults = Self::default();
        Self {
            currency: db::get_setting(conn, BILLING_CATEGORY, "currency")
                .unwrap_or(defaults.currency),
            invoice_prefix: db::get_setting(conn, BILLING_CATEGORY, "invoice_prefix")
                .unwrap_or(defaults.invoice_prefix),
            default_tax_rate: db::get_setting(conn, BILLING_CATEGORY, "default_tax_rate")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(defaults.default_tax_rate),
        }
    }

    pub fn apply(conn: &Connection, update: &BillingSettingsUpdate) -> PosResult<Self> {
        if let Some(currency) = update.currency.as_deref().map(str::trim) {
            if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(PosError::validation(
                    "Currency must be a 3-letter ISO code",
                ));
            }
            db::set_setting(conn, BILLING_CATEGORY, "currency", &currency.to_ascii_uppercase())?;
        }
        if let Some(prefix) = update.invoice_prefix.as_deref().map(str::trim) {
            if prefix.is_empty() || prefix.len() > 8 || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(PosError::validation(
                    "Invoice prefix must be 1-8 alphanumeric characters",
                ));
            }
            db::set_setting(conn, BILLING_CATEGORY, "invoice_prefix", prefix)?;
        }
        if let Some(rate) = update.default_tax_rate {
            if !(0.0..=100.0).contains(&rate) {
                return Err(PosError::validation("Tax rate must be between 0 and 100"));
            }
            db::set_setting(conn, BILLING_CATEGORY, "default_tax_rate", &rate.to_string())?;
        }
        Ok(Self::load(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        std::env::set_var(ENV_DATA_DIR, "/tmp/mesa-test-data");
        std::env::set_var(ENV_SEED_DEMO, "off");
        std::env::remove_var(ENV_LOG_DIR);

        let cfg = AppConfig::from_env();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/mesa-test-data"));
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/mesa-test-data/logs"));
        assert!(!cfg.seed_demo_data);

        std::env::remove_var(ENV_DATA_DIR);
        std::env::remove_var(ENV_SEED_DEMO);
    }

    #[test]
    #[serial]
    fn from_env_defaults() {
        std::env::remove_var(ENV_DATA_DIR);
        std::env::remove_var(ENV_SEED_DEMO);
        std::env::remove_var(ENV_LOG_DIR);

        let cfg = AppConfig::from_env();
        assert!(cfg.data_dir.ends_with(APP_DIR_NAME));
        assert!(cfg.seed_demo_data);
    }

    #[test]
    fn billing_settings_default_and_update() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();

        assert_eq!(BillingSettings::load(&conn), BillingSettings::default());

        let updated = BillingSettings::apply(
            &conn,
            &BillingSettingsUpdate {
                currency: Some("usd".into()),
                invoice_prefix: Some("FAC".into()),
                default_tax_rate: Some(21.0),
            },
        )
        .expect("apply");
        assert_eq!(updated.currency, "USD");
        assert_eq!(updated.invoice_prefix, "FAC");
        assert_eq!(updated.default_tax_rate, 21.0);
    }

    #[test]
    fn billing_settings_reject_bad_values() {
        let state = db::test_state();
        let conn = state.conn.lock().unwrap();

        let err = BillingSettings::apply(
            &conn,
            &BillingSettingsUpdate {
                default_tax_rate: Some(150.0),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation");

        let err = BillingSettings::apply(
            &conn,
            &BillingSettingsUpdate {
                currency: Some("EURO".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
