//! Local SQLite database layer for Mesa POS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the
//! `local_settings` key/value store (counters, billing settings, PIN hashes),
//! and a small transaction helper shared by the domain modules.

use chrono::Utc;
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{PosError, PosResult};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 5;

const DB_FILE_NAME: &str = "mesa.db";

/// Initialize the database at `{data_dir}/mesa.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On open failure, deletes the file
/// and retries once.
pub fn init(data_dir: &Path) -> PosResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PosError::Internal(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path).map_err(|e| {
                PosError::Internal(format!("Database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current = schema_version(conn);
    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    let migrations: [(i32, &str, &str); 5] = [
        (1, "settings and staff sessions", MIGRATION_V1),
        (2, "catalog and inventory", MIGRATION_V2),
        (3, "clients, tables and orders", MIGRATION_V3),
        (4, "invoices", MIGRATION_V4),
        (5, "cash boxes", MIGRATION_V5),
    ];

    for (version, label, sql) in migrations {
        if current < version {
            apply_migration(conn, version, sql)?;
            info!("Applied migration v{version} ({label})");
        }
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32, sql: &str) -> PosResult<()> {
    let batch = format!("BEGIN;\n{sql}\nINSERT INTO schema_version (version) VALUES ({version});\nCOMMIT;");
    conn.execute_batch(&batch).map_err(|e| {
        let _ = conn.execute_batch("ROLLBACK");
        error!("Migration v{version} failed: {e}");
        PosError::Internal(format!("migration v{version}: {e}"))
    })
}

/// Highest applied schema version (0 for a fresh database).
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Migration v1: settings store and staff session audit.
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS local_settings (
        id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
        setting_category TEXT NOT NULL,
        setting_key TEXT NOT NULL,
        setting_value TEXT NOT NULL,
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now')),
        UNIQUE(setting_category, setting_key)
    );

    CREATE TABLE IF NOT EXISTS staff_sessions (
        id TEXT PRIMARY KEY,
        staff_id TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'staff',
        login_time TEXT NOT NULL,
        logout_time TEXT,
        is_active INTEGER DEFAULT 1
    );

    CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);
";

/// Migration v2: products, warehouses, stock and the movement ledger.
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS products (
        id TEXT PRIMARY KEY,
        sku TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT 'general',
        unit TEXT NOT NULL DEFAULT 'unit',
        unit_cost REAL NOT NULL DEFAULT 0,
        sale_price REAL NOT NULL DEFAULT 0,
        tax_rate REAL NOT NULL DEFAULT 0,
        min_stock REAL NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS warehouses (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        location TEXT,
        is_default INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS warehouse_stock (
        product_id TEXT NOT NULL,
        warehouse_id TEXT NOT NULL,
        quantity REAL NOT NULL DEFAULT 0 CHECK (quantity >= 0),
        updated_at TEXT NOT NULL,
        PRIMARY KEY (product_id, warehouse_id),
        FOREIGN KEY(product_id) REFERENCES products(id) ON DELETE CASCADE,
        FOREIGN KEY(warehouse_id) REFERENCES warehouses(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS inventory_movements (
        id TEXT PRIMARY KEY,
        movement_type TEXT NOT NULL CHECK (movement_type IN ('in', 'out', 'transfer', 'adjust', 'consumption')),
        product_id TEXT NOT NULL,
        from_warehouse_id TEXT,
        to_warehouse_id TEXT,
        quantity REAL NOT NULL,
        unit_cost REAL,
        reason TEXT,
        reference TEXT,
        staff_id TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY(product_id) REFERENCES products(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_products_category ON products(category);
    CREATE INDEX IF NOT EXISTS idx_movements_product ON inventory_movements(product_id);
    CREATE INDEX IF NOT EXISTS idx_movements_created_at ON inventory_movements(created_at);
";

/// Migration v3: clients, dining tables and orders.
const MIGRATION_V3: &str = "
    CREATE TABLE IF NOT EXISTS clients (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        tax_id TEXT,
        email TEXT,
        phone TEXT,
        phone_digits TEXT,
        address TEXT,
        notes TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS dining_tables (
        id TEXT PRIMARY KEY,
        number TEXT NOT NULL UNIQUE,
        area TEXT NOT NULL DEFAULT 'main',
        capacity INTEGER NOT NULL DEFAULT 4 CHECK (capacity > 0),
        status TEXT NOT NULL DEFAULT 'available' CHECK (status IN ('available', 'occupied', 'reserved', 'cleaning')),
        current_order_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS orders (
        id TEXT PRIMARY KEY,
        order_number TEXT NOT NULL UNIQUE,
        table_id TEXT,
        client_id TEXT,
        order_type TEXT NOT NULL DEFAULT 'dine_in' CHECK (order_type IN ('dine_in', 'takeaway', 'delivery')),
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'preparing', 'ready', 'served', 'closed', 'cancelled')),
        items TEXT NOT NULL DEFAULT '[]',
        guests INTEGER NOT NULL DEFAULT 1,
        subtotal REAL NOT NULL DEFAULT 0,
        discount_amount REAL NOT NULL DEFAULT 0,
        tax_amount REAL NOT NULL DEFAULT 0,
        total_amount REAL NOT NULL DEFAULT 0,
        notes TEXT,
        staff_id TEXT,
        invoice_id TEXT,
        cancellation_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        FOREIGN KEY(table_id) REFERENCES dining_tables(id) ON DELETE SET NULL,
        FOREIGN KEY(client_id) REFERENCES clients(id) ON DELETE SET NULL
    );

    CREATE INDEX IF NOT EXISTS idx_clients_name ON clients(name);
    CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
    CREATE INDEX IF NOT EXISTS idx_orders_table ON orders(table_id);
    CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
";

/// Migration v4: invoices, invoice lines and payments.
const MIGRATION_V4: &str = "
    CREATE TABLE IF NOT EXISTS invoices (
        id TEXT PRIMARY KEY,
        invoice_number TEXT UNIQUE,
        client_id TEXT,
        order_id TEXT,
        status TEXT NOT NULL DEFAULT 'draft' CHECK (status IN ('draft', 'issued', 'partially_paid', 'paid', 'cancelled', 'refunded')),
        currency TEXT NOT NULL DEFAULT 'EUR',
        subtotal REAL NOT NULL DEFAULT 0,
        discount_amount REAL NOT NULL DEFAULT 0,
        tax_amount REAL NOT NULL DEFAULT 0,
        total_amount REAL NOT NULL DEFAULT 0,
        amount_paid REAL NOT NULL DEFAULT 0,
        balance_due REAL NOT NULL DEFAULT 0,
        refunded_amount REAL NOT NULL DEFAULT 0,
        notes TEXT,
        due_date TEXT,
        issued_at TEXT,
        cancelled_at TEXT,
        cancellation_reason TEXT,
        refunded_at TEXT,
        refund_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(client_id) REFERENCES clients(id) ON DELETE SET NULL,
        FOREIGN KEY(order_id) REFERENCES orders(id) ON DELETE SET NULL
    );

    CREATE TABLE IF NOT EXISTS invoice_items (
        id TEXT PRIMARY KEY,
        invoice_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        product_id TEXT,
        description TEXT NOT NULL,
        quantity REAL NOT NULL CHECK (quantity > 0),
        unit_price REAL NOT NULL CHECK (unit_price >= 0),
        tax_rate REAL NOT NULL DEFAULT 0,
        discount_percentage REAL NOT NULL DEFAULT 0,
        line_subtotal REAL NOT NULL,
        line_discount REAL NOT NULL,
        line_tax REAL NOT NULL,
        line_total REAL NOT NULL,
        FOREIGN KEY(invoice_id) REFERENCES invoices(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS invoice_payments (
        id TEXT PRIMARY KEY,
        invoice_id TEXT NOT NULL,
        method TEXT NOT NULL CHECK (method IN ('cash', 'card', 'transfer', 'other')),
        amount REAL NOT NULL CHECK (amount > 0),
        reference TEXT,
        cash_box_session_id TEXT,
        received_by TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY(invoice_id) REFERENCES invoices(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices(status);
    CREATE INDEX IF NOT EXISTS idx_invoices_client ON invoices(client_id);
    CREATE INDEX IF NOT EXISTS idx_invoices_created_at ON invoices(created_at);
    CREATE INDEX IF NOT EXISTS idx_invoice_items_invoice ON invoice_items(invoice_id);
    CREATE INDEX IF NOT EXISTS idx_invoice_payments_invoice ON invoice_payments(invoice_id);
";

/// Migration v5: cash boxes, their sessions and the movement ledger.
const MIGRATION_V5: &str = "
    CREATE TABLE IF NOT EXISTS cash_boxes (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        location TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cash_box_sessions (
        id TEXT PRIMARY KEY,
        cash_box_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
        opened_by TEXT,
        opening_amount REAL NOT NULL DEFAULT 0 CHECK (opening_amount >= 0),
        expected_amount REAL,
        counted_amount REAL,
        difference REAL,
        opened_at TEXT NOT NULL,
        closed_at TEXT,
        closed_by TEXT,
        notes TEXT,
        FOREIGN KEY(cash_box_id) REFERENCES cash_boxes(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS cash_box_movements (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        movement_type TEXT NOT NULL CHECK (movement_type IN ('sale', 'income', 'expense', 'withdrawal', 'deposit', 'refund')),
        payment_method TEXT NOT NULL DEFAULT 'cash',
        amount REAL NOT NULL CHECK (amount > 0),
        description TEXT,
        reference TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY(session_id) REFERENCES cash_box_sessions(id) ON DELETE CASCADE
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_cash_box_one_open_session
        ON cash_box_sessions(cash_box_id) WHERE status = 'open';
    CREATE INDEX IF NOT EXISTS idx_cash_box_movements_session ON cash_box_movements(session_id);
";

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> PosResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Bump a persistent counter and return the new value.
///
/// Counters never go backwards: a number handed out is reserved for good,
/// even when the document that received it is later cancelled.
pub fn next_counter(conn: &Connection, category: &str, key: &str) -> PosResult<i64> {
    let current = get_setting(conn, category, key)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let next = current + 1;
    set_setting(conn, category, key, &next.to_string())?;
    Ok(next)
}

// ---------------------------------------------------------------------------
// Transactions and small shared helpers
// ---------------------------------------------------------------------------

/// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on error.
pub fn transaction<T>(conn: &Connection, f: impl FnOnce() -> PosResult<T>) -> PosResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f() {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Round a money amount to cents.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Read a TEXT column into a status-like enum implementing `FromStr`.
pub fn parse_column<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = PosError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Validate an optional `YYYY-MM-DD` date string.
pub fn validate_date(value: Option<&str>, label: &str) -> PosResult<()> {
    if let Some(raw) = value {
        chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| PosError::validation(format!("{label} must be YYYY-MM-DD, got '{raw}'")))?;
    }
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory database with every migration applied.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("pragma setup");
        conn
    }

    #[test]
    fn test_migrations_reach_current_version() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);

        // Running again is a no-op
        run_migrations(&conn).expect("second run");
        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_invoice_status_check_constraint() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let bad = conn.execute(
            "INSERT INTO invoices (id, status, created_at, updated_at)
             VALUES ('inv-bad', 'archived', datetime('now'), datetime('now'))",
            [],
        );
        assert!(bad.is_err(), "invalid invoice status should be rejected");
    }

    #[test]
    fn test_stock_cannot_go_negative() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO products (id, sku, name, created_at, updated_at)
             VALUES ('p-1', 'SKU-1', 'Flour', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO warehouses (id, name, created_at) VALUES ('w-1', 'Main', datetime('now'))",
            [],
        )
        .unwrap();
        let bad = conn.execute(
            "INSERT INTO warehouse_stock (product_id, warehouse_id, quantity, updated_at)
             VALUES ('p-1', 'w-1', -1, datetime('now'))",
            [],
        );
        assert!(bad.is_err(), "negative stock should be rejected");
    }

    #[test]
    fn test_one_open_session_per_cash_box() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO cash_boxes (id, name, created_at, updated_at)
             VALUES ('cb-1', 'Front', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO cash_box_sessions (id, cash_box_id, status, opened_at)
             VALUES ('s-1', 'cb-1', 'open', datetime('now'))",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO cash_box_sessions (id, cash_box_id, status, opened_at)
             VALUES ('s-2', 'cb-1', 'open', datetime('now'))",
            [],
        );
        assert!(dup.is_err(), "second open session should be rejected");

        // A closed session does not count
        conn.execute(
            "INSERT INTO cash_box_sessions (id, cash_box_id, status, opened_at)
             VALUES ('s-3', 'cb-1', 'closed', datetime('now'))",
            [],
        )
        .expect("closed session allowed");
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "billing", "currency", "EUR").expect("set");
        assert_eq!(get_setting(&conn, "billing", "currency"), Some("EUR".to_string()));

        set_setting(&conn, "billing", "currency", "USD").expect("update");
        assert_eq!(get_setting(&conn, "billing", "currency"), Some("USD".to_string()));
        assert!(get_setting(&conn, "billing", "missing").is_none());
    }

    #[test]
    fn test_counter_is_monotonic() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        assert_eq!(next_counter(&conn, "billing", "invoice_counter").unwrap(), 1);
        assert_eq!(next_counter(&conn, "billing", "invoice_counter").unwrap(), 2);
        assert_eq!(next_counter(&conn, "orders", "order_counter").unwrap(), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let result: PosResult<()> = transaction(&conn, || {
            set_setting(&conn, "test", "key", "value")?;
            Err(PosError::validation("boom"))
        });
        assert!(result.is_err());
        assert!(get_setting(&conn, "test", "key").is_none());
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(10.006), 10.01);
        assert_eq!(round2(3.14159), 3.14);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn test_init_creates_file() {
        let dir = std::env::temp_dir().join(format!("mesa_db_test_{}", uuid::Uuid::new_v4()));
        let state = init(&dir).expect("init");
        assert!(state.db_path.exists());
        {
            let conn = state.conn.lock().unwrap();
            assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
        }
        drop(state);
        let _ = fs::remove_dir_all(&dir);
    }
}
