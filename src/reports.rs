//! Read-only aggregates for the dashboard and daily sales.
//!
//! Days are UTC calendar days, matching how timestamps are stored.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::inventory;

/// Longest range accepted by [`sales_by_day`].
const MAX_RANGE_DAYS: i64 = 366;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub date: String,
    pub payments_by_method: BTreeMap<String, f64>,
    pub total_collected: f64,
    pub refunds: f64,
    pub invoices_issued: i64,
    pub invoiced_amount: f64,
    pub open_orders: i64,
    pub occupied_tables: i64,
    pub low_stock_count: i64,
    pub outstanding_balance: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailySales {
    pub date: String,
    pub collected: f64,
    pub payment_count: i64,
    pub invoice_count: i64,
    pub invoiced_amount: f64,
}

fn parse_day(raw: &str, label: &str) -> PosResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| PosError::validation(format!("{label} must be YYYY-MM-DD, got '{raw}'")))
}

fn count(conn: &Connection, sql: &str) -> PosResult<i64> {
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

/// Snapshot for one day (today when `date` is `None`).
pub fn dashboard_summary(db: &DbState, date: Option<&str>) -> PosResult<DashboardSummary> {
    let day = match date {
        Some(raw) => parse_day(raw, "Date")?,
        None => Utc::now().date_naive(),
    };
    let day_str = day.format("%Y-%m-%d").to_string();
    let conn = db.conn.lock()?;

    let mut payments_by_method = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT method, COALESCE(SUM(amount), 0) FROM invoice_payments
         WHERE substr(created_at, 1, 10) = ?1
         GROUP BY method ORDER BY method",
    )?;
    let rows = stmt.query_map(params![day_str], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    for row in rows {
        let (method, amount) = row?;
        payments_by_method.insert(method, db::round2(amount));
    }
    let total_collected = db::round2(payments_by_method.values().sum());

    let refunds: f64 = conn.query_row(
        "SELECT COALESCE(SUM(refunded_amount), 0) FROM invoices
         WHERE status = 'refunded' AND substr(refunded_at, 1, 10) = ?1",
        params![day_str],
        |row| row.get(0),
    )?;

    let (invoices_issued, invoiced_amount): (i64, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(total_amount), 0) FROM invoices
         WHERE issued_at IS NOT NULL AND substr(issued_at, 1, 10) = ?1
           AND status <> 'cancelled'",
        params![day_str],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let open_orders = count(
        &conn,
        "SELECT COUNT(*) FROM orders WHERE status NOT IN ('closed', 'cancelled')",
    )?;
    let occupied_tables = count(
        &conn,
        "SELECT COUNT(*) FROM dining_tables WHERE status = 'occupied'",
    )?;
    let outstanding_balance: f64 = conn.query_row(
        "SELECT COALESCE(SUM(balance_due), 0) FROM invoices
         WHERE status IN ('issued', 'partially_paid')",
        [],
        |row| row.get(0),
    )?;
    let low_stock_count = inventory::stock_levels_conn(&conn, None)?
        .iter()
        .filter(|level| level.low_stock)
        .count() as i64;

    Ok(DashboardSummary {
        date: day_str,
        payments_by_method,
        total_collected,
        refunds: db::round2(refunds),
        invoices_issued,
        invoiced_amount: db::round2(invoiced_amount),
        open_orders,
        occupied_tables,
        low_stock_count,
        outstanding_balance: db::round2(outstanding_balance),
    })
}

/// Collected payments and issued invoices per day, every day in the range
/// included even when empty.
pub fn sales_by_day(db: &DbState, from: &str, to: &str) -> PosResult<Vec<DailySales>> {
    let from = parse_day(from, "from")?;
    let to = parse_day(to, "to")?;
    if to < from {
        return Err(PosError::validation("'to' must not be before 'from'"));
    }
    if (to - from).num_days() >= MAX_RANGE_DAYS {
        return Err(PosError::validation(format!(
            "Range is limited to {MAX_RANGE_DAYS} days"
        )));
    }

    let mut days: BTreeMap<String, DailySales> = BTreeMap::new();
    for day in from.iter_days().take_while(|d| *d <= to) {
        let key = day.format("%Y-%m-%d").to_string();
        days.insert(
            key.clone(),
            DailySales {
                date: key,
                collected: 0.0,
                payment_count: 0,
                invoice_count: 0,
                invoiced_amount: 0.0,
            },
        );
    }

    let from_str = from.format("%Y-%m-%d").to_string();
    let to_str = to.format("%Y-%m-%d").to_string();
    let conn = db.conn.lock()?;

    let mut stmt = conn.prepare(
        "SELECT substr(created_at, 1, 10) AS day, COUNT(*), COALESCE(SUM(amount), 0)
         FROM invoice_payments
         WHERE substr(created_at, 1, 10) BETWEEN ?1 AND ?2
         GROUP BY day",
    )?;
    let rows = stmt.query_map(params![from_str, to_str], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, f64>(2)?,
        ))
    })?;
    for row in rows {
        let (day, n, amount) = row?;
        if let Some(entry) = days.get_mut(&day) {
            entry.payment_count = n;
            entry.collected = db::round2(amount);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT substr(issued_at, 1, 10) AS day, COUNT(*), COALESCE(SUM(total_amount), 0)
         FROM invoices
         WHERE issued_at IS NOT NULL AND status <> 'cancelled'
           AND substr(issued_at, 1, 10) BETWEEN ?1 AND ?2
         GROUP BY day",
    )?;
    let rows = stmt.query_map(params![from_str, to_str], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, f64>(2)?,
        ))
    })?;
    for row in rows {
        let (day, n, amount) = row?;
        if let Some(entry) = days.get_mut(&day) {
            entry.invoice_count = n;
            entry.invoiced_amount = db::round2(amount);
        }
    }

    Ok(days.into_values().collect())
}
