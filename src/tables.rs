//! Dining tables and their occupancy.
//!
//! `occupied` is driven by orders: opening a dine-in order occupies the
//! table and closing or cancelling it frees the table. The other statuses
//! can be set by hand.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;

use crate::data_helpers::{clean_opt, require_text};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Available,
    Occupied,
    Reserved,
    Cleaning,
}

impl TableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Occupied => "occupied",
            Self::Reserved => "reserved",
            Self::Cleaning => "cleaning",
        }
    }
}

impl FromStr for TableStatus {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "occupied" => Ok(Self::Occupied),
            "reserved" => Ok(Self::Reserved),
            "cleaning" => Ok(Self::Cleaning),
            other => Err(PosError::validation(format!("Unknown table status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiningTable {
    pub id: String,
    pub number: String,
    pub area: String,
    pub capacity: i64,
    pub status: TableStatus,
    pub current_order_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInput {
    #[serde(alias = "table_number", alias = "tableNumber")]
    pub number: String,
    #[serde(default, alias = "zone")]
    pub area: Option<String>,
    #[serde(default, alias = "seats")]
    pub capacity: Option<i64>,
}

const TABLE_COLUMNS: &str =
    "id, number, area, capacity, status, current_order_id, created_at, updated_at";

fn table_from_row(row: &Row) -> rusqlite::Result<DiningTable> {
    Ok(DiningTable {
        id: row.get(0)?,
        number: row.get(1)?,
        area: row.get(2)?,
        capacity: row.get(3)?,
        status: db::parse_column(row, 4)?,
        current_order_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn load_table(conn: &Connection, table_id: &str) -> PosResult<DiningTable> {
    conn.query_row(
        &format!("SELECT {TABLE_COLUMNS} FROM dining_tables WHERE id = ?1"),
        params![table_id],
        table_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("table", table_id))
}

/// Point a table at an order (or clear it). Used by the order lifecycle.
pub(crate) fn occupy_table(conn: &Connection, table_id: &str, order_id: Option<&str>) -> PosResult<()> {
    let status = if order_id.is_some() {
        TableStatus::Occupied
    } else {
        TableStatus::Available
    };
    conn.execute(
        "UPDATE dining_tables SET status = ?1, current_order_id = ?2, updated_at = ?3
         WHERE id = ?4",
        params![status.as_str(), order_id, db::now_rfc3339(), table_id],
    )?;
    Ok(())
}

fn validate(input: &TableInput) -> PosResult<(String, String, i64)> {
    let number = require_text(&input.number, "Table number is required")?;
    let area = clean_opt(input.area.clone()).unwrap_or_else(|| "main".into());
    let capacity = input.capacity.unwrap_or(4);
    if capacity <= 0 {
        return Err(PosError::validation("Capacity must be positive"));
    }
    Ok((number, area, capacity))
}

fn ensure_number_free(conn: &Connection, number: &str, except_id: Option<&str>) -> PosResult<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM dining_tables WHERE number = ?1",
            params![number],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) if Some(id.as_str()) != except_id => {
            Err(PosError::Conflict(format!("Table {number} already exists")))
        }
        _ => Ok(()),
    }
}

pub(crate) fn insert_table(conn: &Connection, input: &TableInput) -> PosResult<String> {
    let (number, area, capacity) = validate(input)?;
    ensure_number_free(conn, &number, None)?;

    let id = db::new_id();
    conn.execute(
        "INSERT INTO dining_tables (id, number, area, capacity, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'available', ?5, ?5)",
        params![id, number, area, capacity, db::now_rfc3339()],
    )?;
    info!(table_id = %id, number = %number, area = %area, "Table created");
    Ok(id)
}

pub fn create_table(db: &DbState, input: &TableInput) -> PosResult<DiningTable> {
    let conn = db.conn.lock()?;
    let id = insert_table(&conn, input)?;
    load_table(&conn, &id)
}

pub fn update_table(db: &DbState, table_id: &str, input: &TableInput) -> PosResult<DiningTable> {
    let (number, area, capacity) = validate(input)?;
    let conn = db.conn.lock()?;
    load_table(&conn, table_id)?;
    ensure_number_free(&conn, &number, Some(table_id))?;

    conn.execute(
        "UPDATE dining_tables SET number = ?1, area = ?2, capacity = ?3, updated_at = ?4
         WHERE id = ?5",
        params![number, area, capacity, db::now_rfc3339(), table_id],
    )?;
    load_table(&conn, table_id)
}

pub fn list_tables(db: &DbState, area: Option<&str>) -> PosResult<Vec<DiningTable>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {TABLE_COLUMNS} FROM dining_tables
         WHERE (?1 = '' OR area = ?1)
         ORDER BY area, CAST(number AS INTEGER), number"
    ))?;
    let rows = stmt.query_map(params![area.map(str::trim).unwrap_or("")], table_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn has_open_order(conn: &Connection, table: &DiningTable) -> PosResult<bool> {
    let Some(ref order_id) = table.current_order_id else {
        return Ok(false);
    };
    let open: i64 = conn.query_row(
        "SELECT COUNT(*) FROM orders WHERE id = ?1 AND status NOT IN ('closed', 'cancelled')",
        params![order_id],
        |row| row.get(0),
    )?;
    Ok(open > 0)
}

/// Set a table status by hand. `occupied` is reserved for the order
/// lifecycle, and a table holding an open order keeps its status.
pub fn set_table_status(db: &DbState, table_id: &str, status: TableStatus) -> PosResult<DiningTable> {
    let conn = db.conn.lock()?;
    let table = load_table(&conn, table_id)?;

    if status == TableStatus::Occupied {
        return Err(PosError::validation(
            "Tables become occupied by opening an order",
        ));
    }
    if has_open_order(&conn, &table)? {
        return Err(PosError::InvalidTransition {
            entity: "table",
            action: "change the status of",
            status: table.status.as_str().into(),
        });
    }

    conn.execute(
        "UPDATE dining_tables SET status = ?1, current_order_id = NULL, updated_at = ?2
         WHERE id = ?3",
        params![status.as_str(), db::now_rfc3339(), table_id],
    )?;
    info!(table_id = %table_id, status = %status.as_str(), "Table status changed");
    load_table(&conn, table_id)
}

pub fn delete_table(db: &DbState, table_id: &str) -> PosResult<()> {
    let conn = db.conn.lock()?;
    let table = load_table(&conn, table_id)?;
    if table.status == TableStatus::Occupied {
        return Err(PosError::InvalidTransition {
            entity: "table",
            action: "delete",
            status: table.status.as_str().into(),
        });
    }
    conn.execute("DELETE FROM dining_tables WHERE id = ?1", params![table_id])?;
    info!(table_id = %table_id, number = %table.number, "Table deleted");
    Ok(())
}
