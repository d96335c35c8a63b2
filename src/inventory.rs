//! Products, warehouses and the stock movement ledger.
//!
//! Stock per (product, warehouse) lives in `warehouse_stock` and is only
//! changed through [`record_movement`], which also appends a row to
//! `inventory_movements`. Quantities never go negative: `out`,
//! `consumption` and `transfer` check the source before subtracting.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::BillingSettings;
use crate::data_helpers::{clean_opt, like_pattern, require_text};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::orders::{self, ItemStatus};

/// Stock comparisons tolerate float noise below this.
const QTY_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    In,
    Out,
    Transfer,
    Adjust,
    Consumption,
}

impl MovementType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Transfer => "transfer",
            Self::Adjust => "adjust",
            Self::Consumption => "consumption",
        }
    }
}

impl FromStr for MovementType {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "transfer" => Ok(Self::Transfer),
            "adjust" => Ok(Self::Adjust),
            "consumption" => Ok(Self::Consumption),
            other => Err(PosError::validation(format!("Unknown movement type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub sku: String,
    pub name: String,
    pub category: String,
    pub unit: String,
    pub unit_cost: f64,
    pub sale_price: f64,
    pub tax_rate: f64,
    pub min_stock: f64,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInput {
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, alias = "unit_cost", alias = "cost")]
    pub unit_cost: f64,
    #[serde(default, alias = "sale_price", alias = "price")]
    pub sale_price: f64,
    #[serde(default, alias = "tax_rate")]
    pub tax_rate: Option<f64>,
    #[serde(default, alias = "min_stock")]
    pub min_stock: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductFilter {
    #[serde(default, alias = "query", alias = "q")]
    pub search: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "include_inactive")]
    pub include_inactive: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Warehouse {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    pub is_default: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementInput {
    #[serde(alias = "product_id")]
    pub product_id: String,
    #[serde(alias = "type", alias = "movement_type")]
    pub movement_type: Option<MovementType>,
    /// Moved quantity; for `adjust` the counted quantity.
    pub quantity: f64,
    /// Shorthand for the source or destination, depending on the type.
    #[serde(default, alias = "warehouse_id")]
    pub warehouse_id: Option<String>,
    #[serde(default, alias = "from_warehouse_id", alias = "fromWarehouse")]
    pub from_warehouse_id: Option<String>,
    #[serde(default, alias = "to_warehouse_id", alias = "toWarehouse")]
    pub to_warehouse_id: Option<String>,
    #[serde(default, alias = "unit_cost")]
    pub unit_cost: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default, alias = "staff_id")]
    pub staff_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InventoryMovement {
    pub id: String,
    pub movement_type: MovementType,
    pub product_id: String,
    pub product_name: String,
    pub from_warehouse_id: Option<String>,
    pub to_warehouse_id: Option<String>,
    /// Signed delta for `adjust`, positive otherwise.
    pub quantity: f64,
    pub unit_cost: Option<f64>,
    pub reason: Option<String>,
    pub reference: Option<String>,
    pub staff_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementFilter {
    #[serde(default, alias = "product_id")]
    pub product_id: Option<String>,
    #[serde(default, alias = "warehouse_id")]
    pub warehouse_id: Option<String>,
    #[serde(default, alias = "type", alias = "movement_type")]
    pub movement_type: Option<MovementType>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseQuantity {
    pub warehouse_id: String,
    pub warehouse_name: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub unit: String,
    pub min_stock: f64,
    pub total: f64,
    pub low_stock: bool,
    pub warehouses: Vec<WarehouseQuantity>,
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

const PRODUCT_COLUMNS: &str = "id, sku, name, category, unit, unit_cost, sale_price, tax_rate,
    min_stock, is_active, created_at, updated_at";

fn product_from_row(row: &Row) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        sku: row.get(1)?,
        name: row.get(2)?,
        category: row.get(3)?,
        unit: row.get(4)?,
        unit_cost: row.get(5)?,
        sale_price: row.get(6)?,
        tax_rate: row.get(7)?,
        min_stock: row.get(8)?,
        is_active: row.get::<_, i64>(9)? != 0,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub(crate) fn load_product(conn: &Connection, product_id: &str) -> PosResult<Product> {
    conn.query_row(
        &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
        params![product_id],
        product_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("product", product_id))
}

struct CleanProduct {
    sku: String,
    name: String,
    category: String,
    unit: String,
    unit_cost: f64,
    sale_price: f64,
    tax_rate: f64,
    min_stock: f64,
}

fn validate_product(conn: &Connection, input: &ProductInput) -> PosResult<CleanProduct> {
    let sku = require_text(&input.sku, "SKU is required")?.to_uppercase();
    let name = require_text(&input.name, "Product name is required")?;
    if input.unit_cost < 0.0 || input.sale_price < 0.0 {
        return Err(PosError::validation("Prices cannot be negative"));
    }
    if input.min_stock < 0.0 {
        return Err(PosError::validation("Minimum stock cannot be negative"));
    }
    let tax_rate = input
        .tax_rate
        .unwrap_or_else(|| BillingSettings::load(conn).default_tax_rate);
    if !(0.0..=100.0).contains(&tax_rate) {
        return Err(PosError::validation("Tax rate must be between 0 and 100"));
    }
    Ok(CleanProduct {
        sku,
        name,
        category: clean_opt(input.category.clone()).unwrap_or_else(|| "general".into()),
        unit: clean_opt(input.unit.clone()).unwrap_or_else(|| "unit".into()),
        unit_cost: db::round2(input.unit_cost),
        sale_price: db::round2(input.sale_price),
        tax_rate,
        min_stock: input.min_stock,
    })
}

fn ensure_sku_free(conn: &Connection, sku: &str, except_id: Option<&str>) -> PosResult<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM products WHERE sku = ?1",
            params![sku],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) if Some(id.as_str()) != except_id => Err(PosError::Conflict(format!(
            "SKU {sku} is already used by product {id}"
        ))),
        _ => Ok(()),
    }
}

/// Insert a product and return its id.
pub(crate) fn insert_product(conn: &Connection, input: &ProductInput) -> PosResult<String> {
    let p = validate_product(conn, input)?;
    ensure_sku_free(conn, &p.sku, None)?;

    let id = db::new_id();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO products (id, sku, name, category, unit, unit_cost, sale_price, tax_rate,
                               min_stock, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
        params![
            id,
            p.sku,
            p.name,
            p.category,
            p.unit,
            p.unit_cost,
            p.sale_price,
            p.tax_rate,
            p.min_stock,
            now
        ],
    )?;
    info!(product_id = %id, sku = %p.sku, "Product created");
    Ok(id)
}

pub fn create_product(db: &DbState, input: &ProductInput) -> PosResult<Product> {
    let conn = db.conn.lock()?;
    let id = insert_product(&conn, input)?;
    load_product(&conn, &id)
}

pub fn update_product(db: &DbState, product_id: &str, input: &ProductInput) -> PosResult<Product> {
    let conn = db.conn.lock()?;
    load_product(&conn, product_id)?;
    let p = validate_product(&conn, input)?;
    ensure_sku_free(&conn, &p.sku, Some(product_id))?;

    conn.execute(
        "UPDATE products SET sku = ?1, name = ?2, category = ?3, unit = ?4, unit_cost = ?5,
                sale_price = ?6, tax_rate = ?7, min_stock = ?8, updated_at = ?9
         WHERE id = ?10",
        params![
            p.sku,
            p.name,
            p.category,
            p.unit,
            p.unit_cost,
            p.sale_price,
            p.tax_rate,
            p.min_stock,
            db::now_rfc3339(),
            product_id
        ],
    )?;
    load_product(&conn, product_id)
}

pub fn set_product_active(db: &DbState, product_id: &str, active: bool) -> PosResult<Product> {
    let conn = db.conn.lock()?;
    load_product(&conn, product_id)?;
    conn.execute(
        "UPDATE products SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
        params![active as i64, db::now_rfc3339(), product_id],
    )?;
    info!(product_id = %product_id, active, "Product active flag changed");
    load_product(&conn, product_id)
}

pub fn get_product(db: &DbState, product_id: &str) -> PosResult<Product> {
    let conn = db.conn.lock()?;
    load_product(&conn, product_id)
}

pub fn list_products(db: &DbState, filter: &ProductFilter) -> PosResult<Vec<Product>> {
    let conn = db.conn.lock()?;
    let search = filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(like_pattern)
        .unwrap_or_default();
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products
         WHERE (?1 = 1 OR is_active = 1)
           AND (?2 = '' OR category = ?2)
           AND (?3 = '' OR lower(name) LIKE ?3 ESCAPE '\\' OR lower(sku) LIKE ?3 ESCAPE '\\')
         ORDER BY category, name COLLATE NOCASE"
    ))?;
    let rows = stmt.query_map(
        params![
            filter.include_inactive as i64,
            filter.category.as_deref().map(str::trim).unwrap_or(""),
            search
        ],
        product_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Warehouses
// ---------------------------------------------------------------------------

fn warehouse_from_row(row: &Row) -> rusqlite::Result<Warehouse> {
    Ok(Warehouse {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        is_default: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
    })
}

fn load_warehouse(conn: &Connection, warehouse_id: &str) -> PosResult<Warehouse> {
    conn.query_row(
        "SELECT id, name, location, is_default, created_at FROM warehouses WHERE id = ?1",
        params![warehouse_id],
        warehouse_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("warehouse", warehouse_id))
}

fn default_warehouse_id(conn: &Connection) -> PosResult<String> {
    conn.query_row(
        "SELECT id FROM warehouses ORDER BY is_default DESC, created_at ASC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("warehouse", "default"))
}

/// Insert a warehouse. The first one, or one created with `is_default`,
/// becomes the default. Must run inside a transaction.
pub(crate) fn insert_warehouse(
    conn: &Connection,
    name: &str,
    location: Option<&str>,
    is_default: bool,
) -> PosResult<String> {
    let name = require_text(name, "Warehouse name is required")?;
    let taken: i64 = conn.query_row(
        "SELECT COUNT(*) FROM warehouses WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    if taken > 0 {
        return Err(PosError::Conflict(format!("Warehouse '{name}' already exists")));
    }
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM warehouses", [], |row| row.get(0))?;
    let make_default = is_default || count == 0;

    if make_default {
        conn.execute("UPDATE warehouses SET is_default = 0", [])?;
    }
    let id = db::new_id();
    conn.execute(
        "INSERT INTO warehouses (id, name, location, is_default, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            name,
            clean_opt(location.map(str::to_string)),
            make_default as i64,
            db::now_rfc3339()
        ],
    )?;
    info!(warehouse_id = %id, name = %name, is_default = make_default, "Warehouse created");
    Ok(id)
}

pub fn create_warehouse(
    db: &DbState,
    name: &str,
    location: Option<&str>,
    is_default: bool,
) -> PosResult<Warehouse> {
    let conn = db.conn.lock()?;
    let id = db::transaction(&conn, || insert_warehouse(&conn, name, location, is_default))?;
    load_warehouse(&conn, &id)
}

pub fn list_warehouses(db: &DbState) -> PosResult<Vec<Warehouse>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, location, is_default, created_at FROM warehouses
         ORDER BY is_default DESC, name",
    )?;
    let rows = stmt.query_map([], warehouse_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn default_warehouse(db: &DbState) -> PosResult<Warehouse> {
    let conn = db.conn.lock()?;
    let id = default_warehouse_id(&conn)?;
    load_warehouse(&conn, &id)
}

// ---------------------------------------------------------------------------
// Movements
// ---------------------------------------------------------------------------

fn stock_quantity(conn: &Connection, product_id: &str, warehouse_id: &str) -> PosResult<f64> {
    Ok(conn
        .query_row(
            "SELECT quantity FROM warehouse_stock WHERE product_id = ?1 AND warehouse_id = ?2",
            params![product_id, warehouse_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0.0))
}

fn set_stock(conn: &Connection, product_id: &str, warehouse_id: &str, quantity: f64) -> PosResult<()> {
    // Clamp float noise so the CHECK (quantity >= 0) holds.
    let quantity = if quantity.abs() < QTY_EPSILON { 0.0 } else { quantity };
    conn.execute(
        "INSERT INTO warehouse_stock (product_id, warehouse_id, quantity, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(product_id, warehouse_id) DO UPDATE SET
            quantity = excluded.quantity, updated_at = excluded.updated_at",
        params![product_id, warehouse_id, quantity, db::now_rfc3339()],
    )?;
    Ok(())
}

/// Fail with `InsufficientStock` unless `requested` is available.
fn take_stock(
    conn: &Connection,
    product: &Product,
    warehouse_id: &str,
    requested: f64,
) -> PosResult<()> {
    let available = stock_quantity(conn, &product.id, warehouse_id)?;
    if requested > available + QTY_EPSILON {
        return Err(PosError::InsufficientStock {
            product: product.name.clone(),
            requested,
            available,
        });
    }
    set_stock(conn, &product.id, warehouse_id, available - requested)
}

fn required_warehouse(
    conn: &Connection,
    id: Option<&String>,
    label: &str,
    kind: MovementType,
) -> PosResult<String> {
    let id = id.ok_or_else(|| {
        PosError::validation(format!(
            "A {label} warehouse is required for '{}' movements",
            kind.as_str()
        ))
    })?;
    load_warehouse(conn, id)?;
    Ok(id.clone())
}

/// Apply a movement and append it to the ledger. Must run inside a transaction.
pub(crate) fn record_movement_tx(conn: &Connection, input: &MovementInput) -> PosResult<String> {
    let kind = input
        .movement_type
        .ok_or_else(|| PosError::validation("Movement type is required"))?;
    if !input.quantity.is_finite() {
        return Err(PosError::validation("Quantity must be a number"));
    }
    match kind {
        MovementType::Adjust if input.quantity < 0.0 => {
            return Err(PosError::validation("Counted quantity cannot be negative"));
        }
        MovementType::Adjust => {}
        _ if input.quantity <= 0.0 => {
            return Err(PosError::validation("Quantity must be positive"));
        }
        _ => {}
    }

    let product = load_product(conn, &input.product_id)?;
    let from = clean_opt(input.from_warehouse_id.clone());
    let to = clean_opt(input.to_warehouse_id.clone());
    let shorthand = clean_opt(input.warehouse_id.clone());

    let (from_id, to_id, ledger_qty) = match kind {
        MovementType::In => {
            let to_id = required_warehouse(conn, to.as_ref().or(shorthand.as_ref()), "destination", kind)?;
            let current = stock_quantity(conn, &product.id, &to_id)?;
            set_stock(conn, &product.id, &to_id, current + input.quantity)?;
            (None, Some(to_id), input.quantity)
        }
        MovementType::Out | MovementType::Consumption => {
            let from_id = required_warehouse(conn, from.as_ref().or(shorthand.as_ref()), "source", kind)?;
            take_stock(conn, &product, &from_id, input.quantity)?;
            (Some(from_id), None, input.quantity)
        }
        MovementType::Transfer => {
            let from_id = required_warehouse(conn, from.as_ref(), "source", kind)?;
            let to_id = required_warehouse(conn, to.as_ref(), "destination", kind)?;
            if from_id == to_id {
                return Err(PosError::validation(
                    "Transfer source and destination must be different",
                ));
            }
            take_stock(conn, &product, &from_id, input.quantity)?;
            let current = stock_quantity(conn, &product.id, &to_id)?;
            set_stock(conn, &product.id, &to_id, current + input.quantity)?;
            (Some(from_id), Some(to_id), input.quantity)
        }
        MovementType::Adjust => {
            let wh_id = required_warehouse(
                conn,
                shorthand.as_ref().or(to.as_ref()).or(from.as_ref()),
                "target",
                kind,
            )?;
            let current = stock_quantity(conn, &product.id, &wh_id)?;
            set_stock(conn, &product.id, &wh_id, input.quantity)?;
            (None, Some(wh_id), input.quantity - current)
        }
    };

    let id = db::new_id();
    conn.execute(
        "INSERT INTO inventory_movements (
            id, movement_type, product_id, from_warehouse_id, to_warehouse_id, quantity,
            unit_cost, reason, reference, staff_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            kind.as_str(),
            product.id,
            from_id,
            to_id,
            ledger_qty,
            input.unit_cost.or(Some(product.unit_cost)),
            clean_opt(input.reason.clone()),
            clean_opt(input.reference.clone()),
            input.staff_id,
            db::now_rfc3339(),
        ],
    )?;
    debug!(
        movement_id = %id,
        kind = %kind.as_str(),
        product_id = %product.id,
        quantity = %ledger_qty,
        "Inventory movement applied"
    );
    Ok(id)
}

pub fn record_movement(db: &DbState, input: &MovementInput) -> PosResult<InventoryMovement> {
    let conn = db.conn.lock()?;
    let id = db::transaction(&conn, || record_movement_tx(&conn, input))?;
    let movement = load_movement(&conn, &id)?;
    info!(
        movement_id = %id,
        kind = %movement.movement_type.as_str(),
        product_id = %movement.product_id,
        quantity = %movement.quantity,
        "Inventory movement recorded"
    );
    Ok(movement)
}

const MOVEMENT_COLUMNS: &str = "m.id, m.movement_type, m.product_id, p.name, m.from_warehouse_id,
    m.to_warehouse_id, m.quantity, m.unit_cost, m.reason, m.reference, m.staff_id, m.created_at";

fn movement_from_row(row: &Row) -> rusqlite::Result<InventoryMovement> {
    Ok(InventoryMovement {
        id: row.get(0)?,
        movement_type: db::parse_column(row, 1)?,
        product_id: row.get(2)?,
        product_name: row.get(3)?,
        from_warehouse_id: row.get(4)?,
        to_warehouse_id: row.get(5)?,
        quantity: row.get(6)?,
        unit_cost: row.get(7)?,
        reason: row.get(8)?,
        reference: row.get(9)?,
        staff_id: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn load_movement(conn: &Connection, movement_id: &str) -> PosResult<InventoryMovement> {
    conn.query_row(
        &format!(
            "SELECT {MOVEMENT_COLUMNS} FROM inventory_movements m
             JOIN products p ON p.id = m.product_id
             WHERE m.id = ?1"
        ),
        params![movement_id],
        movement_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("inventory movement", movement_id))
}

/// Movements, newest first.
pub fn list_movements(db: &DbState, filter: &MovementFilter) -> PosResult<Vec<InventoryMovement>> {
    let conn = db.conn.lock()?;
    let limit = filter.limit.unwrap_or(200).clamp(1, 1000) as i64;
    let mut stmt = conn.prepare(&format!(
        "SELECT {MOVEMENT_COLUMNS} FROM inventory_movements m
         JOIN products p ON p.id = m.product_id
         WHERE (?1 = '' OR m.product_id = ?1)
           AND (?2 = '' OR m.from_warehouse_id = ?2 OR m.to_warehouse_id = ?2)
           AND (?3 = '' OR m.movement_type = ?3)
           AND (?4 = '' OR m.reference = ?4)
         ORDER BY m.created_at DESC, m.rowid DESC
         LIMIT ?5"
    ))?;
    let rows = stmt.query_map(
        params![
            filter.product_id.as_deref().unwrap_or(""),
            filter.warehouse_id.as_deref().unwrap_or(""),
            filter.movement_type.map(MovementType::as_str).unwrap_or(""),
            filter.reference.as_deref().unwrap_or(""),
            limit
        ],
        movement_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Stock levels
// ---------------------------------------------------------------------------

pub(crate) fn stock_levels_conn(conn: &Connection, product_id: Option<&str>) -> PosResult<Vec<StockLevel>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.sku, p.name, p.unit, p.min_stock, w.id, w.name, s.quantity
         FROM products p
         LEFT JOIN warehouse_stock s ON s.product_id = p.id
         LEFT JOIN warehouses w ON w.id = s.warehouse_id
         WHERE p.is_active = 1 AND (?1 = '' OR p.id = ?1)
         ORDER BY p.name COLLATE NOCASE, w.name",
    )?;
    let rows = stmt.query_map(params![product_id.unwrap_or("")], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<f64>>(7)?,
        ))
    })?;

    let mut levels: Vec<StockLevel> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    for row in rows {
        let (pid, sku, name, unit, min_stock, wh_id, wh_name, qty) = row?;
        let pos = *index.entry(pid.clone()).or_insert_with(|| {
            levels.push(StockLevel {
                product_id: pid.clone(),
                sku,
                name,
                unit,
                min_stock,
                total: 0.0,
                low_stock: false,
                warehouses: Vec::new(),
            });
            levels.len() - 1
        });
        if let (Some(warehouse_id), Some(warehouse_name), Some(quantity)) = (wh_id, wh_name, qty) {
            levels[pos].total += quantity;
            levels[pos].warehouses.push(WarehouseQuantity {
                warehouse_id,
                warehouse_name,
                quantity,
            });
        }
    }
    for level in &mut levels {
        level.low_stock = level.total < level.min_stock;
    }
    Ok(levels)
}

/// Per-warehouse quantities of active products, optionally for one product.
pub fn stock_levels(db: &DbState, product_id: Option<&str>) -> PosResult<Vec<StockLevel>> {
    let conn = db.conn.lock()?;
    if let Some(pid) = product_id {
        load_product(&conn, pid)?;
    }
    stock_levels_conn(&conn, product_id)
}

pub fn low_stock_alerts(db: &DbState) -> PosResult<Vec<StockLevel>> {
    let conn = db.conn.lock()?;
    Ok(stock_levels_conn(&conn, None)?
        .into_iter()
        .filter(|level| level.low_stock)
        .collect())
}

// ---------------------------------------------------------------------------
// Order consumption
// ---------------------------------------------------------------------------

/// Record a `consumption` movement for every product line of an order.
/// Either every line is consumed or none is.
pub fn consume_order_items(
    db: &DbState,
    order_id: &str,
    warehouse_id: Option<&str>,
) -> PosResult<Vec<InventoryMovement>> {
    let conn = db.conn.lock()?;
    let order = orders::load_order(&conn, order_id)?;

    let already: i64 = conn.query_row(
        "SELECT COUNT(*) FROM inventory_movements
         WHERE movement_type = 'consumption' AND reference = ?1",
        params![order.id],
        |row| row.get(0),
    )?;
    if already > 0 {
        return Err(PosError::Conflict(format!(
            "Stock for order {} was already consumed",
            order.order_number
        )));
    }

    let warehouse_id = match warehouse_id {
        Some(id) => id.to_string(),
        None => default_warehouse_id(&conn)?,
    };

    let ids = db::transaction(&conn, || {
        let mut ids = Vec::new();
        for item in order
            .items
            .iter()
            .filter(|item| item.status != ItemStatus::Cancelled)
        {
            let Some(ref product_id) = item.product_id else {
                continue;
            };
            let id = record_movement_tx(
                &conn,
                &MovementInput {
                    product_id: product_id.clone(),
                    movement_type: Some(MovementType::Consumption),
                    quantity: item.quantity,
                    from_warehouse_id: Some(warehouse_id.clone()),
                    reason: Some(format!("Order {}", order.order_number)),
                    reference: Some(order.id.clone()),
                    staff_id: order.staff_id.clone(),
                    ..Default::default()
                },
            )?;
            ids.push(id);
        }
        Ok(ids)
    })?;

    info!(order_id = %order_id, movements = ids.len(), "Order stock consumed");
    ids.iter().map(|id| load_movement(&conn, id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{self, AddItemInput, OpenOrderInput, OrderType};

    fn product(db: &DbState, sku: &str, min_stock: f64) -> Product {
        create_product(
            db,
            &ProductInput {
                sku: sku.into(),
                name: format!("Product {sku}"),
                sale_price: 3.0,
                min_stock,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn movement(kind: MovementType, product_id: &str, qty: f64) -> MovementInput {
        MovementInput {
            product_id: product_id.into(),
            movement_type: Some(kind),
            quantity: qty,
            ..Default::default()
        }
    }

    fn stock_of(db: &DbState, product_id: &str) -> StockLevel {
        stock_levels(db, Some(product_id)).unwrap().remove(0)
    }

    #[test]
    fn in_then_out_with_sufficiency_check() {
        let db = db::test_state();
        let wh = create_warehouse(&db, "Kitchen", None, false).unwrap();
        assert!(wh.is_default);
        let p = product(&db, "flour", 0.0);

        record_movement(
            &db,
            &MovementInput {
                to_warehouse_id: Some(wh.id.clone()),
                ..movement(MovementType::In, &p.id, 10.0)
            },
        )
        .unwrap();

        let err = record_movement(
            &db,
            &MovementInput {
                from_warehouse_id: Some(wh.id.clone()),
                ..movement(MovementType::Out, &p.id, 10.5)
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "insufficient_stock");

        record_movement(
            &db,
            &MovementInput {
                warehouse_id: Some(wh.id.clone()),
                ..movement(MovementType::Out, &p.id, 4.0)
            },
        )
        .unwrap();
        assert_eq!(stock_of(&db, &p.id).total, 6.0);
    }

    #[test]
    fn missing_warehouse_and_bad_quantity_are_rejected() {
        let db = db::test_state();
        let p = product(&db, "salt", 0.0);
        let err = record_movement(&db, &movement(MovementType::In, &p.id, 1.0)).unwrap_err();
        assert_eq!(err.code(), "validation");

        let wh = create_warehouse(&db, "Main", None, false).unwrap();
        let err = record_movement(
            &db,
            &MovementInput {
                to_warehouse_id: Some(wh.id.clone()),
                ..movement(MovementType::In, &p.id, 0.0)
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn transfer_moves_stock_between_warehouses() {
        let db = db::test_state();
        let main = create_warehouse(&db, "Main", None, false).unwrap();
        let bar = create_warehouse(&db, "Bar", None, false).unwrap();
        let p = product(&db, "beer", 0.0);
        record_movement(
            &db,
            &MovementInput {
                to_warehouse_id: Some(main.id.clone()),
                ..movement(MovementType::In, &p.id, 24.0)
            },
        )
        .unwrap();

        let same = record_movement(
            &db,
            &MovementInput {
                from_warehouse_id: Some(main.id.clone()),
                to_warehouse_id: Some(main.id.clone()),
                ..movement(MovementType::Transfer, &p.id, 1.0)
            },
        )
        .unwrap_err();
        assert_eq!(same.code(), "validation");

        let too_much = record_movement(
            &db,
            &MovementInput {
                from_warehouse_id: Some(main.id.clone()),
                to_warehouse_id: Some(bar.id.clone()),
                ..movement(MovementType::Transfer, &p.id, 30.0)
            },
        )
        .unwrap_err();
        assert_eq!(too_much.code(), "insufficient_stock");

        record_movement(
            &db,
            &MovementInput {
                from_warehouse_id: Some(main.id.clone()),
                to_warehouse_id: Some(bar.id.clone()),
                ..movement(MovementType::Transfer, &p.id, 6.0)
            },
        )
        .unwrap();

        let level = stock_of(&db, &p.id);
        assert_eq!(level.total, 24.0);
        let bar_qty = level
            .warehouses
            .iter()
            .find(|w| w.warehouse_id == bar.id)
            .map(|w| w.quantity);
        assert_eq!(bar_qty, Some(6.0));
    }

    #[test]
    fn adjust_sets_count_and_logs_delta() {
        let db = db::test_state();
        let wh = create_warehouse(&db, "Main", None, false).unwrap();
        let p = product(&db, "oil", 5.0);
        record_movement(
            &db,
            &MovementInput {
                to_warehouse_id: Some(wh.id.clone()),
                ..movement(MovementType::In, &p.id, 8.0)
            },
        )
        .unwrap();

        let adj = record_movement(
            &db,
            &MovementInput {
                warehouse_id: Some(wh.id.clone()),
                ..movement(MovementType::Adjust, &p.id, 3.0)
            },
        )
        .unwrap();
        assert_eq!(adj.quantity, -5.0);

        let level = stock_of(&db, &p.id);
        assert_eq!(level.total, 3.0);
        assert!(level.low_stock);
        assert_eq!(low_stock_alerts(&db).unwrap().len(), 1);

        let ledger = list_movements(
            &db,
            &MovementFilter {
                product_id: Some(p.id.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].movement_type, MovementType::Adjust);
    }

    #[test]
    fn duplicate_sku_is_a_conflict() {
        let db = db::test_state();
        product(&db, "cola", 0.0);
        let err = create_product(
            &db,
            &ProductInput {
                sku: "COLA".into(),
                name: "Other".into(),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn consume_order_items_is_all_or_nothing() {
        let db = db::test_state();
        let wh = create_warehouse(&db, "Main", None, false).unwrap();
        let bread = product(&db, "bread", 0.0);
        let cheese = product(&db, "cheese", 0.0);
        for (p, qty) in [(&bread, 5.0), (&cheese, 1.0)] {
            record_movement(
                &db,
                &MovementInput {
                    to_warehouse_id: Some(wh.id.clone()),
                    ..movement(MovementType::In, &p.id, qty)
                },
            )
            .unwrap();
        }

        let order = orders::open_order(
            &db,
            OpenOrderInput {
                order_type: OrderType::Takeaway,
                ..Default::default()
            },
        )
        .unwrap();
        for (p, qty) in [(&bread, 2.0), (&cheese, 3.0)] {
            orders::add_item(
                &db,
                AddItemInput {
                    order_id: order.id.clone(),
                    product_id: Some(p.id.clone()),
                    quantity: qty,
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let err = consume_order_items(&db, &order.id, None).unwrap_err();
        assert_eq!(err.code(), "insufficient_stock");
        assert_eq!(stock_of(&db, &bread.id).total, 5.0);

        orders::update_item_quantity(
            &db,
            &order.id,
            &orders::get_order(&db, &order.id).unwrap().items[1].id,
            1.0,
        )
        .unwrap();
        let consumed = consume_order_items(&db, &order.id, None).unwrap();
        assert_eq!(consumed.len(), 2);
        assert_eq!(stock_of(&db, &bread.id).total, 3.0);
        assert_eq!(stock_of(&db, &cheese.id).total, 0.0);

        let again = consume_order_items(&db, &order.id, None).unwrap_err();
        assert_eq!(again.code(), "conflict");
    }
}
