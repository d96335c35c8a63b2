//! Point-of-sale orders.
//!
//! Order lines are stored as a JSON array on the order row. Every change to
//! the lines recomputes the order totals with the same arithmetic used for
//! invoices, so closing an order produces an invoice with identical totals.
//!
//! ```text
//! pending -> preparing -> ready -> served -> closed
//!    \___________\____________\_______\___-> cancelled
//! ```

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{info, warn};

use crate::billing::{self, BillableLine, Invoice, InvoiceStatus, InvoiceTotals};
use crate::clients;
use crate::config::BillingSettings;
use crate::data_helpers::{clean_opt, require_text};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::inventory;
use crate::tables::{self, TableStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Served,
    Closed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Served => "served",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_open(self) -> bool {
        !matches!(self, Self::Closed | Self::Cancelled)
    }

    /// Next step of the kitchen flow.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Preparing),
            Self::Preparing => Some(Self::Ready),
            Self::Ready => Some(Self::Served),
            Self::Served | Self::Closed | Self::Cancelled => None,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "preparing" => Ok(Self::Preparing),
            "ready" => Ok(Self::Ready),
            "served" => Ok(Self::Served),
            "closed" => Ok(Self::Closed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PosError::validation(format!("Unknown order status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[default]
    #[serde(alias = "dine-in")]
    DineIn,
    Takeaway,
    Delivery,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DineIn => "dine_in",
            Self::Takeaway => "takeaway",
            Self::Delivery => "delivery",
        }
    }
}

impl FromStr for OrderType {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dine_in" | "dine-in" => Ok(Self::DineIn),
            "takeaway" => Ok(Self::Takeaway),
            "delivery" => Ok(Self::Delivery),
            other => Err(PosError::validation(format!("Unknown order type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Preparing,
    Ready,
    Served,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub tax_rate: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl BillableLine for OrderItem {
    fn quantity(&self) -> f64 {
        self.quantity
    }
    fn unit_price(&self) -> f64 {
        self.unit_price
    }
    fn tax_rate(&self) -> f64 {
        self.tax_rate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub table_id: Option<String>,
    pub table_number: Option<String>,
    pub client_id: Option<String>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub guests: i64,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
    pub notes: Option<String>,
    pub staff_id: Option<String>,
    pub invoice_id: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrderInput {
    #[serde(default, alias = "order_type", alias = "type")]
    pub order_type: OrderType,
    #[serde(default, alias = "table_id")]
    pub table_id: Option<String>,
    #[serde(default, alias = "client_id", alias = "customerId")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub guests: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "staff_id")]
    pub staff_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddItemInput {
    #[serde(alias = "order_id")]
    pub order_id: String,
    #[serde(default, alias = "product_id", alias = "menuItemId")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub quantity: f64,
    #[serde(default, alias = "unit_price", alias = "price")]
    pub unit_price: Option<f64>,
    #[serde(default, alias = "tax_rate")]
    pub tax_rate: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilter {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default, alias = "table_id")]
    pub table_id: Option<String>,
    #[serde(default, alias = "open_only")]
    pub open_only: bool,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOrderResult {
    pub order: Order,
    pub invoice: Invoice,
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "o.id, o.order_number, o.table_id, t.number, o.client_id,
    o.order_type, o.status, o.items, o.guests, o.subtotal, o.discount_amount, o.tax_amount,
    o.total_amount, o.notes, o.staff_id, o.invoice_id, o.cancellation_reason, o.created_at,
    o.updated_at, o.closed_at";

fn order_from_row(row: &Row) -> rusqlite::Result<Order> {
    let items_json: String = row.get(7)?;
    let items: Vec<OrderItem> = serde_json::from_str(&items_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Order {
        id: row.get(0)?,
        order_number: row.get(1)?,
        table_id: row.get(2)?,
        table_number: row.get(3)?,
        client_id: row.get(4)?,
        order_type: db::parse_column(row, 5)?,
        status: db::parse_column(row, 6)?,
        items,
        guests: row.get(8)?,
        subtotal: row.get(9)?,
        discount_amount: row.get(10)?,
        tax_amount: row.get(11)?,
        total_amount: row.get(12)?,
        notes: row.get(13)?,
        staff_id: row.get(14)?,
        invoice_id: row.get(15)?,
        cancellation_reason: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
        closed_at: row.get(19)?,
    })
}

pub(crate) fn load_order(conn: &Connection, order_id: &str) -> PosResult<Order> {
    conn.query_row(
        &format!(
            "SELECT {ORDER_COLUMNS} FROM orders o
             LEFT JOIN dining_tables t ON t.id = o.table_id
             WHERE o.id = ?1"
        ),
        params![order_id],
        order_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("order", order_id))
}

fn load_open_order(conn: &Connection, order_id: &str, action: &'static str) -> PosResult<Order> {
    let order = load_order(conn, order_id)?;
    if !order.status.is_open() {
        return Err(PosError::InvalidTransition {
            entity: "order",
            action,
            status: order.status.as_str().into(),
        });
    }
    Ok(order)
}

/// Lines stay editable while the order is unbilled or only has a draft.
fn ensure_items_editable(conn: &Connection, order: &Order) -> PosResult<()> {
    let Some(ref invoice_id) = order.invoice_id else {
        return Ok(());
    };
    let invoice = billing::load_invoice(conn, invoice_id)?;
    if matches!(invoice.status, InvoiceStatus::Draft | InvoiceStatus::Cancelled) {
        return Ok(());
    }
    Err(PosError::Conflict(format!(
        "Order {} is billed on issued invoice {}",
        order.order_number,
        invoice.invoice_number.as_deref().unwrap_or(invoice_id)
    )))
}

/// Persist the lines and their recomputed totals.
fn save_items(conn: &Connection, order_id: &str, items: &[OrderItem]) -> PosResult<()> {
    let totals: InvoiceTotals = billing::compute_totals(
        items.iter().filter(|item| item.status != ItemStatus::Cancelled),
    );
    conn.execute(
        "UPDATE orders SET items = ?1, subtotal = ?2, discount_amount = ?3, tax_amount = ?4,
                total_amount = ?5, updated_at = ?6
         WHERE id = ?7",
        params![
            serde_json::to_string(items)?,
            totals.subtotal,
            totals.discount_amount,
            totals.tax_amount,
            totals.total_amount,
            db::now_rfc3339(),
            order_id,
        ],
    )?;
    Ok(())
}

/// Sequential order number `ORD-DDMMYYYY-NNNNN` backed by a persistent counter.
fn next_order_number(conn: &Connection) -> PosResult<String> {
    let date_display = chrono::Local::now().format("%d%m%Y").to_string();
    let next = db::next_counter(conn, "orders", "order_counter")?;
    Ok(format!("ORD-{date_display}-{next:05}"))
}

fn ensure_table_free(table: &tables::DiningTable) -> PosResult<()> {
    match table.status {
        TableStatus::Available | TableStatus::Reserved => Ok(()),
        other => Err(PosError::InvalidTransition {
            entity: "table",
            action: "seat an order at",
            status: other.as_str().into(),
        }),
    }
}

/// Free the order's table if it still points at this order.
fn release_table(conn: &Connection, order: &Order) -> PosResult<()> {
    if let Some(ref table_id) = order.table_id {
        let table = tables::load_table(conn, table_id)?;
        if table.current_order_id.as_deref() == Some(order.id.as_str()) {
            tables::occupy_table(conn, table_id, None)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Open an order. Dine-in orders seat at an available or reserved table,
/// which becomes occupied.
pub fn open_order(db: &DbState, input: OpenOrderInput) -> PosResult<Order> {
    let guests = input.guests.unwrap_or(1);
    if guests <= 0 {
        return Err(PosError::validation("Guests must be at least 1"));
    }
    let table_id = clean_opt(input.table_id);
    let client_id = clean_opt(input.client_id);

    let conn = db.conn.lock()?;
    match (input.order_type, &table_id) {
        (OrderType::DineIn, None) => {
            return Err(PosError::validation("Dine-in orders need a table"));
        }
        (OrderType::DineIn, Some(tid)) => ensure_table_free(&tables::load_table(&conn, tid)?)?,
        (_, Some(_)) => {
            return Err(PosError::validation("Only dine-in orders use a table"));
        }
        (_, None) => {}
    }
    if let Some(ref cid) = client_id {
        clients::load_client(&conn, cid)?;
    }

    let order_id = db::new_id();
    let order_number = db::transaction(&conn, || {
        let order_number = next_order_number(&conn)?;
        let now = db::now_rfc3339();
        conn.execute(
            "INSERT INTO orders (id, order_number, table_id, client_id, order_type, status, items,
                                 guests, notes, staff_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', '[]', ?6, ?7, ?8, ?9, ?9)",
            params![
                order_id,
                order_number,
                table_id,
                client_id,
                input.order_type.as_str(),
                guests,
                clean_opt(input.notes),
                input.staff_id,
                now,
            ],
        )?;
        if let Some(ref tid) = table_id {
            tables::occupy_table(&conn, tid, Some(&order_id))?;
        }
        Ok(order_number)
    })?;

    info!(
        order_id = %order_id,
        order_number = %order_number,
        order_type = %input.order_type.as_str(),
        "Order opened"
    );
    load_order(&conn, &order_id)
}

/// Add a line. Name, price and tax rate default from the product.
pub fn add_item(db: &DbState, input: AddItemInput) -> PosResult<Order> {
    if !(input.quantity > 0.0) {
        return Err(PosError::validation("Quantity must be positive"));
    }
    let conn = db.conn.lock()?;
    let mut order = load_open_order(&conn, &input.order_id, "add items to")?;
    ensure_items_editable(&conn, &order)?;

    let product_id = clean_opt(input.product_id);
    let (name, unit_price, tax_rate) = match product_id {
        Some(ref pid) => {
            let product = inventory::load_product(&conn, pid)?;
            if !product.is_active {
                return Err(PosError::validation(format!(
                    "Product {} is inactive",
                    product.name
                )));
            }
            (
                clean_opt(input.name).unwrap_or(product.name),
                input.unit_price.unwrap_or(product.sale_price),
                input.tax_rate.unwrap_or(product.tax_rate),
            )
        }
        None => {
            let name = require_text(
                input.name.as_deref().unwrap_or(""),
                "Item name is required without a product",
            )?;
            let price = input
                .unit_price
                .ok_or_else(|| PosError::validation("Item price is required without a product"))?;
            let rate = input
                .tax_rate
                .unwrap_or_else(|| BillingSettings::load(&conn).default_tax_rate);
            (name, price, rate)
        }
    };
    if !(unit_price >= 0.0) {
        return Err(PosError::validation("Unit price cannot be negative"));
    }
    if !(0.0..=100.0).contains(&tax_rate) {
        return Err(PosError::validation("Tax rate must be between 0 and 100"));
    }

    order.items.push(OrderItem {
        id: db::new_id(),
        product_id,
        name,
        quantity: input.quantity,
        unit_price: db::round2(unit_price),
        tax_rate,
        notes: clean_opt(input.notes),
        status: ItemStatus::Pending,
    });
    save_items(&conn, &order.id, &order.items)?;
    load_order(&conn, &order.id)
}

fn item_index(order: &Order, item_id: &str) -> PosResult<usize> {
    order
        .items
        .iter()
        .position(|item| item.id == item_id)
        .ok_or_else(|| PosError::not_found("order item", item_id))
}

pub fn update_item_quantity(
    db: &DbState,
    order_id: &str,
    item_id: &str,
    quantity: f64,
) -> PosResult<Order> {
    if !(quantity > 0.0) {
        return Err(PosError::validation("Quantity must be positive"));
    }
    let conn = db.conn.lock()?;
    let mut order = load_open_order(&conn, order_id, "edit items of")?;
    ensure_items_editable(&conn, &order)?;
    let idx = item_index(&order, item_id)?;
    order.items[idx].quantity = quantity;
    save_items(&conn, order_id, &order.items)?;
    load_order(&conn, order_id)
}

pub fn remove_item(db: &DbState, order_id: &str, item_id: &str) -> PosResult<Order> {
    let conn = db.conn.lock()?;
    let mut order = load_open_order(&conn, order_id, "remove items from")?;
    ensure_items_editable(&conn, &order)?;
    let idx = item_index(&order, item_id)?;
    let removed = order.items.remove(idx);
    save_items(&conn, order_id, &order.items)?;
    info!(order_id = %order_id, item = %removed.name, "Order item removed");
    load_order(&conn, order_id)
}

/// Kitchen status of a single line. Cancelled lines drop out of the totals.
pub fn set_item_status(
    db: &DbState,
    order_id: &str,
    item_id: &str,
    status: ItemStatus,
) -> PosResult<Order> {
    let conn = db.conn.lock()?;
    let mut order = load_open_order(&conn, order_id, "edit items of")?;
    ensure_items_editable(&conn, &order)?;
    let idx = item_index(&order, item_id)?;
    order.items[idx].status = status;
    save_items(&conn, order_id, &order.items)?;
    load_order(&conn, order_id)
}

/// Move the order one step along pending -> preparing -> ready -> served.
pub fn advance_status(db: &DbState, order_id: &str) -> PosResult<Order> {
    let conn = db.conn.lock()?;
    let order = load_order(&conn, order_id)?;
    let next = order.status.next().ok_or_else(|| PosError::InvalidTransition {
        entity: "order",
        action: "advance",
        status: order.status.as_str().into(),
    })?;
    if order.status == OrderStatus::Pending
        && order.items.iter().all(|i| i.status == ItemStatus::Cancelled)
    {
        return Err(PosError::validation("Cannot send an order without items"));
    }

    conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![next.as_str(), db::now_rfc3339(), order_id],
    )?;
    info!(order_id = %order_id, from = %order.status.as_str(), to = %next.as_str(), "Order advanced");
    load_order(&conn, order_id)
}

pub fn cancel_order(db: &DbState, order_id: &str, reason: Option<String>) -> PosResult<Order> {
    let conn = db.conn.lock()?;
    let order = load_open_order(&conn, order_id, "cancel")?;

    if let Some(ref invoice_id) = order.invoice_id {
        let invoice = billing::load_invoice(&conn, invoice_id)?;
        if invoice.status != InvoiceStatus::Cancelled {
            return Err(PosError::Conflict(format!(
                "Order {} is billed on invoice {invoice_id}; cancel the invoice first",
                order.order_number
            )));
        }
    }

    db::transaction(&conn, || {
        conn.execute(
            "UPDATE orders SET status = 'cancelled', cancellation_reason = ?1, closed_at = ?2,
                    updated_at = ?2
             WHERE id = ?3",
            params![clean_opt(reason), db::now_rfc3339(), order_id],
        )?;
        release_table(&conn, &order)
    })?;

    warn!(order_id = %order_id, order_number = %order.order_number, "Order cancelled");
    load_order(&conn, order_id)
}

/// Move a dine-in order to another table.
pub fn transfer_order(db: &DbState, order_id: &str, new_table_id: &str) -> PosResult<Order> {
    let conn = db.conn.lock()?;
    let order = load_open_order(&conn, order_id, "transfer")?;
    if order.order_type != OrderType::DineIn {
        return Err(PosError::validation("Only dine-in orders can change table"));
    }
    if order.table_id.as_deref() == Some(new_table_id) {
        return Err(PosError::validation("Order is already at that table"));
    }
    let target = tables::load_table(&conn, new_table_id)?;
    ensure_table_free(&target)?;

    db::transaction(&conn, || {
        release_table(&conn, &order)?;
        conn.execute(
            "UPDATE orders SET table_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_table_id, db::now_rfc3339(), order_id],
        )?;
        tables::occupy_table(&conn, new_table_id, Some(order_id))
    })?;

    info!(
        order_id = %order_id,
        from = ?order.table_number,
        to = %target.number,
        "Order transferred"
    );
    load_order(&conn, order_id)
}

/// Close a ready or served order: bill it, optionally issue the invoice,
/// and free the table. A linked draft is rebuilt from the current items.
pub fn close_order(db: &DbState, order_id: &str, issue: bool) -> PosResult<CloseOrderResult> {
    let conn = db.conn.lock()?;
    let order = load_order(&conn, order_id)?;
    if !matches!(order.status, OrderStatus::Ready | OrderStatus::Served) {
        return Err(PosError::InvalidTransition {
            entity: "order",
            action: "close",
            status: order.status.as_str().into(),
        });
    }

    let invoice_id = db::transaction(&conn, || {
        let existing = match order.invoice_id {
            Some(ref id) => {
                let invoice = billing::load_invoice(&conn, id)?;
                (invoice.status != InvoiceStatus::Cancelled).then_some(invoice)
            }
            None => None,
        };
        let (invoice_id, status) = match existing {
            Some(invoice) if invoice.status == InvoiceStatus::Draft => {
                // Items may have changed since the draft was built.
                billing::refresh_draft_from_order_tx(&conn, &invoice.id, &order)?;
                (invoice.id, invoice.status)
            }
            Some(invoice) => (invoice.id, invoice.status),
            None => (
                billing::invoice_from_order_tx(&conn, order_id)?,
                InvoiceStatus::Draft,
            ),
        };
        if issue && status == InvoiceStatus::Draft {
            billing::issue_invoice_tx(&conn, &invoice_id)?;
        }

        let now = db::now_rfc3339();
        conn.execute(
            "UPDATE orders SET status = 'closed', invoice_id = ?1, closed_at = ?2, updated_at = ?2
             WHERE id = ?3",
            params![invoice_id, now, order_id],
        )?;
        release_table(&conn, &order)?;
        Ok(invoice_id)
    })?;

    info!(
        order_id = %order_id,
        order_number = %order.order_number,
        invoice_id = %invoice_id,
        issued = issue,
        "Order closed"
    );
    Ok(CloseOrderResult {
        order: load_order(&conn, order_id)?,
        invoice: billing::load_invoice(&conn, &invoice_id)?,
    })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn get_order(db: &DbState, order_id: &str) -> PosResult<Order> {
    let conn = db.conn.lock()?;
    load_order(&conn, order_id)
}

/// Orders, newest first.
pub fn list_orders(db: &DbState, filter: &OrderFilter) -> PosResult<Vec<Order>> {
    let conn = db.conn.lock()?;
    let limit = filter.limit.unwrap_or(200).clamp(1, 1000) as i64;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders o
         LEFT JOIN dining_tables t ON t.id = o.table_id
         WHERE (?1 = '' OR o.status = ?1)
           AND (?2 = '' OR o.table_id = ?2)
           AND (?3 = 0 OR o.status NOT IN ('closed', 'cancelled'))
         ORDER BY o.created_at DESC
         LIMIT ?4"
    ))?;
    let rows = stmt.query_map(
        params![
            filter.status.map(OrderStatus::as_str).unwrap_or(""),
            filter.table_id.as_deref().unwrap_or(""),
            filter.open_only as i64,
            limit,
        ],
        order_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ProductInput;
    use crate::tables::TableInput;

    fn setup_table(db: &DbState, number: &str) -> tables::DiningTable {
        tables::create_table(
            db,
            &TableInput {
                number: number.into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn dine_in(db: &DbState, table_id: &str) -> Order {
        open_order(
            db,
            OpenOrderInput {
                table_id: Some(table_id.into()),
                guests: Some(2),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn free_item(order_id: &str, name: &str, qty: f64, price: f64) -> AddItemInput {
        AddItemInput {
            order_id: order_id.into(),
            name: Some(name.into()),
            quantity: qty,
            unit_price: Some(price),
            tax_rate: Some(10.0),
            ..Default::default()
        }
    }

    fn advance_to(db: &DbState, order_id: &str, target: OrderStatus) {
        while get_order(db, order_id).unwrap().status != target {
            advance_status(db, order_id).unwrap();
        }
    }

    #[test]
    fn open_dine_in_occupies_table_and_numbers_sequentially() {
        let db = db::test_state();
        let t1 = setup_table(&db, "1");
        let t2 = setup_table(&db, "2");

        let a = dine_in(&db, &t1.id);
        let b = dine_in(&db, &t2.id);
        assert!(a.order_number.starts_with("ORD-"));
        assert!(a.order_number.ends_with("-00001"));
        assert!(b.order_number.ends_with("-00002"));
        assert_eq!(a.table_number.as_deref(), Some("1"));

        let table = tables::list_tables(&db, None).unwrap().remove(0);
        assert_eq!(table.status, TableStatus::Occupied);
        assert_eq!(table.current_order_id.as_deref(), Some(a.id.as_str()));

        let err = open_order(
            &db,
            OpenOrderInput {
                table_id: Some(t1.id.clone()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn dine_in_requires_table_and_takeaway_rejects_one() {
        let db = db::test_state();
        let err = open_order(&db, OpenOrderInput::default()).unwrap_err();
        assert_eq!(err.code(), "validation");

        let t = setup_table(&db, "3");
        let err = open_order(
            &db,
            OpenOrderInput {
                order_type: OrderType::Delivery,
                table_id: Some(t.id),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn items_recompute_totals() {
        let db = db::test_state();
        let t = setup_table(&db, "4");
        let order = dine_in(&db, &t.id);

        let order = add_item(&db, free_item(&order.id, "Burger", 2.0, 10.0)).unwrap();
        let order = add_item(&db, free_item(&order.id, "Water", 1.0, 2.0)).unwrap();
        assert_eq!(order.subtotal, 22.0);
        assert_eq!(order.tax_amount, 2.2);
        assert_eq!(order.total_amount, 24.2);

        let water = order.items[1].id.clone();
        let order = set_item_status(&db, &order.id, &water, ItemStatus::Cancelled).unwrap();
        assert_eq!(order.total_amount, 22.0);

        let burger = order.items[0].id.clone();
        let order = update_item_quantity(&db, &order.id, &burger, 1.0).unwrap();
        assert_eq!(order.total_amount, 11.0);

        let order = remove_item(&db, &order.id, &water).unwrap();
        assert_eq!(order.items.len(), 1);
        assert_eq!(
            remove_item(&db, &order.id, "ghost").unwrap_err().code(),
            "not_found"
        );
    }

    #[test]
    fn add_item_defaults_from_product() {
        let db = db::test_state();
        let product = inventory::create_product(
            &db,
            &ProductInput {
                sku: "PAE".into(),
                name: "Paella".into(),
                sale_price: 14.5,
                tax_rate: Some(10.0),
                ..Default::default()
            },
        )
        .unwrap();
        let order = open_order(
            &db,
            OpenOrderInput {
                order_type: OrderType::Takeaway,
                ..Default::default()
            },
        )
        .unwrap();

        let order = add_item(
            &db,
            AddItemInput {
                order_id: order.id.clone(),
                product_id: Some(product.id.clone()),
                quantity: 2.0,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(order.items[0].name, "Paella");
        assert_eq!(order.items[0].unit_price, 14.5);
        assert_eq!(order.total_amount, 31.9);
    }

    #[test]
    fn advance_through_kitchen_flow() {
        let db = db::test_state();
        let t = setup_table(&db, "5");
        let order = dine_in(&db, &t.id);
        let err = advance_status(&db, &order.id).unwrap_err();
        assert_eq!(err.code(), "validation");

        add_item(&db, free_item(&order.id, "Soup", 1.0, 6.0)).unwrap();
        let o = advance_status(&db, &order.id).unwrap();
        assert_eq!(o.status, OrderStatus::Preparing);
        advance_to(&db, &order.id, OrderStatus::Served);
        let err = advance_status(&db, &order.id).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn cancel_frees_table() {
        let db = db::test_state();
        let t = setup_table(&db, "6");
        let order = dine_in(&db, &t.id);
        let cancelled = cancel_order(&db, &order.id, Some("Left".into())).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("Left"));

        let table = tables::list_tables(&db, None).unwrap().remove(0);
        assert_eq!(table.status, TableStatus::Available);
        assert!(table.current_order_id.is_none());

        let err = cancel_order(&db, &order.id, None).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn transfer_moves_occupancy() {
        let db = db::test_state();
        let t1 = setup_table(&db, "1");
        let t2 = setup_table(&db, "2");
        let order = dine_in(&db, &t1.id);

        let moved = transfer_order(&db, &order.id, &t2.id).unwrap();
        assert_eq!(moved.table_id.as_deref(), Some(t2.id.as_str()));

        let listed = tables::list_tables(&db, None).unwrap();
        assert_eq!(listed[0].status, TableStatus::Available);
        assert_eq!(listed[1].status, TableStatus::Occupied);

        let err = transfer_order(&db, &order.id, &t2.id).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn close_order_bills_and_frees_table() {
        let db = db::test_state();
        let t = setup_table(&db, "8");
        let order = dine_in(&db, &t.id);
        add_item(&db, free_item(&order.id, "Menu", 2.0, 12.0)).unwrap();

        let err = close_order(&db, &order.id, true).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");

        advance_to(&db, &order.id, OrderStatus::Served);
        let result = close_order(&db, &order.id, true).unwrap();
        assert_eq!(result.order.status, OrderStatus::Closed);
        assert_eq!(result.order.invoice_id.as_deref(), Some(result.invoice.id.as_str()));
        assert_eq!(result.invoice.status, InvoiceStatus::Issued);
        assert_eq!(result.invoice.totals.total_amount, result.order.total_amount);
        assert_eq!(result.invoice.order_id.as_deref(), Some(order.id.as_str()));

        let table = tables::list_tables(&db, None).unwrap().remove(0);
        assert_eq!(table.status, TableStatus::Available);
    }

    #[test]
    fn close_order_reuses_existing_draft() {
        let db = db::test_state();
        let order = open_order(
            &db,
            OpenOrderInput {
                order_type: OrderType::Takeaway,
                ..Default::default()
            },
        )
        .unwrap();
        add_item(&db, free_item(&order.id, "Pizza", 1.0, 9.0)).unwrap();
        let draft = billing::invoice_from_order(&db, &order.id).unwrap();

        advance_to(&db, &order.id, OrderStatus::Ready);
        let result = close_order(&db, &order.id, false).unwrap();
        assert_eq!(result.invoice.id, draft.id);
        assert_eq!(result.invoice.status, InvoiceStatus::Draft);
    }

    #[test]
    fn close_order_rebuilds_stale_draft() {
        let db = db::test_state();
        let order = open_order(
            &db,
            OpenOrderInput {
                order_type: OrderType::Takeaway,
                ..Default::default()
            },
        )
        .unwrap();
        add_item(&db, free_item(&order.id, "Pizza", 1.0, 9.0)).unwrap();
        let draft = billing::invoice_from_order(&db, &order.id).unwrap();
        assert_eq!(draft.totals.total_amount, 9.9);

        add_item(&db, free_item(&order.id, "Soda", 2.0, 3.0)).unwrap();
        advance_to(&db, &order.id, OrderStatus::Served);
        let result = close_order(&db, &order.id, true).unwrap();

        assert_eq!(result.invoice.id, draft.id);
        assert_eq!(result.invoice.status, InvoiceStatus::Issued);
        assert_eq!(result.invoice.lines.len(), 2);
        assert_eq!(result.invoice.totals.total_amount, result.order.total_amount);
        assert_eq!(result.invoice.totals.total_amount, 16.5);
        assert_eq!(result.invoice.balance_due, 16.5);
    }

    #[test]
    fn items_are_locked_once_invoice_is_issued() {
        let db = db::test_state();
        let order = open_order(
            &db,
            OpenOrderInput {
                order_type: OrderType::Takeaway,
                ..Default::default()
            },
        )
        .unwrap();
        let order = add_item(&db, free_item(&order.id, "Salad", 1.0, 7.0)).unwrap();
        let invoice = billing::invoice_from_order(&db, &order.id).unwrap();

        // A draft still allows edits
        add_item(&db, free_item(&order.id, "Bread", 1.0, 1.0)).unwrap();

        billing::issue_invoice(&db, &invoice.id).unwrap();
        let err = add_item(&db, free_item(&order.id, "Wine", 1.0, 4.0)).unwrap_err();
        assert_eq!(err.code(), "conflict");
        let err = remove_item(&db, &order.id, &order.items[0].id).unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert_eq!(get_order(&db, &order.id).unwrap().items.len(), 2);
    }

    #[test]
    fn cancel_refused_while_invoice_is_live() {
        let db = db::test_state();
        let t = setup_table(&db, "9");
        let order = dine_in(&db, &t.id);
        add_item(&db, free_item(&order.id, "Steak", 1.0, 20.0)).unwrap();
        let invoice = billing::invoice_from_order(&db, &order.id).unwrap();

        let err = cancel_order(&db, &order.id, None).unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert_eq!(get_order(&db, &order.id).unwrap().status, OrderStatus::Pending);

        billing::cancel_invoice(&db, &invoice.id, Some("Wrong table".into())).unwrap();
        let cancelled = cancel_order(&db, &order.id, None).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
    }
}
