//! Invoice lifecycle for Mesa POS.
//!
//! An invoice is created as a **draft**, gets its number when it is
//! **issued**, collects payments until it is **paid**, and may end
//! **cancelled** (no payments yet) or **refunded** (after payments).
//!
//! ```text
//! draft ──issue──> issued ──pay──> partially_paid ──pay──> paid
//!   │                │                   │                  │
//!   └──cancel──> cancelled <──cancel─────┘(no payments)     │
//!                                        └────refund──> refunded <┘
//! ```
//!
//! **Rules:**
//! - Numbers are reserved from a persistent counter at issue time and are
//!   never reused, even when the invoice is later cancelled.
//! - A payment cannot exceed the balance due.
//! - An invoice with payments cannot be cancelled, only refunded.
//! - Cash payments and refunds can be tied to an open cash box session;
//!   the till movement is written in the same transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{info, warn};

use crate::cash_boxes::{self, MovementKind};
use crate::clients;
use crate::config::BillingSettings;
use crate::data_helpers::{clean_opt, like_pattern, require_text};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::orders::{self, ItemStatus, Order, OrderStatus};

/// Amounts within half a cent are treated as equal.
pub const MONEY_EPSILON: f64 = 0.005;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    PartiallyPaid,
    Paid,
    Cancelled,
    Refunded,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Issued => "issued",
            Self::PartiallyPaid => "partially_paid",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "issued" => Ok(Self::Issued),
            "partially_paid" => Ok(Self::PartiallyPaid),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            other => Err(PosError::validation(format!("Unknown invoice status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Card => "card",
            Self::Transfer => "transfer",
            Self::Other => "other",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(Self::Cash),
            "card" => Ok(Self::Card),
            "transfer" => Ok(Self::Transfer),
            "other" => Ok(Self::Other),
            other => Err(PosError::validation(format!(
                "Invalid method: {other}. Must be cash, card, transfer or other"
            ))),
        }
    }
}

/// Anything that can be priced as an invoice line.
pub trait BillableLine {
    fn quantity(&self) -> f64;
    fn unit_price(&self) -> f64;
    fn tax_rate(&self) -> f64;
    fn discount_percentage(&self) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineAmounts {
    pub subtotal: f64,
    pub discount: f64,
    pub tax: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceTotals {
    pub subtotal: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLineInput {
    #[serde(default, alias = "product_id")]
    pub product_id: Option<String>,
    #[serde(alias = "name")]
    pub description: String,
    pub quantity: f64,
    #[serde(alias = "unit_price", alias = "price")]
    pub unit_price: f64,
    /// Falls back to the billing default tax rate when absent.
    #[serde(default, alias = "tax_rate")]
    pub tax_rate: Option<f64>,
    #[serde(default, alias = "discount_percentage", alias = "discount")]
    pub discount_percentage: f64,
}

impl BillableLine for InvoiceLineInput {
    fn quantity(&self) -> f64 {
        self.quantity
    }
    fn unit_price(&self) -> f64 {
        self.unit_price
    }
    fn tax_rate(&self) -> f64 {
        self.tax_rate.unwrap_or(0.0)
    }
    fn discount_percentage(&self) -> f64 {
        self.discount_percentage
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceInput {
    #[serde(default, alias = "client_id")]
    pub client_id: Option<String>,
    #[serde(default, alias = "order_id")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "due_date")]
    pub due_date: Option<String>,
    #[serde(alias = "items")]
    pub lines: Vec<InvoiceLineInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInput {
    #[serde(alias = "invoice_id", alias = "id")]
    pub invoice_id: String,
    pub method: PaymentMethod,
    pub amount: f64,
    #[serde(default, alias = "transactionRef", alias = "transaction_ref")]
    pub reference: Option<String>,
    #[serde(default, alias = "cash_box_session_id", alias = "sessionId")]
    pub cash_box_session_id: Option<String>,
    #[serde(default, alias = "received_by", alias = "staffId")]
    pub received_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundInput {
    #[serde(alias = "invoice_id", alias = "id")]
    pub invoice_id: String,
    pub reason: String,
    #[serde(default, alias = "cash_box_session_id", alias = "sessionId")]
    pub cash_box_session_id: Option<String>,
    #[serde(default)]
    pub method: Option<PaymentMethod>,
    #[serde(default, alias = "staff_id")]
    pub staff_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceFilter {
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
    #[serde(default, alias = "client_id")]
    pub client_id: Option<String>,
    #[serde(default, alias = "query", alias = "q")]
    pub search: Option<String>,
    #[serde(default, alias = "date_from", alias = "from")]
    pub date_from: Option<String>,
    #[serde(default, alias = "date_to", alias = "to")]
    pub date_to: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLine {
    pub id: String,
    pub position: i64,
    pub product_id: Option<String>,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub tax_rate: f64,
    pub discount_percentage: f64,
    pub amounts: LineAmounts,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvoicePayment {
    pub id: String,
    pub method: PaymentMethod,
    pub amount: f64,
    pub reference: Option<String>,
    pub cash_box_session_id: Option<String>,
    pub received_by: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    pub invoice_number: Option<String>,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub order_id: Option<String>,
    pub status: InvoiceStatus,
    pub currency: String,
    pub totals: InvoiceTotals,
    pub amount_paid: f64,
    pub balance_due: f64,
    pub refunded_amount: f64,
    pub notes: Option<String>,
    pub due_date: Option<String>,
    pub issued_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub cancellation_reason: Option<String>,
    pub refunded_at: Option<String>,
    pub refund_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub lines: Vec<InvoiceLine>,
    pub payments: Vec<InvoicePayment>,
}

/// Flat invoice row used by listings and client statements.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSummaryRow {
    pub id: String,
    pub invoice_number: Option<String>,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub status: InvoiceStatus,
    pub currency: String,
    pub total_amount: f64,
    pub amount_paid: f64,
    pub balance_due: f64,
    pub created_at: String,
    pub issued_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSummary {
    pub counts: BTreeMap<String, i64>,
    pub total_billed: f64,
    pub total_collected: f64,
    pub total_outstanding: f64,
    pub total_refunded: f64,
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

/// Price a single line. Every component is rounded to cents.
pub fn compute_line<L: BillableLine + ?Sized>(line: &L) -> LineAmounts {
    let subtotal = db::round2(line.quantity() * line.unit_price());
    let discount = db::round2(subtotal * line.discount_percentage() / 100.0);
    let tax = db::round2((subtotal - discount) * line.tax_rate() / 100.0);
    LineAmounts {
        subtotal,
        discount,
        tax,
        total: db::round2(subtotal - discount + tax),
    }
}

/// Sum of the rounded line amounts.
pub fn compute_totals<'a, L, I>(lines: I) -> InvoiceTotals
where
    L: BillableLine + 'a,
    I: IntoIterator<Item = &'a L>,
{
    let mut totals = InvoiceTotals::default();
    for line in lines {
        let amounts = compute_line(line);
        totals.subtotal += amounts.subtotal;
        totals.discount_amount += amounts.discount;
        totals.tax_amount += amounts.tax;
        totals.total_amount += amounts.total;
    }
    InvoiceTotals {
        subtotal: db::round2(totals.subtotal),
        discount_amount: db::round2(totals.discount_amount),
        tax_amount: db::round2(totals.tax_amount),
        total_amount: db::round2(totals.total_amount),
    }
}

fn validate_lines(lines: &mut [InvoiceLineInput], default_tax_rate: f64) -> PosResult<()> {
    if lines.is_empty() {
        return Err(PosError::validation("An invoice needs at least one line"));
    }
    for (idx, line) in lines.iter_mut().enumerate() {
        let n = idx + 1;
        line.description = require_text(
            &line.description,
            &format!("Line {n}: description is required"),
        )?;
        if !(line.quantity > 0.0) {
            return Err(PosError::validation(format!("Line {n}: quantity must be positive")));
        }
        if !(line.unit_price >= 0.0) {
            return Err(PosError::validation(format!(
                "Line {n}: unit price cannot be negative"
            )));
        }
        let rate = *line.tax_rate.get_or_insert(default_tax_rate);
        if !(0.0..=100.0).contains(&rate) {
            return Err(PosError::validation(format!(
                "Line {n}: tax rate must be between 0 and 100"
            )));
        }
        if !(0.0..=100.0).contains(&line.discount_percentage) {
            return Err(PosError::validation(format!(
                "Line {n}: discount must be between 0 and 100"
            )));
        }
        line.product_id = clean_opt(line.product_id.take());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row loading
// ---------------------------------------------------------------------------

const INVOICE_COLUMNS: &str = "i.id, i.invoice_number, i.client_id, c.name, i.order_id, i.status,
    i.currency, i.subtotal, i.discount_amount, i.tax_amount, i.total_amount, i.amount_paid,
    i.balance_due, i.refunded_amount, i.notes, i.due_date, i.issued_at, i.cancelled_at,
    i.cancellation_reason, i.refunded_at, i.refund_reason, i.created_at, i.updated_at";

fn invoice_from_row(row: &Row) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        id: row.get(0)?,
        invoice_number: row.get(1)?,
        client_id: row.get(2)?,
        client_name: row.get(3)?,
        order_id: row.get(4)?,
        status: db::parse_column(row, 5)?,
        currency: row.get(6)?,
        totals: InvoiceTotals {
            subtotal: row.get(7)?,
            discount_amount: row.get(8)?,
            tax_amount: row.get(9)?,
            total_amount: row.get(10)?,
        },
        amount_paid: row.get(11)?,
        balance_due: row.get(12)?,
        refunded_amount: row.get(13)?,
        notes: row.get(14)?,
        due_date: row.get(15)?,
        issued_at: row.get(16)?,
        cancelled_at: row.get(17)?,
        cancellation_reason: row.get(18)?,
        refunded_at: row.get(19)?,
        refund_reason: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
        lines: Vec::new(),
        payments: Vec::new(),
    })
}

const SUMMARY_COLUMNS: &str = "i.id, i.invoice_number, i.client_id, c.name, i.status, i.currency,
    i.total_amount, i.amount_paid, i.balance_due, i.created_at, i.issued_at";

fn summary_from_row(row: &Row) -> rusqlite::Result<InvoiceSummaryRow> {
    Ok(InvoiceSummaryRow {
        id: row.get(0)?,
        invoice_number: row.get(1)?,
        client_id: row.get(2)?,
        client_name: row.get(3)?,
        status: db::parse_column(row, 4)?,
        currency: row.get(5)?,
        total_amount: row.get(6)?,
        amount_paid: row.get(7)?,
        balance_due: row.get(8)?,
        created_at: row.get(9)?,
        issued_at: row.get(10)?,
    })
}

pub(crate) fn load_invoice(conn: &Connection, invoice_id: &str) -> PosResult<Invoice> {
    let mut invoice = conn
        .query_row(
            &format!(
                "SELECT {INVOICE_COLUMNS} FROM invoices i
                 LEFT JOIN clients c ON c.id = i.client_id
                 WHERE i.id = ?1"
            ),
            params![invoice_id],
            invoice_from_row,
        )
        .optional()?
        .ok_or_else(|| PosError::not_found("invoice", invoice_id))?;

    let mut line_stmt = conn.prepare(
        "SELECT id, position, product_id, description, quantity, unit_price, tax_rate,
                discount_percentage, line_subtotal, line_discount, line_tax, line_total
         FROM invoice_items WHERE invoice_id = ?1 ORDER BY position",
    )?;
    invoice.lines = line_stmt
        .query_map(params![invoice_id], |row| {
            Ok(InvoiceLine {
                id: row.get(0)?,
                position: row.get(1)?,
                product_id: row.get(2)?,
                description: row.get(3)?,
                quantity: row.get(4)?,
                unit_price: row.get(5)?,
                tax_rate: row.get(6)?,
                discount_percentage: row.get(7)?,
                amounts: LineAmounts {
                    subtotal: row.get(8)?,
                    discount: row.get(9)?,
                    tax: row.get(10)?,
                    total: row.get(11)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut pay_stmt = conn.prepare(
        "SELECT id, method, amount, reference, cash_box_session_id, received_by, created_at
         FROM invoice_payments WHERE invoice_id = ?1 ORDER BY created_at ASC",
    )?;
    invoice.payments = pay_stmt
        .query_map(params![invoice_id], |row| {
            Ok(InvoicePayment {
                id: row.get(0)?,
                method: db::parse_column(row, 1)?,
                amount: row.get(2)?,
                reference: row.get(3)?,
                cash_box_session_id: row.get(4)?,
                received_by: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(invoice)
}

fn load_status(conn: &Connection, invoice_id: &str) -> PosResult<InvoiceStatus> {
    let raw: String = conn
        .query_row(
            "SELECT status FROM invoices WHERE id = ?1",
            params![invoice_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| PosError::not_found("invoice", invoice_id))?;
    raw.parse()
}

fn write_lines(conn: &Connection, invoice_id: &str, lines: &[InvoiceLineInput]) -> PosResult<()> {
    conn.execute(
        "DELETE FROM invoice_items WHERE invoice_id = ?1",
        params![invoice_id],
    )?;
    for (position, line) in lines.iter().enumerate() {
        let amounts = compute_line(line);
        conn.execute(
            "INSERT INTO invoice_items (
                id, invoice_id, position, product_id, description, quantity, unit_price,
                tax_rate, discount_percentage, line_subtotal, line_discount, line_tax, line_total
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                db::new_id(),
                invoice_id,
                position as i64,
                line.product_id,
                line.description,
                line.quantity,
                line.unit_price,
                line.tax_rate(),
                line.discount_percentage,
                amounts.subtotal,
                amounts.discount,
                amounts.tax,
                amounts.total,
            ],
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Create / edit drafts
// ---------------------------------------------------------------------------

/// Fail unless the order can take a new invoice: not cancelled and not
/// already linked to a live one.
fn ensure_order_billable(conn: &Connection, order: &Order) -> PosResult<()> {
    if order.status == OrderStatus::Cancelled {
        return Err(PosError::InvalidTransition {
            entity: "order",
            action: "bill",
            status: order.status.as_str().into(),
        });
    }
    if let Some(ref existing) = order.invoice_id {
        let status = load_status(conn, existing)?;
        if status != InvoiceStatus::Cancelled {
            return Err(PosError::Conflict(format!(
                "Order {} is already billed on invoice {existing}",
                order.order_number
            )));
        }
    }
    Ok(())
}

/// Insert a draft invoice and link it to its order, if any. Must run
/// inside a transaction.
pub(crate) fn create_invoice_tx(conn: &Connection, input: CreateInvoiceInput) -> PosResult<String> {
    let settings = BillingSettings::load(conn);
    let mut lines = input.lines;
    validate_lines(&mut lines, settings.default_tax_rate)?;
    db::validate_date(input.due_date.as_deref(), "Due date")?;

    let client_id = clean_opt(input.client_id);
    if let Some(ref cid) = client_id {
        clients::load_client(conn, cid)?;
    }
    let order_id = clean_opt(input.order_id);
    if let Some(ref oid) = order_id {
        ensure_order_billable(conn, &orders::load_order(conn, oid)?)?;
    }

    let totals = compute_totals(&lines);
    let invoice_id = db::new_id();
    let now = db::now_rfc3339();

    conn.execute(
        "INSERT INTO invoices (
            id, client_id, order_id, status, currency, subtotal, discount_amount, tax_amount,
            total_amount, amount_paid, balance_due, notes, due_date, created_at, updated_at
        ) VALUES (?1, ?2, ?3, 'draft', ?4, ?5, ?6, ?7, ?8, 0, ?8, ?9, ?10, ?11, ?11)",
        params![
            invoice_id,
            client_id,
            order_id,
            settings.currency,
            totals.subtotal,
            totals.discount_amount,
            totals.tax_amount,
            totals.total_amount,
            clean_opt(input.notes),
            input.due_date,
            now,
        ],
    )?;
    write_lines(conn, &invoice_id, &lines)?;

    if let Some(ref oid) = order_id {
        conn.execute(
            "UPDATE orders SET invoice_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![invoice_id, now, oid],
        )?;
    }
    Ok(invoice_id)
}

/// Create a draft invoice.
pub fn create_invoice(db: &DbState, input: CreateInvoiceInput) -> PosResult<Invoice> {
    let conn = db.conn.lock()?;
    let invoice_id = db::transaction(&conn, || create_invoice_tx(&conn, input))?;
    let invoice = load_invoice(&conn, &invoice_id)?;
    info!(
        invoice_id = %invoice_id,
        total = %invoice.totals.total_amount,
        lines = invoice.lines.len(),
        "Draft invoice created"
    );
    Ok(invoice)
}

/// Rewrite the lines of a draft and its totals. Must run inside a transaction.
fn rewrite_draft_tx(conn: &Connection, invoice_id: &str, lines: &[InvoiceLineInput]) -> PosResult<()> {
    let totals = compute_totals(lines);
    write_lines(conn, invoice_id, lines)?;
    conn.execute(
        "UPDATE invoices SET subtotal = ?1, discount_amount = ?2, tax_amount = ?3,
                total_amount = ?4, balance_due = ?4, updated_at = ?5
         WHERE id = ?6",
        params![
            totals.subtotal,
            totals.discount_amount,
            totals.tax_amount,
            totals.total_amount,
            db::now_rfc3339(),
            invoice_id,
        ],
    )?;
    Ok(())
}

fn ensure_draft(conn: &Connection, invoice_id: &str) -> PosResult<()> {
    let status = load_status(conn, invoice_id)?;
    if status != InvoiceStatus::Draft {
        return Err(PosError::InvalidTransition {
            entity: "invoice",
            action: "edit lines of",
            status: status.as_str().into(),
        });
    }
    Ok(())
}

/// Replace every line of a draft and recompute its totals.
pub fn replace_invoice_lines(
    db: &DbState,
    invoice_id: &str,
    mut lines: Vec<InvoiceLineInput>,
) -> PosResult<Invoice> {
    let conn = db.conn.lock()?;
    ensure_draft(&conn, invoice_id)?;
    let settings = BillingSettings::load(&conn);
    validate_lines(&mut lines, settings.default_tax_rate)?;

    db::transaction(&conn, || rewrite_draft_tx(&conn, invoice_id, &lines))?;
    load_invoice(&conn, invoice_id)
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// Reserve the next invoice number: `{prefix}-{YYYY}-{NNNNN}`.
fn reserve_invoice_number(conn: &Connection) -> PosResult<String> {
    let settings = BillingSettings::load(conn);
    let next = db::next_counter(conn, "billing", "invoice_counter")?;
    let year = chrono::Utc::now().format("%Y");
    Ok(format!("{}-{}-{:05}", settings.invoice_prefix, year, next))
}

/// Move a draft to issued and assign its number. Must run inside a transaction.
pub(crate) fn issue_invoice_tx(conn: &Connection, invoice_id: &str) -> PosResult<String> {
    let status = load_status(conn, invoice_id)?;
    if status != InvoiceStatus::Draft {
        return Err(PosError::InvalidTransition {
            entity: "invoice",
            action: "issue",
            status: status.as_str().into(),
        });
    }

    let total: f64 = conn.query_row(
        "SELECT total_amount FROM invoices WHERE id = ?1",
        params![invoice_id],
        |row| row.get(0),
    )?;
    // Nothing to collect on a zero-total invoice.
    let new_status = if total <= MONEY_EPSILON {
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::Issued
    };

    let number = reserve_invoice_number(conn)?;
    let now = db::now_rfc3339();
    conn.execute(
        "UPDATE invoices SET invoice_number = ?1, status = ?2, issued_at = ?3, updated_at = ?3
         WHERE id = ?4",
        params![number, new_status.as_str(), now, invoice_id],
    )?;
    Ok(number)
}

pub fn issue_invoice(db: &DbState, invoice_id: &str) -> PosResult<Invoice> {
    let conn = db.conn.lock()?;
    let number = db::transaction(&conn, || issue_invoice_tx(&conn, invoice_id))?;
    info!(invoice_id = %invoice_id, invoice_number = %number, "Invoice issued");
    load_invoice(&conn, invoice_id)
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

/// Record a payment against an issued invoice.
///
/// Updates `amount_paid` / `balance_due`, moves the status to
/// `partially_paid` or `paid`, and, when a cash box session is given,
/// writes the matching `sale` movement in the same transaction.
pub fn record_payment(db: &DbState, input: PaymentInput) -> PosResult<Invoice> {
    if !(input.amount > 0.0) {
        return Err(PosError::validation("Amount must be positive"));
    }
    let amount = db::round2(input.amount);

    let conn = db.conn.lock()?;
    let invoice = load_invoice(&conn, &input.invoice_id)?;
    if !matches!(
        invoice.status,
        InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid
    ) {
        return Err(PosError::InvalidTransition {
            entity: "invoice",
            action: "record a payment on",
            status: invoice.status.as_str().into(),
        });
    }
    if amount > invoice.balance_due + MONEY_EPSILON {
        return Err(PosError::Overpayment {
            amount,
            balance: invoice.balance_due,
        });
    }

    let new_paid = db::round2(invoice.amount_paid + amount);
    let mut new_balance = db::round2(invoice.totals.total_amount - new_paid);
    let new_status = if new_balance <= MONEY_EPSILON {
        new_balance = 0.0;
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::PartiallyPaid
    };

    let payment_id = db::new_id();
    let now = db::now_rfc3339();
    let session_id = clean_opt(input.cash_box_session_id);
    let reference = clean_opt(input.reference);

    db::transaction(&conn, || {
        conn.execute(
            "INSERT INTO invoice_payments (
                id, invoice_id, method, amount, reference, cash_box_session_id,
                received_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                payment_id,
                input.invoice_id,
                input.method.as_str(),
                amount,
                reference,
                session_id,
                input.received_by,
                now,
            ],
        )?;

        conn.execute(
            "UPDATE invoices SET amount_paid = ?1, balance_due = ?2, status = ?3, updated_at = ?4
             WHERE id = ?5",
            params![new_paid, new_balance, new_status.as_str(), now, input.invoice_id],
        )?;

        if let Some(ref sid) = session_id {
            let label = invoice
                .invoice_number
                .clone()
                .unwrap_or_else(|| invoice.id.clone());
            cash_boxes::record_movement_tx(
                &conn,
                &cash_boxes::NewMovement {
                    session_id: sid.clone(),
                    kind: MovementKind::Sale,
                    amount,
                    method: input.method,
                    description: Some(format!("Payment {label}")),
                    reference: Some(payment_id.clone()),
                    created_by: input.received_by.clone(),
                },
            )?;
        }
        Ok(())
    })?;

    info!(
        payment_id = %payment_id,
        invoice_id = %input.invoice_id,
        method = %input.method.as_str(),
        amount = %amount,
        status = %new_status.as_str(),
        "Payment recorded"
    );

    load_invoice(&conn, &input.invoice_id)
}

// ---------------------------------------------------------------------------
// Cancel / refund
// ---------------------------------------------------------------------------

/// Cancel a draft or issued invoice. Invoices with payments must be refunded instead.
pub fn cancel_invoice(db: &DbState, invoice_id: &str, reason: Option<String>) -> PosResult<Invoice> {
    let conn = db.conn.lock()?;
    let invoice = load_invoice(&conn, invoice_id)?;

    if !invoice.payments.is_empty() || invoice.amount_paid > MONEY_EPSILON {
        return Err(PosError::InvoiceHasPayments);
    }
    if !matches!(invoice.status, InvoiceStatus::Draft | InvoiceStatus::Issued) {
        return Err(PosError::InvalidTransition {
            entity: "invoice",
            action: "cancel",
            status: invoice.status.as_str().into(),
        });
    }

    let now = db::now_rfc3339();
    db::transaction(&conn, || {
        conn.execute(
            "UPDATE invoices SET status = 'cancelled', balance_due = 0, cancelled_at = ?1,
                    cancellation_reason = ?2, updated_at = ?1
             WHERE id = ?3",
            params![now, clean_opt(reason), invoice_id],
        )?;
        // The order can be billed again.
        if let Some(ref order_id) = invoice.order_id {
            conn.execute(
                "UPDATE orders SET invoice_id = NULL, updated_at = ?1
                 WHERE id = ?2 AND invoice_id = ?3",
                params![now, order_id, invoice_id],
            )?;
        }
        Ok(())
    })?;

    info!(invoice_id = %invoice_id, "Invoice cancelled");
    load_invoice(&conn, invoice_id)
}

/// Refund everything collected on a paid or partially paid invoice.
pub fn refund_invoice(db: &DbState, input: RefundInput) -> PosResult<Invoice> {
    let reason = require_text(&input.reason, "Refund reason is required")?;
    let conn = db.conn.lock()?;
    let invoice = load_invoice(&conn, &input.invoice_id)?;

    if !matches!(
        invoice.status,
        InvoiceStatus::Paid | InvoiceStatus::PartiallyPaid
    ) {
        return Err(PosError::InvalidTransition {
            entity: "invoice",
            action: "refund",
            status: invoice.status.as_str().into(),
        });
    }

    let refund_amount = invoice.amount_paid;
    let now = db::now_rfc3339();
    let session_id = clean_opt(input.cash_box_session_id);
    // Money goes back the way most of it came in.
    let method = input.method.unwrap_or_else(|| {
        invoice
            .payments
            .iter()
            .max_by(|a, b| a.amount.total_cmp(&b.amount))
            .map(|p| p.method)
            .unwrap_or(PaymentMethod::Cash)
    });

    db::transaction(&conn, || {
        conn.execute(
            "UPDATE invoices SET status = 'refunded', refunded_amount = ?1, balance_due = 0,
                    refunded_at = ?2, refund_reason = ?3, updated_at = ?2
             WHERE id = ?4",
            params![refund_amount, now, reason, input.invoice_id],
        )?;

        if let Some(ref sid) = session_id {
            if refund_amount > MONEY_EPSILON {
                cash_boxes::record_movement_tx(
                    &conn,
                    &cash_boxes::NewMovement {
                        session_id: sid.clone(),
                        kind: MovementKind::Refund,
                        amount: refund_amount,
                        method,
                        description: Some(reason.clone()),
                        reference: Some(input.invoice_id.clone()),
                        created_by: input.staff_id.clone(),
                    },
                )?;
            }
        } else {
            warn!(
                invoice_id = %input.invoice_id,
                amount = %refund_amount,
                "Refund recorded without a cash box session"
            );
        }
        Ok(())
    })?;

    info!(invoice_id = %input.invoice_id, amount = %refund_amount, "Invoice refunded");
    load_invoice(&conn, &input.invoice_id)
}

// ---------------------------------------------------------------------------
// From order
// ---------------------------------------------------------------------------

/// Invoice lines for an order's non-cancelled items.
fn order_lines(order: &Order) -> PosResult<Vec<InvoiceLineInput>> {
    let lines: Vec<InvoiceLineInput> = order
        .items
        .iter()
        .filter(|item| item.status != ItemStatus::Cancelled)
        .map(|item| InvoiceLineInput {
            product_id: item.product_id.clone(),
            description: item.name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            tax_rate: Some(item.tax_rate),
            discount_percentage: 0.0,
        })
        .collect();
    if lines.is_empty() {
        return Err(PosError::validation(format!(
            "Order {} has no billable items",
            order.order_number
        )));
    }
    Ok(lines)
}

/// Build a draft from an order's non-cancelled items. Must run inside a transaction.
pub(crate) fn invoice_from_order_tx(conn: &Connection, order_id: &str) -> PosResult<String> {
    let order = orders::load_order(conn, order_id)?;
    ensure_order_billable(conn, &order)?;
    let lines = order_lines(&order)?;

    create_invoice_tx(
        conn,
        CreateInvoiceInput {
            client_id: order.client_id.clone(),
            order_id: Some(order.id.clone()),
            notes: Some(format!("Order {}", order.order_number)),
            due_date: None,
            lines,
        },
    )
}

/// Bring a linked draft in line with the order's current items. Must run
/// inside a transaction.
pub(crate) fn refresh_draft_from_order_tx(
    conn: &Connection,
    invoice_id: &str,
    order: &Order,
) -> PosResult<()> {
    ensure_draft(conn, invoice_id)?;
    rewrite_draft_tx(conn, invoice_id, &order_lines(order)?)
}

pub fn invoice_from_order(db: &DbState, order_id: &str) -> PosResult<Invoice> {
    let conn = db.conn.lock()?;
    let invoice_id = db::transaction(&conn, || invoice_from_order_tx(&conn, order_id))?;
    info!(invoice_id = %invoice_id, order_id = %order_id, "Draft invoice created from order");
    load_invoice(&conn, &invoice_id)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn get_invoice(db: &DbState, invoice_id: &str) -> PosResult<Invoice> {
    let conn = db.conn.lock()?;
    load_invoice(&conn, invoice_id)
}

/// List invoices, newest first.
pub fn list_invoices(db: &DbState, filter: &InvoiceFilter) -> PosResult<Vec<InvoiceSummaryRow>> {
    db::validate_date(filter.date_from.as_deref(), "dateFrom")?;
    db::validate_date(filter.date_to.as_deref(), "dateTo")?;

    let conn = db.conn.lock()?;
    let search = filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(like_pattern)
        .unwrap_or_default();
    let limit = filter.limit.unwrap_or(200).clamp(1, 1000) as i64;

    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM invoices i
         LEFT JOIN clients c ON c.id = i.client_id
         WHERE (?1 = '' OR i.status = ?1)
           AND (?2 = '' OR i.client_id = ?2)
           AND (?3 = '' OR lower(COALESCE(i.invoice_number, '')) LIKE ?3 ESCAPE '\\'
                        OR lower(COALESCE(c.name, '')) LIKE ?3 ESCAPE '\\')
           AND (?4 = '' OR substr(i.created_at, 1, 10) >= ?4)
           AND (?5 = '' OR substr(i.created_at, 1, 10) <= ?5)
         ORDER BY i.created_at DESC
         LIMIT ?6"
    ))?;
    let rows = stmt.query_map(
        params![
            filter.status.map(InvoiceStatus::as_str).unwrap_or(""),
            filter.client_id.as_deref().unwrap_or(""),
            search,
            filter.date_from.as_deref().unwrap_or(""),
            filter.date_to.as_deref().unwrap_or(""),
            limit,
        ],
        summary_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn invoice_rows_for_client(
    conn: &Connection,
    client_id: &str,
) -> PosResult<Vec<InvoiceSummaryRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM invoices i
         LEFT JOIN clients c ON c.id = i.client_id
         WHERE i.client_id = ?1
         ORDER BY i.created_at DESC"
    ))?;
    let rows = stmt.query_map(params![client_id], summary_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Counts per status and money totals across all non-draft invoices.
pub fn invoice_summary(db: &DbState) -> PosResult<InvoiceSummary> {
    let conn = db.conn.lock()?;
    let mut summary = InvoiceSummary::default();

    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*), COALESCE(SUM(total_amount), 0), COALESCE(SUM(amount_paid), 0),
                COALESCE(SUM(balance_due), 0), COALESCE(SUM(refunded_amount), 0)
         FROM invoices GROUP BY status",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            db::parse_column::<InvoiceStatus>(row, 0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, f64>(5)?,
        ))
    })?;

    for row in rows {
        let (status, count, total, paid, balance, refunded) = row?;
        summary.counts.insert(status.as_str().to_string(), count);
        match status {
            InvoiceStatus::Draft | InvoiceStatus::Cancelled => {}
            InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid => {
                summary.total_billed += total;
                summary.total_collected += paid;
                summary.total_outstanding += balance;
            }
            InvoiceStatus::Paid => {
                summary.total_billed += total;
                summary.total_collected += paid;
            }
            InvoiceStatus::Refunded => {
                summary.total_billed += total;
                summary.total_collected += paid;
                summary.total_refunded += refunded;
            }
        }
    }

    summary.total_billed = db::round2(summary.total_billed);
    summary.total_collected = db::round2(summary.total_collected);
    summary.total_outstanding = db::round2(summary.total_outstanding);
    summary.total_refunded = db::round2(summary.total_refunded);
    Ok(summary)
}

// ===========================================================================
// Tests
// ===========================================================================
