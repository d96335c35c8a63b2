//! Cash boxes (tills), their sessions and the movement ledger.
//!
//! A session is opened with a float, collects movements while open, and is
//! closed with a counted amount. Only `cash` movements affect the cash
//! expected in the drawer:
//!
//! `expected = opening + cash inflows - cash outflows`
//! `difference = counted - expected`

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{info, warn};

use crate::billing::{PaymentMethod, MONEY_EPSILON};
use crate::data_helpers::{clean_opt, require_text};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Sale,
    Income,
    Expense,
    Withdrawal,
    Deposit,
    Refund,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Withdrawal => "withdrawal",
            Self::Deposit => "deposit",
            Self::Refund => "refund",
        }
    }

    /// Money leaving the drawer.
    pub fn is_outflow(self) -> bool {
        matches!(self, Self::Expense | Self::Withdrawal | Self::Refund)
    }

    /// Kinds an operator may enter by hand. Sales and refunds come from billing.
    pub fn is_manual(self) -> bool {
        matches!(
            self,
            Self::Income | Self::Expense | Self::Withdrawal | Self::Deposit
        )
    }
}

impl FromStr for MovementKind {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sale" => Ok(Self::Sale),
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            "withdrawal" => Ok(Self::Withdrawal),
            "deposit" => Ok(Self::Deposit),
            "refund" => Ok(Self::Refund),
            other => Err(PosError::validation(format!("Unknown movement type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = PosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(PosError::validation(format!("Unknown session status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CashBox {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashBoxOverview {
    #[serde(flatten)]
    pub cash_box: CashBox,
    pub open_session: Option<CashSession>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CashSession {
    pub id: String,
    pub cash_box_id: String,
    pub status: SessionStatus,
    pub opened_by: Option<String>,
    pub opening_amount: f64,
    pub expected_amount: Option<f64>,
    pub counted_amount: Option<f64>,
    pub difference: Option<f64>,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub closed_by: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CashMovement {
    pub id: String,
    pub session_id: String,
    pub kind: MovementKind,
    pub method: PaymentMethod,
    pub amount: f64,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
}

/// Movement to append to a session ledger.
#[derive(Debug, Clone)]
pub struct NewMovement {
    pub session_id: String,
    pub kind: MovementKind,
    pub amount: f64,
    pub method: PaymentMethod,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualMovementInput {
    #[serde(alias = "session_id")]
    pub session_id: String,
    #[serde(alias = "type", alias = "movement_type", alias = "movementType")]
    pub kind: MovementKind,
    pub amount: f64,
    #[serde(default, alias = "payment_method", alias = "paymentMethod")]
    pub method: Option<PaymentMethod>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default, alias = "created_by", alias = "staffId")]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session: CashSession,
    pub totals_by_kind: BTreeMap<String, f64>,
    pub totals_by_method: BTreeMap<String, f64>,
    pub cash_in: f64,
    pub cash_out: f64,
    pub expected_cash: f64,
    pub movements: Vec<CashMovement>,
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

const SESSION_COLUMNS: &str = "id, cash_box_id, status, opened_by, opening_amount,
    expected_amount, counted_amount, difference, opened_at, closed_at, closed_by, notes";

fn session_from_row(row: &Row) -> rusqlite::Result<CashSession> {
    Ok(CashSession {
        id: row.get(0)?,
        cash_box_id: row.get(1)?,
        status: db::parse_column(row, 2)?,
        opened_by: row.get(3)?,
        opening_amount: row.get(4)?,
        expected_amount: row.get(5)?,
        counted_amount: row.get(6)?,
        difference: row.get(7)?,
        opened_at: row.get(8)?,
        closed_at: row.get(9)?,
        closed_by: row.get(10)?,
        notes: row.get(11)?,
    })
}

fn cash_box_from_row(row: &Row) -> rusqlite::Result<CashBox> {
    Ok(CashBox {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn load_cash_box(conn: &Connection, cash_box_id: &str) -> PosResult<CashBox> {
    conn.query_row(
        "SELECT id, name, location, is_active, created_at, updated_at
         FROM cash_boxes WHERE id = ?1",
        params![cash_box_id],
        cash_box_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("cash box", cash_box_id))
}

fn load_session(conn: &Connection, session_id: &str) -> PosResult<CashSession> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM cash_box_sessions WHERE id = ?1"),
        params![session_id],
        session_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("cash box session", session_id))
}

fn open_session_for(conn: &Connection, cash_box_id: &str) -> PosResult<Option<CashSession>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM cash_box_sessions
                 WHERE cash_box_id = ?1 AND status = 'open'"
            ),
            params![cash_box_id],
            session_from_row,
        )
        .optional()?)
}

fn load_movements(conn: &Connection, session_id: &str) -> PosResult<Vec<CashMovement>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, movement_type, payment_method, amount, description,
                reference, created_by, created_at
         FROM cash_box_movements WHERE session_id = ?1
         ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok(CashMovement {
            id: row.get(0)?,
            session_id: row.get(1)?,
            kind: db::parse_column(row, 2)?,
            method: db::parse_column(row, 3)?,
            amount: row.get(4)?,
            description: row.get(5)?,
            reference: row.get(6)?,
            created_by: row.get(7)?,
            created_at: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Cash the drawer should hold right now.
fn expected_cash(conn: &Connection, session: &CashSession) -> PosResult<f64> {
    let (cash_in, cash_out): (f64, f64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN movement_type IN ('sale', 'income', 'deposit') THEN amount END), 0),
            COALESCE(SUM(CASE WHEN movement_type IN ('expense', 'withdrawal', 'refund') THEN amount END), 0)
         FROM cash_box_movements
         WHERE session_id = ?1 AND payment_method = 'cash'",
        params![session.id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(db::round2(session.opening_amount + cash_in - cash_out))
}

// ---------------------------------------------------------------------------
// Cash boxes
// ---------------------------------------------------------------------------

pub(crate) fn insert_cash_box(
    conn: &Connection,
    name: &str,
    location: Option<&str>,
) -> PosResult<String> {
    let name = require_text(name, "Cash box name is required")?;
    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM cash_boxes WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(PosError::Conflict(format!("Cash box '{name}' already exists")));
    }

    let id = db::new_id();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO cash_boxes (id, name, location, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?4)",
        params![id, name, clean_opt(location.map(str::to_string)), now],
    )?;
    info!(cash_box_id = %id, name = %name, "Cash box created");
    Ok(id)
}

pub fn create_cash_box(db: &DbState, name: &str, location: Option<&str>) -> PosResult<CashBox> {
    let conn = db.conn.lock()?;
    let id = insert_cash_box(&conn, name, location)?;
    load_cash_box(&conn, &id)
}

/// Active cash boxes with their open session, if any.
pub fn list_cash_boxes(db: &DbState) -> PosResult<Vec<CashBoxOverview>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, location, is_active, created_at, updated_at
         FROM cash_boxes WHERE is_active = 1 ORDER BY name",
    )?;
    let boxes = stmt
        .query_map([], cash_box_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    boxes
        .into_iter()
        .map(|cash_box| -> PosResult<CashBoxOverview> {
            let open_session = open_session_for(&conn, &cash_box.id)?;
            Ok(CashBoxOverview {
                cash_box,
                open_session,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Open a session on a cash box. A box has at most one open session.
pub fn open_session(
    db: &DbState,
    cash_box_id: &str,
    opening_amount: f64,
    opened_by: Option<&str>,
) -> PosResult<CashSession> {
    if !(opening_amount >= 0.0) {
        return Err(PosError::validation("Opening amount cannot be negative"));
    }
    let conn = db.conn.lock()?;
    let cash_box = load_cash_box(&conn, cash_box_id)?;
    if !cash_box.is_active {
        return Err(PosError::validation(format!(
            "Cash box '{}' is inactive",
            cash_box.name
        )));
    }
    if let Some(existing) = open_session_for(&conn, cash_box_id)? {
        return Err(PosError::Conflict(format!(
            "Cash box '{}' already has an open session ({})",
            cash_box.name, existing.id
        )));
    }

    let id = db::new_id();
    conn.execute(
        "INSERT INTO cash_box_sessions (id, cash_box_id, status, opened_by, opening_amount, opened_at)
         VALUES (?1, ?2, 'open', ?3, ?4, ?5)",
        params![
            id,
            cash_box_id,
            opened_by,
            db::round2(opening_amount),
            db::now_rfc3339()
        ],
    )?;

    info!(
        session_id = %id,
        cash_box_id = %cash_box_id,
        opening = %opening_amount,
        "Cash box session opened"
    );
    load_session(&conn, &id)
}

/// Append a movement to an open session. Must run inside a transaction.
///
/// Cash outflows cannot take the drawer below zero.
pub(crate) fn record_movement_tx(conn: &Connection, movement: &NewMovement) -> PosResult<String> {
    if !(movement.amount > 0.0) {
        return Err(PosError::validation("Amount must be positive"));
    }
    let amount = db::round2(movement.amount);
    let session = load_session(conn, &movement.session_id)?;
    if session.status != SessionStatus::Open {
        return Err(PosError::InvalidTransition {
            entity: "cash box session",
            action: "record a movement on",
            status: session.status.as_str().into(),
        });
    }

    if movement.kind.is_outflow() && movement.method == PaymentMethod::Cash {
        let available = expected_cash(conn, &session)?;
        if amount > available + MONEY_EPSILON {
            return Err(PosError::validation(format!(
                "Not enough cash in the drawer: requested {amount:.2}, available {available:.2}"
            )));
        }
    }

    let id = db::new_id();
    conn.execute(
        "INSERT INTO cash_box_movements (
            id, session_id, movement_type, payment_method, amount, description,
            reference, created_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            movement.session_id,
            movement.kind.as_str(),
            movement.method.as_str(),
            amount,
            movement.description,
            movement.reference,
            movement.created_by,
            db::now_rfc3339(),
        ],
    )?;
    Ok(id)
}

/// Record an income, expense, withdrawal or deposit entered by an operator.
pub fn add_movement(db: &DbState, input: ManualMovementInput) -> PosResult<CashMovement> {
    if !input.kind.is_manual() {
        return Err(PosError::validation(format!(
            "Movements of type '{}' are recorded by billing",
            input.kind.as_str()
        )));
    }
    let conn = db.conn.lock()?;
    let movement = NewMovement {
        session_id: input.session_id.clone(),
        kind: input.kind,
        amount: input.amount,
        method: input.method.unwrap_or(PaymentMethod::Cash),
        description: clean_opt(input.description),
        reference: clean_opt(input.reference),
        created_by: input.created_by,
    };
    let id = db::transaction(&conn, || record_movement_tx(&conn, &movement))?;

    info!(
        movement_id = %id,
        session_id = %movement.session_id,
        kind = %movement.kind.as_str(),
        amount = %movement.amount,
        "Cash movement recorded"
    );

    load_movements(&conn, &movement.session_id)?
        .into_iter()
        .find(|m| m.id == id)
        .ok_or_else(|| PosError::not_found("cash movement", id))
}

fn build_summary(conn: &Connection, session: CashSession) -> PosResult<SessionSummary> {
    let movements = load_movements(conn, &session.id)?;
    let mut totals_by_kind: BTreeMap<String, f64> = BTreeMap::new();
    let mut totals_by_method: BTreeMap<String, f64> = BTreeMap::new();
    let (mut cash_in, mut cash_out) = (0.0, 0.0);

    for m in &movements {
        *totals_by_kind.entry(m.kind.as_str().to_string()).or_default() += m.amount;
        let signed = if m.kind.is_outflow() { -m.amount } else { m.amount };
        *totals_by_method.entry(m.method.as_str().to_string()).or_default() += signed;
        if m.method == PaymentMethod::Cash {
            if m.kind.is_outflow() {
                cash_out += m.amount;
            } else {
                cash_in += m.amount;
            }
        }
    }
    for v in totals_by_kind.values_mut().chain(totals_by_method.values_mut()) {
        *v = db::round2(*v);
    }

    let expected_cash = db::round2(session.opening_amount + cash_in - cash_out);
    Ok(SessionSummary {
        session,
        totals_by_kind,
        totals_by_method,
        cash_in: db::round2(cash_in),
        cash_out: db::round2(cash_out),
        expected_cash,
        movements,
    })
}

pub fn session_summary(db: &DbState, session_id: &str) -> PosResult<SessionSummary> {
    let conn = db.conn.lock()?;
    let session = load_session(&conn, session_id)?;
    build_summary(&conn, session)
}

/// Close an open session with the counted cash and store the difference.
pub fn close_session(
    db: &DbState,
    session_id: &str,
    counted_amount: f64,
    closed_by: Option<&str>,
    notes: Option<String>,
) -> PosResult<SessionSummary> {
    if !(counted_amount >= 0.0) {
        return Err(PosError::validation("Counted amount cannot be negative"));
    }
    let conn = db.conn.lock()?;
    let session = load_session(&conn, session_id)?;
    if session.status != SessionStatus::Open {
        return Err(PosError::InvalidTransition {
            entity: "cash box session",
            action: "close",
            status: session.status.as_str().into(),
        });
    }

    let expected = expected_cash(&conn, &session)?;
    let counted = db::round2(counted_amount);
    let difference = db::round2(counted - expected);

    conn.execute(
        "UPDATE cash_box_sessions
         SET status = 'closed', expected_amount = ?1, counted_amount = ?2, difference = ?3,
             closed_at = ?4, closed_by = ?5, notes = ?6
         WHERE id = ?7",
        params![
            expected,
            counted,
            difference,
            db::now_rfc3339(),
            closed_by,
            clean_opt(notes),
            session_id
        ],
    )?;

    if difference.abs() > MONEY_EPSILON {
        warn!(
            session_id = %session_id,
            expected = %expected,
            counted = %counted,
            difference = %difference,
            "Cash box closed with a difference"
        );
    } else {
        info!(session_id = %session_id, expected = %expected, "Cash box session closed");
    }

    let closed = load_session(&conn, session_id)?;
    build_summary(&conn, closed)
}

/// Sessions of a cash box, newest first.
pub fn list_sessions(db: &DbState, cash_box_id: &str) -> PosResult<Vec<CashSession>> {
    let conn = db.conn.lock()?;
    load_cash_box(&conn, cash_box_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM cash_box_sessions
         WHERE cash_box_id = ?1 ORDER BY opened_at DESC"
    ))?;
    let rows = stmt.query_map(params![cash_box_id], session_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(session_id: &str, kind: MovementKind, amount: f64) -> ManualMovementInput {
        ManualMovementInput {
            session_id: session_id.into(),
            kind,
            amount,
            method: None,
            description: Some("test".into()),
            reference: None,
            created_by: None,
        }
    }

    #[test]
    fn one_open_session_per_box() {
        let db = db::test_state();
        let till = create_cash_box(&db, "Main", Some("Counter")).unwrap();
        open_session(&db, &till.id, 50.0, Some("ana")).unwrap();

        let err = open_session(&db, &till.id, 10.0, None).unwrap_err();
        assert_eq!(err.code(), "conflict");

        let listed = list_cash_boxes(&db).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].open_session.is_some());
    }

    #[test]
    fn close_computes_expected_and_difference() {
        let db = db::test_state();
        let till = create_cash_box(&db, "Main", None).unwrap();
        let session = open_session(&db, &till.id, 100.0, None).unwrap();

        add_movement(&db, manual(&session.id, MovementKind::Income, 20.0)).unwrap();
        add_movement(&db, manual(&session.id, MovementKind::Expense, 15.5)).unwrap();
        add_movement(
            &db,
            ManualMovementInput {
                method: Some(PaymentMethod::Card),
                ..manual(&session.id, MovementKind::Deposit, 40.0)
            },
        )
        .unwrap();

        let summary = close_session(&db, &session.id, 100.0, Some("ana"), None).unwrap();
        assert_eq!(summary.expected_cash, 104.5);
        assert_eq!(summary.session.status, SessionStatus::Closed);
        assert_eq!(summary.session.expected_amount, Some(104.5));
        assert_eq!(summary.session.difference, Some(-4.5));
        assert_eq!(summary.totals_by_method.get("card"), Some(&40.0));

        let err = close_session(&db, &session.id, 1.0, None, None).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");

        // A new session can be opened once the previous one is closed.
        open_session(&db, &till.id, 0.0, None).unwrap();
        assert_eq!(list_sessions(&db, &till.id).unwrap().len(), 2);
    }

    #[test]
    fn cash_outflow_cannot_exceed_drawer() {
        let db = db::test_state();
        let till = create_cash_box(&db, "Main", None).unwrap();
        let session = open_session(&db, &till.id, 30.0, None).unwrap();

        let err = add_movement(&db, manual(&session.id, MovementKind::Withdrawal, 30.01)).unwrap_err();
        assert_eq!(err.code(), "validation");

        add_movement(&db, manual(&session.id, MovementKind::Withdrawal, 30.0)).unwrap();
        let summary = session_summary(&db, &session.id).unwrap();
        assert_eq!(summary.expected_cash, 0.0);
        assert_eq!(summary.movements.len(), 1);
    }

    #[test]
    fn sales_cannot_be_entered_by_hand() {
        let db = db::test_state();
        let till = create_cash_box(&db, "Main", None).unwrap();
        let session = open_session(&db, &till.id, 0.0, None).unwrap();

        let err = add_movement(&db, manual(&session.id, MovementKind::Sale, 5.0)).unwrap_err();
        assert_eq!(err.code(), "validation");
        let err = add_movement(&db, manual(&session.id, MovementKind::Income, 0.0)).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn duplicate_box_name_is_a_conflict() {
        let db = db::test_state();
        create_cash_box(&db, "Bar", None).unwrap();
        assert_eq!(create_cash_box(&db, "Bar", None).unwrap_err().code(), "conflict");
        assert_eq!(open_session(&db, "missing", 0.0, None).unwrap_err().code(), "not_found");
    }
}
