//! Client directory.
//!
//! Clients are optional on orders and invoices. They are never hard
//! deleted, only deactivated, so old invoices keep pointing at them.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::billing::{self, InvoiceStatus, InvoiceSummaryRow};
use crate::data_helpers::{clean_opt, like_pattern, normalize_phone, require_text};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub name: String,
    pub tax_id: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInput {
    pub name: String,
    #[serde(default, alias = "tax_id", alias = "nif")]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "telephone", alias = "mobile")]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatement {
    pub client: Client,
    pub invoices: Vec<InvoiceSummaryRow>,
    pub total_billed: f64,
    pub total_paid: f64,
    pub outstanding: f64,
}

const CLIENT_COLUMNS: &str =
    "id, name, tax_id, email, phone, address, notes, is_active, created_at, updated_at";

fn client_from_row(row: &Row) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        tax_id: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        address: row.get(5)?,
        notes: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn validate_input(input: &ClientInput) -> PosResult<ClientInput> {
    let name = require_text(&input.name, "Client name is required")?;
    let email = clean_opt(input.email.clone());
    if let Some(ref e) = email {
        let valid = e
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
            .unwrap_or(false);
        if !valid {
            return Err(PosError::validation(format!("Invalid email: {e}")));
        }
    }
    Ok(ClientInput {
        name,
        tax_id: clean_opt(input.tax_id.clone()),
        email,
        phone: clean_opt(input.phone.clone()),
        address: clean_opt(input.address.clone()),
        notes: clean_opt(input.notes.clone()),
    })
}

pub(crate) fn load_client(conn: &Connection, client_id: &str) -> PosResult<Client> {
    conn.query_row(
        &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
        params![client_id],
        client_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found("client", client_id))
}

fn ensure_tax_id_free(conn: &Connection, tax_id: &str, except_id: Option<&str>) -> PosResult<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM clients WHERE tax_id = ?1 AND is_active = 1",
            params![tax_id],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(id) if Some(id.as_str()) != except_id => Err(PosError::Conflict(format!(
            "A client with tax id {tax_id} already exists ({id})"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn insert_client(conn: &Connection, input: &ClientInput) -> PosResult<String> {
    let input = validate_input(input)?;
    if let Some(ref tax_id) = input.tax_id {
        ensure_tax_id_free(conn, tax_id, None)?;
    }

    let id = db::new_id();
    let now = db::now_rfc3339();
    let phone_digits = input.phone.as_deref().map(normalize_phone);
    conn.execute(
        "INSERT INTO clients (id, name, tax_id, email, phone, phone_digits, address, notes,
                              is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)",
        params![
            id,
            input.name,
            input.tax_id,
            input.email,
            input.phone,
            phone_digits,
            input.address,
            input.notes,
            now,
        ],
    )?;

    info!(client_id = %id, "Client created");
    Ok(id)
}

pub fn create_client(db: &DbState, input: &ClientInput) -> PosResult<Client> {
    let conn = db.conn.lock()?;
    let id = insert_client(&conn, input)?;
    load_client(&conn, &id)
}

pub fn update_client(db: &DbState, client_id: &str, input: &ClientInput) -> PosResult<Client> {
    let input = validate_input(input)?;
    let conn = db.conn.lock()?;
    load_client(&conn, client_id)?;
    if let Some(ref tax_id) = input.tax_id {
        ensure_tax_id_free(&conn, tax_id, Some(client_id))?;
    }

    let phone_digits = input.phone.as_deref().map(normalize_phone);
    conn.execute(
        "UPDATE clients SET name = ?1, tax_id = ?2, email = ?3, phone = ?4, phone_digits = ?5,
                address = ?6, notes = ?7, updated_at = ?8
         WHERE id = ?9",
        params![
            input.name,
            input.tax_id,
            input.email,
            input.phone,
            phone_digits,
            input.address,
            input.notes,
            db::now_rfc3339(),
            client_id,
        ],
    )?;
    load_client(&conn, client_id)
}

pub fn get_client(db: &DbState, client_id: &str) -> PosResult<Client> {
    let conn = db.conn.lock()?;
    load_client(&conn, client_id)
}

pub fn set_client_active(db: &DbState, client_id: &str, active: bool) -> PosResult<Client> {
    let conn = db.conn.lock()?;
    load_client(&conn, client_id)?;
    conn.execute(
        "UPDATE clients SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
        params![active as i64, db::now_rfc3339(), client_id],
    )?;
    info!(client_id = %client_id, active, "Client active flag changed");
    load_client(&conn, client_id)
}

/// Search active clients by name, email or tax id; digits in the query
/// also match the stored phone with punctuation stripped.
pub fn search_clients(db: &DbState, query: &str, include_inactive: bool) -> PosResult<Vec<Client>> {
    let conn = db.conn.lock()?;
    let pattern = like_pattern(query);
    let digits = normalize_phone(query);
    let digits_pattern = if digits.len() >= 3 {
        format!("%{digits}%")
    } else {
        String::new()
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients
         WHERE (?3 = 1 OR is_active = 1)
           AND (lower(name) LIKE ?1 ESCAPE '\\'
                OR lower(COALESCE(email, '')) LIKE ?1 ESCAPE '\\'
                OR lower(COALESCE(tax_id, '')) LIKE ?1 ESCAPE '\\'
                OR (?2 <> '' AND COALESCE(phone_digits, '') LIKE ?2))
         ORDER BY name COLLATE NOCASE
         LIMIT 200"
    ))?;
    let rows = stmt.query_map(
        params![pattern, digits_pattern, include_inactive as i64],
        client_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Invoices of a client plus billed / paid / outstanding totals.
/// Drafts and cancelled invoices are listed but excluded from the totals.
pub fn client_statement(db: &DbState, client_id: &str) -> PosResult<ClientStatement> {
    let conn = db.conn.lock()?;
    let client = load_client(&conn, client_id)?;
    let invoices = billing::invoice_rows_for_client(&conn, client_id)?;

    let counted = invoices.iter().filter(|inv| {
        !matches!(inv.status, InvoiceStatus::Draft | InvoiceStatus::Cancelled)
    });
    let (mut billed, mut paid, mut outstanding) = (0.0, 0.0, 0.0);
    for inv in counted {
        billed += inv.total_amount;
        paid += inv.amount_paid;
        if matches!(inv.status, InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid) {
            outstanding += inv.balance_due;
        }
    }

    Ok(ClientStatement {
        client,
        invoices,
        total_billed: db::round2(billed),
        total_paid: db::round2(paid),
        outstanding: db::round2(outstanding),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str) -> ClientInput {
        ClientInput {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn create_and_search_by_phone_digits() {
        let db = db::test_state();
        let created = create_client(
            &db,
            &ClientInput {
                name: "Ana Torres".into(),
                phone: Some("+34 600-123-456".into()),
                email: Some("ana@example.com".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(created.is_active);

        let found = search_clients(&db, "600123", false).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, created.id);

        let by_name = search_clients(&db, "torr", false).unwrap();
        assert_eq!(by_name.len(), 1);
    }

    #[test]
    fn create_rejects_blank_name_and_bad_email() {
        let db = db::test_state();
        assert_eq!(create_client(&db, &input("  ")).unwrap_err().code(), "validation");

        let err = create_client(
            &db,
            &ClientInput {
                name: "Bad".into(),
                email: Some("not-an-email".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn duplicate_tax_id_is_a_conflict() {
        let db = db::test_state();
        let with_tax = |name: &str| ClientInput {
            name: name.into(),
            tax_id: Some("B12345678".into()),
            ..Default::default()
        };
        create_client(&db, &with_tax("Acme")).unwrap();
        let err = create_client(&db, &with_tax("Acme 2")).unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn deactivated_clients_are_hidden_from_search() {
        let db = db::test_state();
        let c = create_client(&db, &input("Bar Central")).unwrap();
        set_client_active(&db, &c.id, false).unwrap();

        assert!(search_clients(&db, "central", false).unwrap().is_empty());
        assert_eq!(search_clients(&db, "central", true).unwrap().len(), 1);
    }

    #[test]
    fn update_missing_client_is_not_found() {
        let db = db::test_state();
        let err = update_client(&db, "nope", &input("X")).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn update_cannot_take_another_clients_tax_id() {
        let db = db::test_state();
        create_client(
            &db,
            &ClientInput {
                name: "Acme".into(),
                tax_id: Some("B11111111".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let other = create_client(
            &db,
            &ClientInput {
                name: "Globex".into(),
                tax_id: Some("B22222222".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let err = update_client(
            &db,
            &other.id,
            &ClientInput {
                name: "Globex".into(),
                tax_id: Some("B11111111".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "conflict");

        // Keeping its own tax id is fine
        let renamed = update_client(
            &db,
            &other.id,
            &ClientInput {
                name: "Globex Iberia".into(),
                tax_id: Some("B22222222".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(renamed.name, "Globex Iberia");
    }

    #[test]
    fn statement_totals_skip_drafts_and_cancelled() {
        use crate::billing::{CreateInvoiceInput, InvoiceLineInput, PaymentInput, PaymentMethod};

        let db = db::test_state();
        let client = create_client(&db, &input("Casa Pepe")).unwrap();
        let invoice = |amount: f64| {
            billing::create_invoice(
                &db,
                CreateInvoiceInput {
                    client_id: Some(client.id.clone()),
                    lines: vec![InvoiceLineInput {
                        product_id: None,
                        description: "Catering".into(),
                        quantity: 1.0,
                        unit_price: amount,
                        tax_rate: Some(0.0),
                        discount_percentage: 0.0,
                    }],
                    ..Default::default()
                },
            )
            .unwrap()
        };

        let paid = invoice(100.0);
        billing::issue_invoice(&db, &paid.id).unwrap();
        billing::record_payment(
            &db,
            PaymentInput {
                invoice_id: paid.id.clone(),
                method: PaymentMethod::Transfer,
                amount: 40.0,
                reference: None,
                cash_box_session_id: None,
                received_by: None,
            },
        )
        .unwrap();
        invoice(30.0);
        let cancelled = invoice(50.0);
        billing::issue_invoice(&db, &cancelled.id).unwrap();
        billing::cancel_invoice(&db, &cancelled.id, None).unwrap();

        let statement = client_statement(&db, &client.id).unwrap();
        assert_eq!(statement.invoices.len(), 3);
        assert_eq!(statement.total_billed, 100.0);
        assert_eq!(statement.total_paid, 40.0);
        assert_eq!(statement.outstanding, 60.0);

        assert_eq!(client_statement(&db, "nope").unwrap_err().code(), "not_found");
    }
}
