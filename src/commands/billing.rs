use serde::Deserialize;
use serde_json::Value;

use super::{to_data, AppState};
use crate::auth::SessionInfo;
use crate::billing::{
    self, CreateInvoiceInput, InvoiceFilter, InvoiceLineInput, PaymentInput, RefundInput,
};
use crate::data_helpers::parse_payload;
use crate::error::PosResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceIdPayload {
    #[serde(alias = "invoiceId", alias = "invoice_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplaceLinesPayload {
    #[serde(alias = "invoiceId", alias = "invoice_id")]
    id: String,
    #[serde(alias = "items")]
    lines: Vec<InvoiceLineInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelPayload {
    #[serde(alias = "invoiceId", alias = "invoice_id")]
    id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderIdPayload {
    #[serde(alias = "orderId", alias = "order_id")]
    id: String,
}

pub(super) fn create(state: &AppState, payload: Value) -> PosResult<Value> {
    let input: CreateInvoiceInput = parse_payload(payload)?;
    to_data(billing::create_invoice(&state.db, input)?)
}

pub(super) fn replace_lines(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ReplaceLinesPayload = parse_payload(payload)?;
    to_data(billing::replace_invoice_lines(&state.db, &p.id, p.lines)?)
}

pub(super) fn issue(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: InvoiceIdPayload = parse_payload(payload)?;
    to_data(billing::issue_invoice(&state.db, &p.id)?)
}

pub(super) fn record_payment(
    state: &AppState,
    payload: Value,
    session: &SessionInfo,
) -> PosResult<Value> {
    let mut input: PaymentInput = parse_payload(payload)?;
    if input.received_by.is_none() {
        input.received_by = Some(session.staff_id.clone());
    }
    to_data(billing::record_payment(&state.db, input)?)
}

pub(super) fn cancel(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: CancelPayload = parse_payload(payload)?;
    to_data(billing::cancel_invoice(&state.db, &p.id, p.reason)?)
}

pub(super) fn refund(state: &AppState, payload: Value, session: &SessionInfo) -> PosResult<Value> {
    let mut input: RefundInput = parse_payload(payload)?;
    if input.staff_id.is_none() {
        input.staff_id = Some(session.staff_id.clone());
    }
    to_data(billing::refund_invoice(&state.db, input)?)
}

pub(super) fn get(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: InvoiceIdPayload = parse_payload(payload)?;
    to_data(billing::get_invoice(&state.db, &p.id)?)
}

pub(super) fn list(state: &AppState, payload: Value) -> PosResult<Value> {
    let filter: InvoiceFilter = parse_payload(payload)?;
    to_data(billing::list_invoices(&state.db, &filter)?)
}

pub(super) fn summary(state: &AppState) -> PosResult<Value> {
    to_data(billing::invoice_summary(&state.db)?)
}

pub(super) fn from_order(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: OrderIdPayload = parse_payload(payload)?;
    to_data(billing::invoice_from_order(&state.db, &p.id)?)
}
