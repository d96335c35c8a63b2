use serde::Deserialize;
use serde_json::Value;

use super::{to_data, AppState};
use crate::auth::SessionInfo;
use crate::cash_boxes::{self, ManualMovementInput};
use crate::data_helpers::parse_payload;
use crate::error::PosResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CashBoxPayload {
    name: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CashBoxIdPayload {
    #[serde(alias = "cashBoxId", alias = "cash_box_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionPayload {
    #[serde(alias = "cash_box_id", alias = "id")]
    cash_box_id: String,
    #[serde(default, alias = "opening_amount", alias = "openingCash")]
    opening_amount: f64,
    #[serde(default, alias = "opened_by", alias = "staffId")]
    opened_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdPayload {
    #[serde(alias = "sessionId", alias = "session_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseSessionPayload {
    #[serde(alias = "sessionId", alias = "session_id")]
    id: String,
    #[serde(alias = "counted_amount", alias = "closingCash")]
    counted_amount: f64,
    #[serde(default, alias = "closed_by", alias = "staffId")]
    closed_by: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

pub(super) fn create_box(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: CashBoxPayload = parse_payload(payload)?;
    to_data(cash_boxes::create_cash_box(
        &state.db,
        &p.name,
        p.location.as_deref(),
    )?)
}

pub(super) fn list_boxes(state: &AppState) -> PosResult<Value> {
    to_data(cash_boxes::list_cash_boxes(&state.db)?)
}

pub(super) fn open_session(
    state: &AppState,
    payload: Value,
    session: &SessionInfo,
) -> PosResult<Value> {
    let p: OpenSessionPayload = parse_payload(payload)?;
    let opened_by = p.opened_by.unwrap_or_else(|| session.staff_id.clone());
    to_data(cash_boxes::open_session(
        &state.db,
        &p.cash_box_id,
        p.opening_amount,
        Some(&opened_by),
    )?)
}

pub(super) fn add_movement(
    state: &AppState,
    payload: Value,
    session: &SessionInfo,
) -> PosResult<Value> {
    let mut input: ManualMovementInput = parse_payload(payload)?;
    if input.created_by.is_none() {
        input.created_by = Some(session.staff_id.clone());
    }
    to_data(cash_boxes::add_movement(&state.db, input)?)
}

pub(super) fn summary(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: SessionIdPayload = parse_payload(payload)?;
    to_data(cash_boxes::session_summary(&state.db, &p.id)?)
}

pub(super) fn close_session(
    state: &AppState,
    payload: Value,
    session: &SessionInfo,
) -> PosResult<Value> {
    let p: CloseSessionPayload = parse_payload(payload)?;
    let closed_by = p.closed_by.unwrap_or_else(|| session.staff_id.clone());
    to_data(cash_boxes::close_session(
        &state.db,
        &p.id,
        p.counted_amount,
        Some(&closed_by),
        p.notes,
    )?)
}

pub(super) fn list_sessions(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: CashBoxIdPayload = parse_payload(payload)?;
    to_data(cash_boxes::list_sessions(&state.db, &p.id)?)
}
