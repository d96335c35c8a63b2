use serde::Deserialize;
use serde_json::Value;

use super::{to_data, AppState};
use crate::data_helpers::parse_payload;
use crate::error::PosResult;
use crate::tables::{self, TableInput, TableStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableIdPayload {
    #[serde(alias = "tableId", alias = "table_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableUpdatePayload {
    #[serde(alias = "tableId", alias = "table_id")]
    id: String,
    #[serde(flatten)]
    input: TableInput,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListPayload {
    #[serde(default, alias = "zone")]
    area: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableStatusPayload {
    #[serde(alias = "tableId", alias = "table_id")]
    id: String,
    status: TableStatus,
}

pub(super) fn create(state: &AppState, payload: Value) -> PosResult<Value> {
    let input: TableInput = parse_payload(payload)?;
    to_data(tables::create_table(&state.db, &input)?)
}

pub(super) fn update(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: TableUpdatePayload = parse_payload(payload)?;
    to_data(tables::update_table(&state.db, &p.id, &p.input)?)
}

pub(super) fn list(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: TableListPayload = parse_payload(payload)?;
    to_data(tables::list_tables(&state.db, p.area.as_deref())?)
}

pub(super) fn set_status(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: TableStatusPayload = parse_payload(payload)?;
    to_data(tables::set_table_status(&state.db, &p.id, p.status)?)
}

pub(super) fn delete(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: TableIdPayload = parse_payload(payload)?;
    tables::delete_table(&state.db, &p.id)?;
    Ok(serde_json::json!({ "deleted": p.id }))
}
