use serde::Deserialize;
use serde_json::Value;

use super::{to_data, AppState};
use crate::clients::{self, ClientInput};
use crate::data_helpers::parse_payload;
use crate::error::PosResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientIdPayload {
    #[serde(alias = "clientId", alias = "client_id", alias = "customerId")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientUpdatePayload {
    #[serde(alias = "clientId", alias = "client_id")]
    id: String,
    #[serde(flatten)]
    input: ClientInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientActivePayload {
    #[serde(alias = "clientId", alias = "client_id")]
    id: String,
    #[serde(alias = "is_active", alias = "isActive")]
    active: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientSearchPayload {
    #[serde(default, alias = "q", alias = "term", alias = "search", alias = "id")]
    query: String,
    #[serde(default, alias = "include_inactive")]
    include_inactive: bool,
}

pub(super) fn create(state: &AppState, payload: Value) -> PosResult<Value> {
    let input: ClientInput = parse_payload(payload)?;
    to_data(clients::create_client(&state.db, &input)?)
}

pub(super) fn update(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ClientUpdatePayload = parse_payload(payload)?;
    to_data(clients::update_client(&state.db, &p.id, &p.input)?)
}

pub(super) fn get(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ClientIdPayload = parse_payload(payload)?;
    to_data(clients::get_client(&state.db, &p.id)?)
}

pub(super) fn set_active(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ClientActivePayload = parse_payload(payload)?;
    to_data(clients::set_client_active(&state.db, &p.id, p.active)?)
}

/// A bare string payload is taken as the search term.
pub(super) fn search(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ClientSearchPayload = parse_payload(payload)?;
    to_data(clients::search_clients(
        &state.db,
        &p.query,
        p.include_inactive,
    )?)
}

pub(super) fn statement(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ClientIdPayload = parse_payload(payload)?;
    to_data(clients::client_statement(&state.db, &p.id)?)
}
