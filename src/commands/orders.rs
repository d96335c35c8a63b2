use serde::Deserialize;
use serde_json::Value;

use super::{to_data, AppState};
use crate::auth::SessionInfo;
use crate::data_helpers::parse_payload;
use crate::error::PosResult;
use crate::orders::{self, AddItemInput, ItemStatus, OpenOrderInput, OrderFilter};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderIdPayload {
    #[serde(alias = "orderId", alias = "order_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemRefPayload {
    #[serde(alias = "order_id")]
    order_id: String,
    #[serde(alias = "item_id")]
    item_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemQuantityPayload {
    #[serde(flatten)]
    item: ItemRefPayload,
    quantity: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemStatusPayload {
    #[serde(flatten)]
    item: ItemRefPayload,
    status: ItemStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelPayload {
    #[serde(alias = "orderId", alias = "order_id")]
    id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferPayload {
    #[serde(alias = "orderId", alias = "order_id")]
    id: String,
    #[serde(alias = "table_id", alias = "newTableId", alias = "new_table_id")]
    table_id: String,
}

fn default_issue() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosePayload {
    #[serde(alias = "orderId", alias = "order_id")]
    id: String,
    #[serde(default = "default_issue", alias = "issueInvoice", alias = "issue_invoice")]
    issue: bool,
}

pub(super) fn open(state: &AppState, payload: Value, session: &SessionInfo) -> PosResult<Value> {
    let mut input: OpenOrderInput = parse_payload(payload)?;
    if input.staff_id.is_none() {
        input.staff_id = Some(session.staff_id.clone());
    }
    to_data(orders::open_order(&state.db, input)?)
}

pub(super) fn add_item(state: &AppState, payload: Value) -> PosResult<Value> {
    let input: AddItemInput = parse_payload(payload)?;
    to_data(orders::add_item(&state.db, input)?)
}

pub(super) fn update_item_quantity(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ItemQuantityPayload = parse_payload(payload)?;
    to_data(orders::update_item_quantity(
        &state.db,
        &p.item.order_id,
        &p.item.item_id,
        p.quantity,
    )?)
}

pub(super) fn remove_item(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ItemRefPayload = parse_payload(payload)?;
    to_data(orders::remove_item(&state.db, &p.order_id, &p.item_id)?)
}

pub(super) fn set_item_status(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ItemStatusPayload = parse_payload(payload)?;
    to_data(orders::set_item_status(
        &state.db,
        &p.item.order_id,
        &p.item.item_id,
        p.status,
    )?)
}

pub(super) fn advance_status(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: OrderIdPayload = parse_payload(payload)?;
    to_data(orders::advance_status(&state.db, &p.id)?)
}

pub(super) fn cancel(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: CancelPayload = parse_payload(payload)?;
    to_data(orders::cancel_order(&state.db, &p.id, p.reason)?)
}

pub(super) fn transfer(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: TransferPayload = parse_payload(payload)?;
    to_data(orders::transfer_order(&state.db, &p.id, &p.table_id)?)
}

pub(super) fn close(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ClosePayload = parse_payload(payload)?;
    to_data(orders::close_order(&state.db, &p.id, p.issue)?)
}

pub(super) fn get(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: OrderIdPayload = parse_payload(payload)?;
    to_data(orders::get_order(&state.db, &p.id)?)
}

pub(super) fn list(state: &AppState, payload: Value) -> PosResult<Value> {
    let filter: OrderFilter = parse_payload(payload)?;
    to_data(orders::list_orders(&state.db, &filter)?)
}
