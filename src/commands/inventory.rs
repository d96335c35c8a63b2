use serde::Deserialize;
use serde_json::Value;

use super::{to_data, AppState};
use crate::auth::SessionInfo;
use crate::data_helpers::parse_payload;
use crate::error::PosResult;
use crate::inventory::{self, MovementFilter, MovementInput, ProductFilter, ProductInput};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductIdPayload {
    #[serde(alias = "productId", alias = "product_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductUpdatePayload {
    #[serde(alias = "productId", alias = "product_id")]
    id: String,
    #[serde(flatten)]
    input: ProductInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductActivePayload {
    #[serde(alias = "productId", alias = "product_id")]
    id: String,
    #[serde(alias = "is_active", alias = "isActive")]
    active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WarehousePayload {
    name: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default, alias = "is_default")]
    is_default: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StockPayload {
    #[serde(default, alias = "product_id", alias = "id")]
    product_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumePayload {
    #[serde(alias = "orderId", alias = "order_id")]
    id: String,
    #[serde(default, alias = "warehouse_id")]
    warehouse_id: Option<String>,
}

pub(super) fn create_product(state: &AppState, payload: Value) -> PosResult<Value> {
    let input: ProductInput = parse_payload(payload)?;
    to_data(inventory::create_product(&state.db, &input)?)
}

pub(super) fn update_product(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ProductUpdatePayload = parse_payload(payload)?;
    to_data(inventory::update_product(&state.db, &p.id, &p.input)?)
}

pub(super) fn set_product_active(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ProductActivePayload = parse_payload(payload)?;
    to_data(inventory::set_product_active(&state.db, &p.id, p.active)?)
}

pub(super) fn get_product(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ProductIdPayload = parse_payload(payload)?;
    to_data(inventory::get_product(&state.db, &p.id)?)
}

pub(super) fn list_products(state: &AppState, payload: Value) -> PosResult<Value> {
    let filter: ProductFilter = parse_payload(payload)?;
    to_data(inventory::list_products(&state.db, &filter)?)
}

pub(super) fn create_warehouse(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: WarehousePayload = parse_payload(payload)?;
    to_data(inventory::create_warehouse(
        &state.db,
        &p.name,
        p.location.as_deref(),
        p.is_default,
    )?)
}

pub(super) fn list_warehouses(state: &AppState) -> PosResult<Value> {
    to_data(inventory::list_warehouses(&state.db)?)
}

pub(super) fn default_warehouse(state: &AppState) -> PosResult<Value> {
    to_data(inventory::default_warehouse(&state.db)?)
}

pub(super) fn record_movement(
    state: &AppState,
    payload: Value,
    session: &SessionInfo,
) -> PosResult<Value> {
    let mut input: MovementInput = parse_payload(payload)?;
    if input.staff_id.is_none() {
        input.staff_id = Some(session.staff_id.clone());
    }
    to_data(inventory::record_movement(&state.db, &input)?)
}

pub(super) fn list_movements(state: &AppState, payload: Value) -> PosResult<Value> {
    let filter: MovementFilter = parse_payload(payload)?;
    to_data(inventory::list_movements(&state.db, &filter)?)
}

pub(super) fn stock_levels(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: StockPayload = parse_payload(payload)?;
    to_data(inventory::stock_levels(&state.db, p.product_id.as_deref())?)
}

pub(super) fn low_stock(state: &AppState) -> PosResult<Value> {
    to_data(inventory::low_stock_alerts(&state.db)?)
}

pub(super) fn consume_order(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: ConsumePayload = parse_payload(payload)?;
    to_data(inventory::consume_order_items(
        &state.db,
        &p.id,
        p.warehouse_id.as_deref(),
    )?)
}
