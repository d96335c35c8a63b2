use serde::Deserialize;
use serde_json::Value;

use super::{to_data, AppState};
use crate::data_helpers::parse_payload;
use crate::error::PosResult;
use crate::reports;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardPayload {
    #[serde(default, alias = "day")]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangePayload {
    #[serde(alias = "dateFrom", alias = "date_from")]
    from: String,
    #[serde(alias = "dateTo", alias = "date_to")]
    to: String,
}

pub(super) fn dashboard(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: DashboardPayload = parse_payload(payload)?;
    to_data(reports::dashboard_summary(&state.db, p.date.as_deref())?)
}

pub(super) fn sales_by_day(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: RangePayload = parse_payload(payload)?;
    to_data(reports::sales_by_day(&state.db, &p.from, &p.to)?)
}
