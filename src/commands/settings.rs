use serde_json::Value;
use tracing::info;

use super::{to_data, AppState};
use crate::config::{BillingSettings, BillingSettingsUpdate};
use crate::data_helpers::parse_payload;
use crate::error::PosResult;
use crate::seed;

pub(super) fn get_billing(state: &AppState) -> PosResult<Value> {
    let conn = state.db.conn.lock()?;
    to_data(BillingSettings::load(&conn))
}

pub(super) fn update_billing(state: &AppState, payload: Value) -> PosResult<Value> {
    let update: BillingSettingsUpdate = parse_payload(payload)?;
    let conn = state.db.conn.lock()?;
    let settings = BillingSettings::apply(&conn, &update)?;
    info!(
        currency = %settings.currency,
        prefix = %settings.invoice_prefix,
        "Billing settings updated"
    );
    to_data(settings)
}

pub(super) fn seed_demo_data(state: &AppState) -> PosResult<Value> {
    to_data(seed::seed_demo_data(&state.db)?)
}
