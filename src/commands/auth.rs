use serde::Deserialize;
use serde_json::{json, Value};

use super::{to_data, AppState};
use crate::auth::{self, PinSetup};
use crate::data_helpers::parse_payload;
use crate::error::PosResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginPayload {
    #[serde(alias = "id", alias = "password")]
    pin: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogoutPayload {
    #[serde(default, alias = "id", alias = "session_token", alias = "sessionToken")]
    token: Option<String>,
}

/// First-time setup is open; changing configured PINs needs an admin
/// session.
pub(super) fn setup_pin(state: &AppState, payload: Value, token: Option<&str>) -> PosResult<Value> {
    let setup: PinSetup = parse_payload(payload)?;
    if auth::is_configured(&state.db)? {
        let session = auth::require_session(&state.auth, token)?;
        auth::require_permission(&session, "system_settings")?;
    }
    auth::setup_pin(&state.db, &setup)?;
    Ok(json!({ "configured": true }))
}

pub(super) fn login(state: &AppState, payload: Value) -> PosResult<Value> {
    let p: LoginPayload = parse_payload(payload)?;
    to_data(auth::login(&state.db, &state.auth, &p.pin)?)
}

/// The token comes from the request envelope or, failing that, the payload.
pub(super) fn logout(state: &AppState, payload: Value, token: Option<&str>) -> PosResult<Value> {
    let p: LogoutPayload = parse_payload(payload)?;
    let Some(token) = token.map(str::to_string).or(p.token) else {
        return Ok(json!({ "loggedOut": false }));
    };
    let logged_out = auth::logout(&state.db, &state.auth, &token)?;
    Ok(json!({ "loggedOut": logged_out }))
}

pub(super) fn validate(state: &AppState, token: Option<&str>) -> PosResult<Value> {
    to_data(auth::validate_session(&state.auth, token)?)
}

pub(super) fn status(state: &AppState, token: Option<&str>) -> PosResult<Value> {
    let configured = auth::is_configured(&state.db)?;
    let session = auth::require_session(&state.auth, token).ok();
    Ok(json!({
        "configured": configured,
        "authenticated": session.is_some(),
        "session": session,
    }))
}
