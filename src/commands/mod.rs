//! JSON command bridge.
//!
//! Every client request names a snake_case command (`invoice_create`,
//! `cash_session_close`, ...) and carries a camelCase JSON payload. The
//! per-area submodules parse the payload into typed structs and call the
//! domain operations; [`dispatch`] applies the session and permission gate
//! first. [`handle_line`] wraps one request/response pair of the
//! line-delimited protocol used by `run()`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::{self as auth_ops, AuthState};
use crate::config::AppConfig;
use crate::db::DbState;
use crate::error::{PosError, PosResult};

mod auth;
mod billing;
mod cash;
mod clients;
mod inventory;
mod orders;
mod reports;
mod settings;
mod tables;

/// Everything a command handler can reach.
pub struct AppState {
    pub db: DbState,
    pub auth: AuthState,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(db: DbState, config: AppConfig) -> Self {
        Self {
            db,
            auth: AuthState::new(),
            config,
        }
    }
}

fn to_data<T: Serialize>(value: T) -> PosResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Commands that run without a session.
fn is_public(command: &str) -> bool {
    command.starts_with("auth_") || command == "app_about" || command == "app_health"
}

/// Permission a command needs on top of a live session, if any.
fn required_permission(command: &str) -> Option<&'static str> {
    let permission = match command {
        "invoice_refund" => "refund_invoices",
        c if c.starts_with("invoice_") => "manage_billing",
        "client_create" | "client_update" | "client_set_active" => "manage_billing",
        "inventory_create_product"
        | "inventory_update_product"
        | "inventory_set_product_active"
        | "inventory_create_warehouse" => "manage_catalog",
        "inventory_record_movement" | "inventory_consume_order" => "manage_inventory",
        "cash_box_create" => "system_settings",
        c if c.starts_with("cash_") => "manage_cash",
        "table_create" | "table_update" | "table_delete" => "system_settings",
        c if c.starts_with("order_") || c.starts_with("table_") => "manage_orders",
        c if c.starts_with("report_") => "view_reports",
        "settings_update_billing" | "seed_demo_data" => "system_settings",
        _ => return None,
    };
    Some(permission)
}

/// Run one command and return its result data.
pub fn dispatch(
    state: &AppState,
    command: &str,
    payload: Value,
    token: Option<&str>,
) -> PosResult<Value> {
    if is_public(command) {
        return dispatch_public(state, command, payload, token);
    }

    let session = auth_ops::require_session(&state.auth, token)?;
    if let Some(permission) = required_permission(command) {
        auth_ops::require_permission(&session, permission)?;
    }
    debug!(command = %command, staff_id = %session.staff_id, "dispatching command");

    match command {
        // Billing
        "invoice_create" => billing::create(state, payload),
        "invoice_replace_lines" => billing::replace_lines(state, payload),
        "invoice_issue" => billing::issue(state, payload),
        "invoice_record_payment" => billing::record_payment(state, payload, &session),
        "invoice_cancel" => billing::cancel(state, payload),
        "invoice_refund" => billing::refund(state, payload, &session),
        "invoice_get" => billing::get(state, payload),
        "invoice_list" => billing::list(state, payload),
        "invoice_summary" => billing::summary(state),
        "invoice_from_order" => billing::from_order(state, payload),

        // Inventory
        "inventory_create_product" => inventory::create_product(state, payload),
        "inventory_update_product" => inventory::update_product(state, payload),
        "inventory_set_product_active" => inventory::set_product_active(state, payload),
        "inventory_get_product" => inventory::get_product(state, payload),
        "inventory_list_products" => inventory::list_products(state, payload),
        "inventory_create_warehouse" => inventory::create_warehouse(state, payload),
        "inventory_list_warehouses" => inventory::list_warehouses(state),
        "inventory_default_warehouse" => inventory::default_warehouse(state),
        "inventory_record_movement" => inventory::record_movement(state, payload, &session),
        "inventory_list_movements" => inventory::list_movements(state, payload),
        "inventory_stock_levels" => inventory::stock_levels(state, payload),
        "inventory_low_stock" => inventory::low_stock(state),
        "inventory_consume_order" => inventory::consume_order(state, payload),

        // Cash boxes
        "cash_box_create" => cash::create_box(state, payload),
        "cash_box_list" => cash::list_boxes(state),
        "cash_session_open" => cash::open_session(state, payload, &session),
        "cash_session_add_movement" => cash::add_movement(state, payload, &session),
        "cash_session_summary" => cash::summary(state, payload),
        "cash_session_close" => cash::close_session(state, payload, &session),
        "cash_session_list" => cash::list_sessions(state, payload),

        // Tables
        "table_create" => tables::create(state, payload),
        "table_update" => tables::update(state, payload),
        "table_list" => tables::list(state, payload),
        "table_set_status" => tables::set_status(state, payload),
        "table_delete" => tables::delete(state, payload),

        // Orders
        "order_open" => orders::open(state, payload, &session),
        "order_add_item" => orders::add_item(state, payload),
        "order_update_item_quantity" => orders::update_item_quantity(state, payload),
        "order_remove_item" => orders::remove_item(state, payload),
        "order_set_item_status" => orders::set_item_status(state, payload),
        "order_advance_status" => orders::advance_status(state, payload),
        "order_cancel" => orders::cancel(state, payload),
        "order_transfer" => orders::transfer(state, payload),
        "order_close" => orders::close(state, payload),
        "order_get" => orders::get(state, payload),
        "order_list" => orders::list(state, payload),

        // Clients
        "client_create" => clients::create(state, payload),
        "client_update" => clients::update(state, payload),
        "client_get" => clients::get(state, payload),
        "client_set_active" => clients::set_active(state, payload),
        "client_search" => clients::search(state, payload),
        "client_statement" => clients::statement(state, payload),

        // Reports
        "report_dashboard" => reports::dashboard(state, payload),
        "report_sales_by_day" => reports::sales_by_day(state, payload),

        // Settings
        "settings_get_billing" => settings::get_billing(state),
        "settings_update_billing" => settings::update_billing(state, payload),
        "seed_demo_data" => settings::seed_demo_data(state),

        _ => Err(PosError::not_found("command", command)),
    }
}

fn dispatch_public(
    state: &AppState,
    command: &str,
    payload: Value,
    token: Option<&str>,
) -> PosResult<Value> {
    match command {
        "auth_setup_pin" => auth::setup_pin(state, payload, token),
        "auth_login" => auth::login(state, payload),
        "auth_logout" => auth::logout(state, payload, token),
        "auth_validate" => auth::validate(state, token),
        "auth_status" => auth::status(state, token),
        "app_about" => Ok(crate::diagnostics::get_about_info()),
        "app_health" => to_data(crate::diagnostics::get_system_health(
            &state.db,
            &state.config.log_dir,
        )?),
        _ => Err(PosError::not_found("command", command)),
    }
}

// ---------------------------------------------------------------------------
// Line protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    id: Value,
    command: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    token: Option<String>,
}

fn error_response(id: Value, err: &PosError) -> Value {
    json!({
        "id": id,
        "ok": false,
        "error": err.to_string(),
        "code": err.code(),
    })
}

/// Handle one request line and return the response line (without newline).
pub fn handle_line(state: &AppState, line: &str) -> String {
    let request: CommandRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected malformed request: {e}");
            return error_response(Value::Null, &PosError::from(e)).to_string();
        }
    };

    let response = match dispatch(
        state,
        &request.command,
        request.payload,
        request.token.as_deref(),
    ) {
        Ok(data) => json!({ "id": request.id, "ok": true, "data": data }),
        Err(err) => {
            warn!(command = %request.command, code = err.code(), "Command failed: {err}");
            error_response(request.id, &err)
        }
    };
    response.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::path::PathBuf;

    fn test_app() -> AppState {
        let dir = std::env::temp_dir().join(format!("mesa_cmd_{}", uuid::Uuid::new_v4()));
        AppState::new(
            db::test_state(),
            AppConfig {
                data_dir: dir.clone(),
                log_dir: PathBuf::from(&dir).join("logs"),
                log_filter: "info".into(),
                seed_demo_data: false,
            },
        )
    }

    fn login(app: &AppState, admin: &str, staff: &str, pin: &str) -> String {
        dispatch(
            app,
            "auth_setup_pin",
            json!({ "adminPin": admin, "staffPin": staff }),
            None,
        )
        .unwrap();
        let session = dispatch(app, "auth_login", json!({ "pin": pin }), None).unwrap();
        session["token"].as_str().unwrap().to_string()
    }

    #[test]
    fn commands_require_a_session() {
        let app = test_app();
        let err = dispatch(&app, "invoice_list", json!({}), None).unwrap_err();
        assert_eq!(err.code(), "session_expired");

        let err = dispatch(&app, "invoice_list", json!({}), Some("bogus")).unwrap_err();
        assert_eq!(err.code(), "session_expired");

        let about = dispatch(&app, "app_about", Value::Null, None).unwrap();
        assert!(about.get("version").is_some());
    }

    #[test]
    fn staff_cannot_open_reports() {
        let app = test_app();
        let token = login(&app, "9999", "1234", "1234");

        let err = dispatch(&app, "report_dashboard", json!({}), Some(&token)).unwrap_err();
        assert_eq!(err.code(), "unauthorized");

        let tables = dispatch(&app, "table_list", json!({}), Some(&token)).unwrap();
        assert!(tables.as_array().unwrap().is_empty());
    }

    #[test]
    fn setup_pin_again_needs_admin() {
        let app = test_app();
        let staff = login(&app, "9999", "1234", "1234");

        let err = dispatch(&app, "auth_setup_pin", json!({ "staffPin": "5555" }), None)
            .unwrap_err();
        assert_eq!(err.code(), "session_expired");
        let err = dispatch(
            &app,
            "auth_setup_pin",
            json!({ "staffPin": "5555" }),
            Some(&staff),
        )
        .unwrap_err();
        assert_eq!(err.code(), "unauthorized");

        let admin = dispatch(&app, "auth_login", json!({ "pin": "9999" }), None).unwrap();
        let admin = admin["token"].as_str().unwrap();
        dispatch(&app, "auth_setup_pin", json!({ "staffPin": "5555" }), Some(admin)).unwrap();
    }

    #[test]
    fn dine_in_order_to_paid_invoice() {
        let app = test_app();
        let token = login(&app, "9999", "1234", "9999");
        let t = Some(token.as_str());

        let table = dispatch(&app, "table_create", json!({ "number": "12", "capacity": 4 }), t)
            .unwrap();
        let order = dispatch(
            &app,
            "order_open",
            json!({ "orderType": "dine_in", "tableId": table["id"] }),
            t,
        )
        .unwrap();
        assert_eq!(order["staffId"], "admin-user");
        let order_id = order["id"].as_str().unwrap().to_string();

        dispatch(
            &app,
            "order_add_item",
            json!({ "orderId": order_id, "name": "Menu del dia", "quantity": 2, "unitPrice": 12.5, "taxRate": 0 }),
            t,
        )
        .unwrap();
        for _ in 0..3 {
            dispatch(&app, "order_advance_status", json!(order_id), t).unwrap();
        }

        let closed = dispatch(&app, "order_close", json!({ "id": order_id }), t).unwrap();
        assert_eq!(closed["order"]["status"], "closed");
        assert_eq!(closed["invoice"]["status"], "issued");
        let invoice_id = closed["invoice"]["id"].as_str().unwrap().to_string();

        let paid = dispatch(
            &app,
            "invoice_record_payment",
            json!({ "invoiceId": invoice_id, "method": "card", "amount": 25.0 }),
            t,
        )
        .unwrap();
        assert_eq!(paid["status"], "paid");
        assert_eq!(paid["balanceDue"], 0.0);
        assert_eq!(paid["payments"][0]["receivedBy"], "admin-user");

        let table = dispatch(&app, "table_list", json!({}), t).unwrap();
        assert_eq!(table[0]["status"], "available");
    }

    #[test]
    fn unknown_command_is_not_found() {
        let app = test_app();
        let token = login(&app, "9999", "1234", "9999");
        let err = dispatch(&app, "printer_test", json!({}), Some(&token)).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn handle_line_wraps_results() {
        let app = test_app();

        let out: Value = serde_json::from_str(&handle_line(
            &app,
            r#"{"id": 7, "command": "app_about"}"#,
        ))
        .unwrap();
        assert_eq!(out["id"], 7);
        assert_eq!(out["ok"], true);
        assert!(out["data"]["version"].is_string());

        let out: Value = serde_json::from_str(&handle_line(
            &app,
            r#"{"id": "a", "command": "invoice_get", "payload": "inv-1"}"#,
        ))
        .unwrap();
        assert_eq!(out["id"], "a");
        assert_eq!(out["ok"], false);
        assert_eq!(out["code"], "session_expired");

        let out: Value = serde_json::from_str(&handle_line(&app, "{not json")).unwrap();
        assert_eq!(out["ok"], false);
        assert_eq!(out["code"], "invalid_payload");
        assert!(out["id"].is_null());
    }
}
