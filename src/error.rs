//! Error type shared by every domain module.
//!
//! Domain operations return [`PosResult`]. The command bridge turns a
//! [`PosError`] into `{ "ok": false, "error": <message>, "code": <code> }`
//! so the client can react to specific failures (e.g. `session_expired`
//! sends the operator back to the PIN screen).

use thiserror::Error;

pub type PosResult<T> = Result<T, PosError>;

#[derive(Debug, Error)]
pub enum PosError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Validation(String),

    #[error("Cannot {action} a {entity} in status '{status}'")]
    InvalidTransition {
        entity: &'static str,
        action: &'static str,
        status: String,
    },

    #[error(
        "Insufficient stock for {product}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product: String,
        requested: f64,
        available: f64,
    },

    #[error("Invoice has payments, cannot cancel")]
    InvoiceHasPayments,

    #[error("Payment of {amount:.2} exceeds balance due {balance:.2}")]
    Overpayment { amount: f64, balance: f64 },

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Session expired or not found")]
    SessionExpired,

    #[error("Missing permission: {0}")]
    Unauthorized(String),

    #[error("Too many failed attempts. Try again in {minutes} minute(s).")]
    LockedOut { minutes: i64 },

    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl PosError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable machine-readable code used by the command bridge.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::InvoiceHasPayments => "invoice_has_payments",
            Self::Overpayment { .. } => "overpayment",
            Self::Conflict(_) => "conflict",
            Self::InvalidPin => "invalid_pin",
            Self::SessionExpired => "session_expired",
            Self::Unauthorized(_) => "unauthorized",
            Self::LockedOut { .. } => "locked_out",
            Self::Database(_) => "database",
            Self::Json(_) => "invalid_payload",
            Self::Internal(_) => "internal",
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PosError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("lock poisoned: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(PosError::SessionExpired.code(), "session_expired");
        assert_eq!(PosError::InvoiceHasPayments.code(), "invoice_has_payments");
        assert_eq!(
            PosError::not_found("invoice", "inv-1").to_string(),
            "invoice not found: inv-1"
        );
    }

    #[test]
    fn insufficient_stock_message_names_product() {
        let err = PosError::InsufficientStock {
            product: "Tomatoes".into(),
            requested: 5.0,
            available: 2.5,
        };
        let msg = err.to_string();
        assert!(msg.contains("Tomatoes"));
        assert!(msg.contains("2.5"));
        assert_eq!(err.code(), "insufficient_stock");
    }
}
