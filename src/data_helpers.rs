use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{PosError, PosResult};

/// Parse a command payload into a typed struct.
///
/// A bare string payload is accepted as `{ "id": <string> }` so lookups
/// can be invoked with just an id.
pub(crate) fn parse_payload<T: DeserializeOwned>(payload: Value) -> PosResult<T> {
    let payload = match payload {
        Value::String(id) => serde_json::json!({ "id": id }),
        Value::Null => serde_json::json!({}),
        other => other,
    };
    serde_json::from_value(payload)
        .map_err(|e| PosError::validation(format!("Invalid payload: {e}")))
}

/// Digits only, so phone searches ignore formatting.
pub(crate) fn normalize_phone(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
}

/// Trim an optional string, mapping blank input to `None`.
pub(crate) fn clean_opt(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Trim a required string, failing with `msg` when blank.
pub(crate) fn require_text(value: &str, msg: &str) -> PosResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PosError::validation(msg));
    }
    Ok(trimmed.to_string())
}

/// SQL `LIKE` pattern for a free-text search term.
pub(crate) fn like_pattern(term: &str) -> String {
    let escaped = term
        .trim()
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}
