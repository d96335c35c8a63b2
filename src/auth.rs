//! PIN-based local authentication with bcrypt.
//!
//! Provides admin and staff login, token sessions, lockout tracking and
//! permission checks. PIN hashes are stored in `local_settings` (category
//! "staff", keys "admin_pin_hash" / "staff_pin_hash"). Sessions live in
//! memory keyed by their token; `staff_sessions` keeps an audit trail.
//! Lockout state is persisted so a restart does not reset it.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 8;
const LOCKOUT_ATTEMPTS_KEY: &str = "lockout_attempts";
const LOCKOUT_LAST_ATTEMPT_KEY: &str = "lockout_last_attempt";

#[cfg(not(test))]
const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const BCRYPT_COST: u32 = 4;

/// Permissions granted to administrators.
const ADMIN_PERMISSIONS: &[&str] = &[
    "manage_orders",
    "manage_billing",
    "refund_invoices",
    "manage_cash",
    "manage_inventory",
    "manage_catalog",
    "view_reports",
    "system_settings",
];

/// Permissions granted to regular staff.
const STAFF_PERMISSIONS: &[&str] = &["manage_orders", "manage_billing", "manage_cash"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An active staff session.
#[derive(Clone)]
struct StaffSession {
    token: String,
    staff_id: String,
    role: String,
    permissions: Vec<String>,
    login_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl StaffSession {
    /// Expired by inactivity or by maximum duration.
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
            || now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            token: self.token.clone(),
            staff_id: self.staff_id.clone(),
            role: self.role.clone(),
            permissions: self.permissions.clone(),
            login_time: self.login_time.to_rfc3339(),
            last_activity: self.last_activity.to_rfc3339(),
            expires_at: self.expires_at.to_rfc3339(),
        }
    }
}

/// Session as seen by the client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub token: String,
    pub staff_id: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub login_time: String,
    pub last_activity: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionValidity {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinSetup {
    #[serde(default, alias = "admin_pin")]
    pub admin_pin: Option<String>,
    #[serde(default, alias = "staff_pin")]
    pub staff_pin: Option<String>,
}

/// Lockout tracking entry.
struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

/// Shared authentication state.
pub struct AuthState {
    sessions: Mutex<HashMap<String, StaffSession>>,
    lockout: Mutex<LockoutEntry>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lockout: Mutex::new(LockoutEntry {
                attempts: 0,
                last_attempt: Utc::now(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fail while the terminal is locked out.
fn check_lockout(lockout: &LockoutEntry) -> PosResult<()> {
    if lockout.attempts >= MAX_FAILED_ATTEMPTS {
        let elapsed = Utc::now() - lockout.last_attempt;
        if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
            return Err(PosError::LockedOut {
                minutes: LOCKOUT_MINUTES - elapsed.num_minutes(),
            });
        }
        // Lockout period has elapsed; reset on next successful login
    }
    Ok(())
}

fn record_failure(lockout: &mut LockoutEntry) {
    lockout.attempts += 1;
    lockout.last_attempt = Utc::now();
    warn!(attempts = lockout.attempts, "failed login attempt");
}

fn reset_lockout(lockout: &mut LockoutEntry) {
    lockout.attempts = 0;
    lockout.last_attempt = Utc::now();
}

fn load_lockout_from_db(conn: &Connection) -> LockoutEntry {
    let attempts = db::get_setting(conn, "staff", LOCKOUT_ATTEMPTS_KEY)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let last_attempt = db::get_setting(conn, "staff", LOCKOUT_LAST_ATTEMPT_KEY)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    LockoutEntry {
        attempts,
        last_attempt,
    }
}

fn persist_lockout_to_db(conn: &Connection, lockout: &LockoutEntry) -> PosResult<()> {
    db::set_setting(
        conn,
        "staff",
        LOCKOUT_ATTEMPTS_KEY,
        &lockout.attempts.to_string(),
    )?;
    db::set_setting(
        conn,
        "staff",
        LOCKOUT_LAST_ATTEMPT_KEY,
        &lockout.last_attempt.to_rfc3339(),
    )
}

fn create_session(conn: &Connection, auth: &AuthState, role: &str) -> PosResult<SessionInfo> {
    let now = Utc::now();
    let permissions = if role == "admin" {
        ADMIN_PERMISSIONS
    } else {
        STAFF_PERMISSIONS
    };

    let session = StaffSession {
        token: db::new_id(),
        staff_id: format!("{role}-user"),
        role: role.to_string(),
        permissions: permissions.iter().map(|s| s.to_string()).collect(),
        login_time: now,
        last_activity: now,
        expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
    };

    conn.execute(
        "INSERT INTO staff_sessions (id, staff_id, role, login_time, is_active)
         VALUES (?1, ?2, ?3, ?4, 1)",
        params![session.token, session.staff_id, session.role, now.to_rfc3339()],
    )?;

    let info = session.info();
    auth.sessions.lock()?.insert(session.token.clone(), session);
    Ok(info)
}

fn end_session_record(conn: &Connection, token: &str) -> PosResult<()> {
    conn.execute(
        "UPDATE staff_sessions SET is_active = 0, logout_time = ?1 WHERE id = ?2",
        params![db::now_rfc3339(), token],
    )?;
    Ok(())
}

fn validate_pin(pin: &str, label: &str) -> PosResult<()> {
    if pin.len() < 4 {
        return Err(PosError::validation(format!("{label} must be at least 4 digits")));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(PosError::validation(format!("{label} must contain only digits")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------------

/// Validate, hash and store the admin and/or staff PIN.
pub fn setup_pin(db: &DbState, setup: &PinSetup) -> PosResult<()> {
    if setup.admin_pin.is_none() && setup.staff_pin.is_none() {
        return Err(PosError::validation(
            "At least one PIN (adminPin or staffPin) is required",
        ));
    }

    let conn = db.conn.lock()?;
    for (pin, label, key) in [
        (setup.admin_pin.as_deref(), "Admin PIN", "admin_pin_hash"),
        (setup.staff_pin.as_deref(), "Staff PIN", "staff_pin_hash"),
    ] {
        let Some(pin) = pin else { continue };
        validate_pin(pin, label)?;
        let hash = bcrypt::hash(pin, BCRYPT_COST)
            .map_err(|e| PosError::Internal(format!("Failed to hash {label}: {e}")))?;
        db::set_setting(&conn, "staff", key, &hash)?;
        info!(key = %key, "PIN set");
    }
    Ok(())
}

/// Whether any PIN has been configured.
pub fn is_configured(db: &DbState) -> PosResult<bool> {
    let conn = db.conn.lock()?;
    Ok(db::get_setting(&conn, "staff", "admin_pin_hash").is_some()
        || db::get_setting(&conn, "staff", "staff_pin_hash").is_some())
}

/// Verify a PIN against the stored hashes and open a session.
pub fn login(db: &DbState, auth: &AuthState, pin: &str) -> PosResult<SessionInfo> {
    let pin = pin.trim();
    if pin.is_empty() {
        return Err(PosError::validation("PIN is required"));
    }

    let conn = db.conn.lock()?;
    // Durable lockout state wins over the in-memory copy.
    {
        let mut lockout = auth.lockout.lock()?;
        *lockout = load_lockout_from_db(&conn);
        check_lockout(&lockout)?;
    }

    for role in ["admin", "staff"] {
        let Some(hash) = db::get_setting(&conn, "staff", &format!("{role}_pin_hash")) else {
            continue;
        };
        if bcrypt::verify(pin, &hash).unwrap_or(false) {
            {
                let mut lockout = auth.lockout.lock()?;
                reset_lockout(&mut lockout);
                persist_lockout_to_db(&conn, &lockout)?;
            }
            let session = create_session(&conn, auth, role)?;
            info!(role = %role, "login successful");
            return Ok(session);
        }
    }

    let mut lockout = auth.lockout.lock()?;
    record_failure(&mut lockout);
    persist_lockout_to_db(&conn, &lockout)?;
    Err(PosError::InvalidPin)
}

/// Invalidate a session. Returns whether the token was known.
pub fn logout(db: &DbState, auth: &AuthState, token: &str) -> PosResult<bool> {
    let removed = auth.sessions.lock()?.remove(token).is_some();
    if removed {
        let conn = db.conn.lock()?;
        end_session_record(&conn, token)?;
        info!(session_id = %token, "session logged out");
    }
    Ok(removed)
}

/// Check a token without refreshing its activity timer.
pub fn validate_session(auth: &AuthState, token: Option<&str>) -> PosResult<SessionValidity> {
    let mut sessions = auth.sessions.lock()?;
    let valid = match token.and_then(|t| sessions.get(t)) {
        Some(session) => !session.is_expired_at(Utc::now()),
        None => false,
    };
    if valid {
        return Ok(SessionValidity {
            valid: true,
            reason: None,
        });
    }
    if let Some(t) = token {
        sessions.remove(t);
    }
    Ok(SessionValidity {
        valid: false,
        reason: Some("Session expired or not found".into()),
    })
}

/// Resolve a token to a live session and refresh its activity timer.
pub fn require_session(auth: &AuthState, token: Option<&str>) -> PosResult<SessionInfo> {
    let token = token.ok_or(PosError::SessionExpired)?;
    let mut sessions = auth.sessions.lock()?;
    let now = Utc::now();

    let expired = match sessions.get(token) {
        None => return Err(PosError::SessionExpired),
        Some(session) => session.is_expired_at(now),
    };
    if expired {
        sessions.remove(token);
        warn!(session_id = %token, "session expired");
        return Err(PosError::SessionExpired);
    }

    let session = sessions
        .get_mut(token)
        .ok_or(PosError::SessionExpired)?;
    session.last_activity = now;
    Ok(session.info())
}

pub fn has_permission(auth: &AuthState, token: Option<&str>, permission: &str) -> bool {
    let Ok(sessions) = auth.sessions.lock() else {
        return false;
    };
    token
        .and_then(|t| sessions.get(t))
        .filter(|s| !s.is_expired_at(Utc::now()))
        .map(|s| s.permissions.iter().any(|p| p == permission))
        .unwrap_or(false)
}

/// Fail with `Unauthorized` unless the session holds `permission`.
pub fn require_permission(session: &SessionInfo, permission: &str) -> PosResult<()> {
    if session.permissions.iter().any(|p| p == permission) {
        Ok(())
    } else {
        Err(PosError::Unauthorized(permission.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lockout_attempts(db_state: &DbState) -> u32 {
        let conn = db_state.conn.lock().expect("db lock");
        db::get_setting(&conn, "staff", LOCKOUT_ATTEMPTS_KEY)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
    }

    fn with_pins(db_state: &DbState) {
        setup_pin(
            db_state,
            &PinSetup {
                admin_pin: Some("1234".into()),
                staff_pin: Some("5678".into()),
            },
        )
        .expect("setup pins");
    }

    #[test]
    fn lockout_persists_across_auth_state_restart() {
        let db_state = db::test_state();
        let auth_before_restart = AuthState::new();

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let err = login(&db_state, &auth_before_restart, "9999")
                .expect_err("invalid login should fail");
            assert_eq!(err.code(), "invalid_pin");
        }
        assert_eq!(lockout_attempts(&db_state), MAX_FAILED_ATTEMPTS);

        let auth_after_restart = AuthState::new();
        let err = login(&db_state, &auth_after_restart, "9999")
            .expect_err("lockout should remain active after restart");
        assert_eq!(err.code(), "locked_out");
        assert!(err.to_string().contains("Too many failed attempts"));
        assert_eq!(
            lockout_attempts(&db_state),
            MAX_FAILED_ATTEMPTS,
            "blocked attempt should not increment counter while lockout is active"
        );
    }

    #[test]
    fn successful_login_resets_persisted_lockout() {
        let db_state = db::test_state();
        with_pins(&db_state);
        let auth = AuthState::new();

        for _ in 0..2 {
            login(&db_state, &auth, "9999").expect_err("invalid login should fail");
        }
        assert_eq!(lockout_attempts(&db_state), 2);

        let session = login(&db_state, &AuthState::new(), "1234").expect("valid login");
        assert_eq!(session.role, "admin");
        assert_eq!(lockout_attempts(&db_state), 0);
    }

    #[test]
    fn staff_pin_gets_staff_permissions() {
        let db_state = db::test_state();
        with_pins(&db_state);
        let auth = AuthState::new();

        let session = login(&db_state, &auth, "5678").unwrap();
        assert_eq!(session.role, "staff");
        let token = Some(session.token.as_str());
        assert!(has_permission(&auth, token, "manage_orders"));
        assert!(!has_permission(&auth, token, "refund_invoices"));
        assert_eq!(
            require_permission(&session, "view_reports").unwrap_err().code(),
            "unauthorized"
        );
    }

    #[test]
    fn setup_rejects_short_or_non_numeric_pins() {
        let db_state = db::test_state();
        let err = setup_pin(
            &db_state,
            &PinSetup {
                admin_pin: Some("12".into()),
                staff_pin: None,
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation");
        let err = setup_pin(
            &db_state,
            &PinSetup {
                admin_pin: None,
                staff_pin: Some("12ab".into()),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("digits"));
        assert!(!is_configured(&db_state).unwrap());
    }

    #[test]
    fn logout_invalidates_token() {
        let db_state = db::test_state();
        with_pins(&db_state);
        let auth = AuthState::new();
        let session = login(&db_state, &auth, "1234").unwrap();

        assert!(require_session(&auth, Some(&session.token)).is_ok());
        assert!(logout(&db_state, &auth, &session.token).unwrap());
        assert_eq!(
            require_session(&auth, Some(&session.token)).unwrap_err().code(),
            "session_expired"
        );
        assert!(!validate_session(&auth, Some(&session.token)).unwrap().valid);

        let conn = db_state.conn.lock().unwrap();
        let active: i64 = conn
            .query_row(
                "SELECT is_active FROM staff_sessions WHERE id = ?1",
                params![session.token],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(active, 0);
    }

    #[test]
    fn idle_session_expires() {
        let db_state = db::test_state();
        with_pins(&db_state);
        let auth = AuthState::new();
        let session = login(&db_state, &auth, "1234").unwrap();

        {
            let mut sessions = auth.sessions.lock().unwrap();
            let s = sessions.get_mut(&session.token).unwrap();
            s.last_activity = Utc::now() - Duration::minutes(SESSION_INACTIVITY_MINUTES + 1);
        }
        let err = require_session(&auth, Some(&session.token)).unwrap_err();
        assert_eq!(err.code(), "session_expired");
        assert_eq!(require_session(&auth, None).unwrap_err().code(), "session_expired");
    }

    #[test]
    fn max_duration_expires_even_when_active() {
        let now = Utc::now();
        let session = StaffSession {
            token: "t".into(),
            staff_id: "admin-user".into(),
            role: "admin".into(),
            permissions: vec![],
            login_time: now - Duration::hours(SESSION_MAX_DURATION_HOURS),
            last_activity: now,
            expires_at: now - Duration::seconds(1),
        };
        assert!(session.is_expired_at(now));
    }
}
