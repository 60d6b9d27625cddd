use tracing::{error, info, warn};

/// Structured security events, emitted under the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn login_success(&self, user_id: &str, session_id: &str) {
        info!(target: "audit", event = "login_success", user_id, session_id);
    }

    pub fn login_failure(&self, username: &str, ip: &str) {
        warn!(target: "audit", event = "login_failure", username, ip);
    }

    pub fn logout(&self, session_id: &str) {
        info!(target: "audit", event = "logout", session_id);
    }

    pub fn csrf_rejected(&self, session_id: Option<&str>, method: &str, path: &str) {
        warn!(target: "audit", event = "csrf_rejected", session_id = session_id.unwrap_or(""), method, path);
    }

    pub fn rate_limited(&self, identifier: &str, profile: &str, retry_after_secs: u64) {
        warn!(target: "audit", event = "rate_limited", identifier, profile, retry_after_secs);
    }

    pub fn token_rotated(&self, sessions: usize) {
        info!(target: "audit", event = "token_rotated", sessions);
    }

    pub fn breaker_opened(&self, name: &str, failures: u32) {
        warn!(target: "audit", event = "breaker_opened", name, failures);
    }

    pub fn internal_error(&self, session_id: Option<&str>, error_msg: &str) {
        error!(target: "audit", event = "internal_error", session_id = session_id.unwrap_or(""), error = error_msg);
    }
}
