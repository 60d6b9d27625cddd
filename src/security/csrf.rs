//! Per-session anti-forgery tokens.
//!
//! Every session owns one current token and, right after a rotation, the
//! previous token until its grace deadline. Unsafe requests must present a
//! token that matches one of them; the comparison is constant time.

use axum::http::Method;
use base64::{engine::general_purpose, Engine};
use hmac::digest::generic_array::GenericArray;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::form_urlencoded;

use crate::config::CsrfConfig;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_BYTES: usize = 32;
// SHA-256 block size, so the key is used as-is
const SECRET_BYTES: usize = 64;

/// Returns a fresh base64url token from the OS RNG.
pub fn generate_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).unwrap_u8() == 1
}

#[derive(Debug, Clone)]
pub struct CsrfToken {
    pub value: String,
    pub session_id: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl CsrfToken {
    fn new(session_id: &str, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value: generate_token(),
            session_id: session_id.to_string(),
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn expires_in(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Token as handed to clients by the issuance endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in_secs: u64,
}

impl From<&CsrfToken> for IssuedToken {
    fn from(t: &CsrfToken) -> Self {
        Self {
            token: t.value.clone(),
            expires_in_secs: t.expires_in().as_secs(),
        }
    }
}

#[derive(Debug)]
struct SessionTokens {
    current: CsrfToken,
    // previous value and the instant its grace period ends
    previous: Option<(String, Instant)>,
}

/// The parts of a request CSRF validation looks at.
#[derive(Debug, Clone)]
pub struct CsrfRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub session_id: Option<&'a str>,
    /// Token from the header, form field or JSON body, in that order
    pub token: Option<&'a str>,
    pub cookie_token: Option<&'a str>,
    pub meta_cookie: Option<&'a str>,
}

pub fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Issues, validates and rotates CSRF tokens.
#[derive(Debug, Clone)]
pub struct CsrfManager {
    config: Arc<CsrfConfig>,
    secret: Arc<[u8; SECRET_BYTES]>,
    sessions: Arc<RwLock<HashMap<String, SessionTokens>>>,
}

impl CsrfManager {
    pub fn new(config: CsrfConfig) -> Self {
        let mut secret = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut secret);
        Self {
            config: Arc::new(config),
            secret: Arc::new(secret),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// HMAC of `token` carried by the HTTP-only meta cookie.
    pub fn meta_for(&self, token: &str) -> String {
        let mut mac = <HmacSha256 as KeyInit>::new(GenericArray::from_slice(self.secret.as_slice()));
        mac.update(token.as_bytes());
        general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Creates (or replaces) the session's token.
    pub async fn issue(&self, session_id: &str) -> CsrfToken {
        let token = CsrfToken::new(session_id, self.config.token_ttl());
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.to_string(),
            SessionTokens {
                current: token.clone(),
                previous: None,
            },
        );
        debug!(session_id, "issued csrf token");
        token
    }

    /// Current token for the session, issuing one if missing or expired.
    pub async fn token_for(&self, session_id: &str) -> CsrfToken {
        {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(session_id) {
                if !entry.current.is_expired() {
                    return entry.current.clone();
                }
            }
        }
        self.issue(session_id).await
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config
            .exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub async fn validate(&self, req: &CsrfRequest<'_>) -> bool {
        if is_safe_method(req.method) || self.is_exempt(req.path) {
            return true;
        }
        let (Some(session_id), Some(token)) = (req.session_id, req.token) else {
            trace!(path = req.path, "csrf: missing session or token");
            return false;
        };
        match req.cookie_token {
            Some(cookie) if ct_eq(cookie, token) => {}
            _ => {
                trace!(path = req.path, "csrf: cookie missing or mismatched");
                return false;
            }
        }
        if self.config.hardened {
            let expected = self.meta_for(token);
            match req.meta_cookie {
                Some(meta) if ct_eq(meta, &expected) => {}
                _ => {
                    trace!(path = req.path, "csrf: meta cookie mismatch");
                    return false;
                }
            }
        }

        let now = Instant::now();
        let sessions = self.sessions.read().await;
        let Some(entry) = sessions.get(session_id) else {
            return false;
        };
        let current_ok = !entry.current.is_expired() && ct_eq(&entry.current.value, token);
        let previous_ok = match &entry.previous {
            Some((value, deadline)) => now < *deadline && ct_eq(value, token),
            None => false,
        };
        current_ok | previous_ok
    }

    /// Rotates one session, keeping the old token valid for the grace period.
    pub async fn rotate_session(&self, session_id: &str) -> Option<CsrfToken> {
        let now = Instant::now();
        let grace = self.config.grace_period();
        let ttl = self.config.token_ttl();
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(session_id)?;
        let fresh = CsrfToken::new(session_id, ttl);
        let old = std::mem::replace(&mut entry.current, fresh.clone());
        entry.previous = (!old.is_expired()).then(|| (old.value, now + grace));
        Some(fresh)
    }

    /// Rotates every active session. Returns how many were rotated.
    pub async fn rotate(&self) -> usize {
        self.purge_expired().await;
        let now = Instant::now();
        let grace = self.config.grace_period();
        let ttl = self.config.token_ttl();
        let mut sessions = self.sessions.write().await;
        for (session_id, entry) in sessions.iter_mut() {
            let fresh = CsrfToken::new(session_id, ttl);
            let old = std::mem::replace(&mut entry.current, fresh);
            entry.previous = (!old.is_expired()).then(|| (old.value, now + grace));
        }
        sessions.len()
    }

    /// Drops expired tokens and elapsed grace tokens.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| {
            if matches!(entry.previous, Some((_, deadline)) if now >= deadline) {
                entry.previous = None;
            }
            !entry.current.is_expired() || entry.previous.is_some()
        });
        before - sessions.len()
    }

    /// Destroys the session's tokens (logout).
    pub async fn revoke(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Pulls a token out of a request body, by content type.
///
/// Form bodies use `form_field`; JSON bodies accept `csrfToken` or the
/// form field name.
pub fn token_from_body(content_type: Option<&str>, body: &[u8], form_field: &str) -> Option<String> {
    let content_type = content_type.unwrap_or("");
    if content_type.starts_with("application/x-www-form-urlencoded") {
        return form_urlencoded::parse(body)
            .find(|(k, _)| k == form_field)
            .map(|(_, v)| v.into_owned());
    }
    if content_type.starts_with("application/json") {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        return value
            .get("csrfToken")
            .or_else(|| value.get(form_field))
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(hardened: bool) -> CsrfManager {
        CsrfManager::new(CsrfConfig {
            hardened,
            grace_period_secs: 300,
            token_ttl_secs: 3600,
            ..CsrfConfig::default()
        })
    }

    fn post<'a>(session: Option<&'a str>, token: Option<&'a str>) -> CsrfRequest<'a> {
        CsrfRequest {
            method: &Method::POST,
            path: "/api/translate",
            session_id: session,
            token,
            cookie_token: token,
            meta_cookie: None,
        }
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
    }

    #[tokio::test]
    async fn test_safe_methods_always_pass() {
        let csrf = manager(true);
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            let req = CsrfRequest {
                method: &method,
                path: "/api/jobs",
                session_id: None,
                token: None,
                cookie_token: None,
                meta_cookie: None,
            };
            assert!(csrf.validate(&req).await);
        }
    }

    #[tokio::test]
    async fn test_exempt_path_passes() {
        let csrf = manager(true);
        let req = CsrfRequest {
            path: "/api/webhooks/stripe",
            ..post(None, None)
        };
        assert!(csrf.validate(&req).await);
    }

    #[tokio::test]
    async fn test_fresh_token_validates() {
        let csrf = manager(false);
        let token = csrf.issue("s1").await;
        assert!(csrf.validate(&post(Some("s1"), Some(&token.value))).await);
    }

    #[tokio::test]
    async fn test_missing_or_wrong_token_rejected() {
        let csrf = manager(false);
        let token = csrf.issue("s1").await;
        assert!(!csrf.validate(&post(Some("s1"), None)).await);
        assert!(!csrf.validate(&post(None, Some(&token.value))).await);
        assert!(!csrf.validate(&post(Some("s1"), Some("forged"))).await);
        // token bound to another session
        let other = csrf.issue("s2").await;
        assert!(!csrf.validate(&post(Some("s1"), Some(&other.value))).await);
    }

    #[tokio::test]
    async fn test_cookie_must_match_presented_token() {
        let csrf = manager(false);
        let token = csrf.issue("s1").await;
        let req = CsrfRequest {
            cookie_token: Some("something-else"),
            ..post(Some("s1"), Some(&token.value))
        };
        assert!(!csrf.validate(&req).await);
    }

    #[tokio::test]
    async fn test_missing_token_cookie_rejected() {
        let csrf = manager(false);
        let token = csrf.issue("s1").await;
        let req = CsrfRequest {
            cookie_token: None,
            ..post(Some("s1"), Some(&token.value))
        };
        assert!(!csrf.validate(&req).await);
    }

    #[test]
    fn test_meta_is_stable_per_token() {
        let csrf = manager(true);
        let token = generate_token();
        assert_eq!(csrf.meta_for(&token), csrf.meta_for(&token));
        assert_ne!(csrf.meta_for(&token), csrf.meta_for(&generate_token()));
    }

    #[tokio::test]
    async fn test_hardened_requires_meta_cookie() {
        let csrf = manager(true);
        let token = csrf.issue("s1").await;
        assert!(!csrf.validate(&post(Some("s1"), Some(&token.value))).await);

        let meta = csrf.meta_for(&token.value);
        let req = CsrfRequest {
            meta_cookie: Some(&meta),
            ..post(Some("s1"), Some(&token.value))
        };
        assert!(csrf.validate(&req).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_rejected() {
        let csrf = manager(false);
        let token = csrf.issue("s1").await;
        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(!csrf.validate(&post(Some("s1"), Some(&token.value))).await);
        assert_eq!(csrf.purge_expired().await, 1);
        assert_eq!(csrf.active_sessions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_grace_period() {
        let csrf = manager(false);
        let old = csrf.issue("s1").await;
        assert_eq!(csrf.rotate().await, 1);
        let new = csrf.token_for("s1").await;
        assert_ne!(old.value, new.value);

        assert!(csrf.validate(&post(Some("s1"), Some(&old.value))).await);
        assert!(csrf.validate(&post(Some("s1"), Some(&new.value))).await);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!csrf.validate(&post(Some("s1"), Some(&old.value))).await);
        assert!(csrf.validate(&post(Some("s1"), Some(&new.value))).await);
    }

    #[tokio::test]
    async fn test_rotate_session_and_revoke() {
        let csrf = manager(false);
        assert!(csrf.rotate_session("missing").await.is_none());
        let old = csrf.issue("s1").await;
        let new = csrf.rotate_session("s1").await.unwrap();
        assert!(csrf.validate(&post(Some("s1"), Some(&old.value))).await);
        assert!(csrf.validate(&post(Some("s1"), Some(&new.value))).await);

        csrf.revoke("s1").await;
        assert!(!csrf.validate(&post(Some("s1"), Some(&new.value))).await);
    }

    #[tokio::test]
    async fn test_token_for_reuses_current() {
        let csrf = manager(false);
        let a = csrf.token_for("s1").await;
        let b = csrf.token_for("s1").await;
        assert_eq!(a.value, b.value);
    }

    #[test]
    fn test_token_from_body() {
        let form = b"name=deck&csrf_token=abc123";
        assert_eq!(
            token_from_body(Some("application/x-www-form-urlencoded"), form, "csrf_token"),
            Some("abc123".to_string())
        );
        let json = br#"{"csrfToken":"xyz","texts":[]}"#;
        assert_eq!(
            token_from_body(Some("application/json"), json, "csrf_token"),
            Some("xyz".to_string())
        );
        let json = br#"{"csrf_token":"snake"}"#;
        assert_eq!(
            token_from_body(Some("application/json; charset=utf-8"), json, "csrf_token"),
            Some("snake".to_string())
        );
        assert_eq!(token_from_body(Some("text/plain"), b"csrf_token=a", "csrf_token"), None);
        assert_eq!(token_from_body(None, b"", "csrf_token"), None);
    }
}
