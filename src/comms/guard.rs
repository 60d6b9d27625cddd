//! Request guards: per-route rate limiting and CSRF validation.
//!
//! Both run as axum middleware in front of the handlers, rate limiting
//! first, so a flood of forged requests is throttled before any token work.

use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use tracing::debug;

use super::local_api::SharedState;
use crate::error::ApiError;
use crate::security::auth::AuthUser;
use crate::security::csrf::{is_safe_method, token_from_body, CsrfRequest, CsrfToken};
use crate::security::rate_limit::identifier;

// Bodies larger than this are never scanned for a token
const MAX_TOKEN_BODY: usize = 64 * 1024;

/// Value of cookie `name` from the request's Cookie headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy)]
pub struct CookieOpts {
    pub http_only: bool,
    pub secure: bool,
    pub max_age: Option<u64>,
}

pub fn append_cookie(
    headers: &mut HeaderMap,
    name: &str,
    value: &str,
    opts: CookieOpts,
) -> Result<(), ApiError> {
    let mut cookie = format!("{name}={value}; Path=/; SameSite=Strict");
    if let Some(age) = opts.max_age {
        cookie.push_str(&format!("; Max-Age={age}"));
    }
    if opts.http_only {
        cookie.push_str("; HttpOnly");
    }
    if opts.secure {
        cookie.push_str("; Secure");
    }
    let value = HeaderValue::from_str(&cookie).map_err(anyhow::Error::from)?;
    headers.append(SET_COOKIE, value);
    Ok(())
}

/// Sets the readable token cookie and, for hardened mode, its HTTP-only
/// HMAC companion.
pub fn append_csrf_cookies(
    headers: &mut HeaderMap,
    state: &SharedState,
    token: &CsrfToken,
) -> Result<(), ApiError> {
    let cfg = state.csrf.config();
    let max_age = Some(token.expires_in().as_secs());
    append_cookie(
        headers,
        &cfg.cookie_name,
        &token.value,
        CookieOpts { http_only: false, secure: cfg.secure_cookies, max_age },
    )?;
    append_cookie(
        headers,
        &cfg.meta_cookie_name,
        &state.csrf.meta_for(&token.value),
        CookieOpts { http_only: true, secure: cfg.secure_cookies, max_age },
    )
}

// Extract client IP from ConnectInfo, proxy headers, or fall back to loopback
fn client_ip_from(parts_ext: &axum::http::Extensions, headers: &HeaderMap) -> String {
    if let Some(ConnectInfo(addr)) = parts_ext.get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("127.0.0.1")
        .to_string()
}

#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(client_ip_from(&parts.extensions, &parts.headers)))
    }
}

/// Logged-in user of the request's session; rejects with 401 otherwise.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub AuthUser);

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let sid = cookie_value(&parts.headers, &state.config.auth.session_cookie)
            .ok_or(ApiError::Unauthorized)?;
        state
            .sessions
            .user(sid)
            .await
            .map(CurrentUser)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Sliding-window limit for one named profile, keyed by user, then session,
/// then client IP.
pub async fn rate_limit(
    State((state, profile)): State<(SharedState, &'static str)>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let sid = cookie_value(req.headers(), &state.config.auth.session_cookie).map(str::to_owned);
    // unknown session ids fall through to the IP so they can't mint fresh buckets
    let session = match &sid {
        Some(s) => state.sessions.get_session(s).await,
        None => None,
    };
    let user_id = session.as_ref().and_then(|s| s.user.as_ref()).map(|u| u.id.clone());
    let known_sid = session.as_ref().and(sid.as_deref());
    let ip = client_ip_from(req.extensions(), req.headers());
    let key = identifier(user_id.as_deref(), known_sid, &ip);

    let decision = state.limiters.profile(profile).allow(&key).await;
    if !decision.allowed {
        state
            .audit
            .rate_limited(&key, profile, decision.retry_after_secs());
        return Err(ApiError::RateLimited(decision));
    }

    let mut resp = next.run(req).await;
    decision.write_headers(resp.headers_mut());
    Ok(resp)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .filter(|v| !v.is_empty())
}

/// Rejects state-changing requests without a valid, session-bound token.
pub async fn csrf_protect(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    if is_safe_method(&method) || state.csrf.is_exempt(&path) {
        return Ok(next.run(req).await);
    }

    let cfg = state.csrf.config();
    let headers = req.headers();
    let session_id = cookie_value(headers, &state.config.auth.session_cookie).map(str::to_owned);
    let cookie_token = cookie_value(headers, &cfg.cookie_name).map(str::to_owned);
    let meta_cookie = cookie_value(headers, &cfg.meta_cookie_name).map(str::to_owned);
    let header_token = header_str(headers, &cfg.header_name);
    let content_type = header_str(headers, CONTENT_TYPE.as_str());

    let scan_body = header_token.is_none()
        && content_type.as_deref().is_some_and(|ct| {
            ct.starts_with("application/x-www-form-urlencoded") || ct.starts_with("application/json")
        });
    let (req, token) = if scan_body {
        let (parts, body) = req.into_parts();
        let bytes = to_bytes(body, MAX_TOKEN_BODY)
            .await
            .map_err(|_| ApiError::BadRequest("request body too large".to_string()))?;
        let token = token_from_body(content_type.as_deref(), &bytes, &cfg.form_field);
        (Request::from_parts(parts, Body::from(bytes)), token)
    } else {
        (req, header_token)
    };

    let valid = state
        .csrf
        .validate(&CsrfRequest {
            method: &method,
            path: &path,
            session_id: session_id.as_deref(),
            token: token.as_deref(),
            cookie_token: cookie_token.as_deref(),
            meta_cookie: meta_cookie.as_deref(),
        })
        .await;
    if !valid {
        state
            .audit
            .csrf_rejected(session_id.as_deref(), method.as_str(), &path);
        return Err(ApiError::Csrf);
    }
    debug!(path = %path, "csrf token accepted");
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("a=1; csrf_token=abc ; empty="));
        headers.append(COOKIE, HeaderValue::from_static("slidegate_session=s-1"));
        assert_eq!(cookie_value(&headers, "csrf_token"), Some("abc"));
        assert_eq!(cookie_value(&headers, "slidegate_session"), Some("s-1"));
        assert_eq!(cookie_value(&headers, "empty"), None);
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_append_cookie_attributes() {
        let mut headers = HeaderMap::new();
        append_cookie(
            &mut headers,
            "csrf_meta",
            "xyz",
            CookieOpts { http_only: true, secure: true, max_age: Some(60) },
        )
        .unwrap();
        let cookie = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert_eq!(
            cookie,
            "csrf_meta=xyz; Path=/; SameSite=Strict; Max-Age=60; HttpOnly; Secure"
        );
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let ext = axum::http::Extensions::new();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip_from(&ext, &headers), "127.0.0.1");
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(client_ip_from(&ext, &headers), "10.0.0.9");
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        assert_eq!(client_ip_from(&ext, &headers), "203.0.113.5");
    }
}
