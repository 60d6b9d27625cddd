use std::time::Duration;
use tracing::{debug, info};

use crate::security::audit_log::AuditLogger;
use crate::security::auth::SessionStore;
use crate::security::csrf::CsrfManager;
use crate::utils::task::{spawn_periodic, TaskHandle};

#[derive(Debug, Clone, Copy)]
pub struct RotationSettings {
    pub interval: Duration,
    pub max_jitter: Duration,
    /// Sessions unused for this long are dropped along with their tokens
    pub session_idle: Duration,
}

/// One maintenance round:
/// 1. Drops idle sessions and revokes their tokens
/// 2. Drops expired tokens and elapsed grace tokens
/// 3. Issues a new token per remaining session, keeping the old one for the grace period
pub async fn rotate_once(
    manager: &CsrfManager,
    sessions: &SessionStore,
    session_idle: Duration,
    audit: &AuditLogger,
) -> usize {
    let idle = sessions.purge_idle(session_idle).await;
    for sid in &idle {
        manager.revoke(sid).await;
    }
    if !idle.is_empty() {
        info!(sessions = idle.len(), "idle sessions expired");
    }

    let rotated = manager.rotate().await;
    if rotated > 0 {
        info!(sessions = rotated, "CSRF tokens rotated");
        audit.token_rotated(rotated);
    } else {
        debug!("no active sessions to rotate");
    }
    rotated
}

/// Background task running `rotate_once` every `interval` (+ jitter).
pub fn spawn_rotation(
    manager: CsrfManager,
    sessions: SessionStore,
    settings: RotationSettings,
    audit: AuditLogger,
) -> TaskHandle {
    spawn_periodic("csrf rotation", settings.interval, settings.max_jitter, move || {
        let manager = manager.clone();
        let sessions = sessions.clone();
        let audit = audit.clone();
        async move {
            rotate_once(&manager, &sessions, settings.session_idle, &audit).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CsrfConfig;
    use crate::security::csrf::CsrfRequest;
    use axum::http::Method;

    fn post<'a>(session: &'a str, token: &'a str) -> CsrfRequest<'a> {
        CsrfRequest {
            method: &Method::POST,
            path: "/api/jobs",
            session_id: Some(session),
            token: Some(token),
            cookie_token: Some(token),
            meta_cookie: None,
        }
    }

    fn settings(session_idle: Duration) -> RotationSettings {
        RotationSettings {
            interval: Duration::from_secs(60),
            max_jitter: Duration::ZERO,
            session_idle,
        }
    }

    fn manager() -> CsrfManager {
        CsrfManager::new(CsrfConfig {
            hardened: false,
            grace_period_secs: 10,
            ..CsrfConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_task_rotates_and_disposes() {
        let manager = manager();
        let sessions = SessionStore::new();
        let sid = sessions.create_session(None).await;
        let first = manager.issue(&sid).await;
        let handle = spawn_rotation(
            manager.clone(),
            sessions.clone(),
            settings(Duration::from_secs(3600)),
            AuditLogger::new(),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        let second = manager.token_for(&sid).await;
        assert_ne!(first.value, second.value);
        assert!(manager.validate(&post(&sid, &first.value)).await);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!manager.validate(&post(&sid, &first.value)).await);
        assert!(manager.validate(&post(&sid, &second.value)).await);

        handle.dispose().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(manager.token_for(&sid).await.value, second.value);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_dropped_with_tokens() {
        let manager = manager();
        let sessions = SessionStore::new();
        let idle = sessions.create_session(None).await;
        let active = sessions.create_session(None).await;
        let idle_token = manager.issue(&idle).await;
        manager.issue(&active).await;

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(sessions.get_session(&active).await.is_some());
        tokio::time::advance(Duration::from_secs(20)).await;

        let rotated = rotate_once(&manager, &sessions, Duration::from_secs(60), &AuditLogger::new()).await;
        assert_eq!(rotated, 1);
        assert!(sessions.get_session(&idle).await.is_none());
        assert!(sessions.get_session(&active).await.is_some());
        assert!(!manager.validate(&post(&idle, &idle_token.value)).await);
        assert_eq!(manager.active_sessions().await, 1);
    }
}
