use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AuthConfig;

/// Authenticated user attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
}

/// Verifies user credentials. Exactly one implementation is active per
/// process, chosen from config at startup.
#[async_trait]
pub trait AuthProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn authenticate(&self, username: &str, password: &str) -> Option<AuthUser>;
}

/// Credentials from environment.
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Self {
        let username = std::env::var("SLIDEGATE_USERNAME").unwrap_or_else(|_| "admin".to_string());
        let password = std::env::var("SLIDEGATE_PASSWORD").unwrap_or_else(|_| {
            warn!("SLIDEGATE_PASSWORD not set, using default password");
            "admin".to_string()
        });
        Self { username, password }
    }
}

/// Single-user provider backed by environment credentials.
#[derive(Debug, Clone)]
pub struct LocalAuthProvider {
    username: String,
    password: String,
}

impl LocalAuthProvider {
    pub fn new(creds: Credentials) -> Self {
        Self {
            username: creds.username,
            password: creds.password,
        }
    }

    pub fn from_env() -> Self {
        Self::new(Credentials::from_env())
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn authenticate(&self, username: &str, password: &str) -> Option<AuthUser> {
        let user_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let pass_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        if (user_ok & pass_ok).unwrap_u8() == 1 {
            Some(AuthUser {
                id: format!("local:{}", self.username),
                username: self.username.clone(),
            })
        } else {
            None
        }
    }
}

pub fn build_provider(config: &AuthConfig) -> Result<Arc<dyn AuthProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalAuthProvider::from_env())),
        other => bail!("unknown auth provider: {other}"),
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user: Option<AuthUser>,
    pub created_at: DateTime<Utc>,
    last_seen: Instant,
}

/// In-memory session store; per process.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_session(&self, user: Option<AuthUser>) -> String {
        let session_id = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.clone(),
            Session {
                user,
                created_at: Utc::now(),
                last_seen: Instant::now(),
            },
        );
        session_id
    }

    /// Looks up a session and marks it as used.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.last_seen = Instant::now();
        Some(session.clone())
    }

    pub async fn user(&self, session_id: &str) -> Option<AuthUser> {
        self.get_session(session_id).await.and_then(|s| s.user)
    }

    pub async fn delete_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
    }

    /// Removes sessions unused for `idle` and returns their ids.
    pub async fn purge_idle(&self, idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        debug!(removed = expired.len(), remaining = sessions.len(), "session sweep");
        expired
    }
}
