//! Circuit breaker for outbound calls (LLM API, PPTX sidecar).
//!
//! After `failure_threshold` consecutive failures the breaker opens and
//! refuses calls for `open_timeout`. The first call after that is a single
//! half-open probe: success closes the breaker, failure (or a probe that
//! outlives `probe_timeout`) opens it again.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::security::audit_log::AuditLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Failing fast until the open timeout elapses
    Open,
    /// One probe call is allowed through
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit '{0}' is open")]
    Open(String),

    #[error("circuit '{0}' probe timed out")]
    ProbeTimeout(String),

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub probe_timeout: Duration,
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            open_timeout: Duration::from_secs(cfg.open_timeout_secs),
            probe_timeout: Duration::from_secs(cfg.probe_timeout_secs),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Snapshot for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_secs_ago: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    settings: BreakerSettings,
    inner: Arc<Mutex<Inner>>,
    audit: AuditLogger,
}

// Clears the probe flag if a probe future is dropped before it finishes.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: &str, settings: BreakerSettings) -> Self {
        Self {
            name: Arc::from(name),
            settings,
            inner: Arc::new(Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                opened_at: None,
                probe_in_flight: false,
            })),
            audit: AuditLogger::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            name: self.name.to_string(),
            state: inner.state,
            failures: inner.failures,
            last_failure_secs_ago: inner.last_failure.map(|t| t.elapsed().as_secs()),
        }
    }

    /// Forces the breaker closed with zero failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    // Ok(true) = admitted as half-open probe, Ok(false) = normal call.
    fn admit(&self) -> Result<bool, ()> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.settings.open_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!(breaker = %self.name, "circuit half-open, probing");
                    Ok(true)
                } else {
                    Err(())
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(())
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    // Only the admitted probe may leave HalfOpen; calls admitted before the
    // breaker opened don't move it.
    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        match (inner.state, probe) {
            (BreakerState::HalfOpen, true) => {
                info!(breaker = %self.name, "probe succeeded, circuit closed");
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            (BreakerState::Closed, _) => inner.failures = 0,
            _ => debug!(breaker = %self.name, "late success ignored while not closed"),
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.last_failure = Some(now);
        let trip = match (inner.state, probe) {
            (BreakerState::HalfOpen, true) => {
                inner.failures = inner.failures.saturating_add(1);
                inner.probe_in_flight = false;
                true
            }
            (BreakerState::Closed, _) => {
                inner.failures = inner.failures.saturating_add(1);
                inner.failures >= self.settings.failure_threshold
            }
            _ => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            warn!(breaker = %self.name, failures = inner.failures, "circuit opened");
            self.audit.breaker_opened(&self.name, inner.failures);
        }
    }

    /// Runs `action` through the breaker.
    pub async fn execute<F, Fut, T, E>(&self, action: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Ok(probe) = self.admit() else {
            return Err(BreakerError::Open(self.name.to_string()));
        };
        let mut guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };

        let outcome = if probe {
            match tokio::time::timeout(self.settings.probe_timeout, action()).await {
                Ok(res) => res.map_err(BreakerError::Inner),
                Err(_) => Err(BreakerError::ProbeTimeout(self.name.to_string())),
            }
        } else {
            action().await.map_err(BreakerError::Inner)
        };
        guard.armed = false;

        match &outcome {
            Ok(_) => self.on_success(probe),
            Err(_) => self.on_failure(probe),
        }
        outcome
    }

    /// Like `execute`, but calls `fallback` instead of failing fast while open.
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        action: F,
        fallback: G,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        match self.execute(action).await {
            Err(BreakerError::Open(_)) => {
                debug!(breaker = %self.name, "circuit open, using fallback");
                fallback().await.map_err(BreakerError::Inner)
            }
            other => other,
        }
    }
}

/// Named breakers sharing one configuration, created on first use.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, name: &str) -> CircuitBreaker {
        let mut breakers = match self.breakers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.settings))
            .clone()
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let breakers = match self.breakers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<BreakerStatus> = breakers.values().map(|b| b.status()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
