use axum::http::{HeaderMap, HeaderValue};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{RateLimitConfig, RateLimitProfile, PROFILE_API};

/// Outcome of a single `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Time until the oldest counted request leaves the window
    pub reset_after: Duration,
    /// Same instant as `reset_after`, as unix seconds
    pub reset_at: i64,
}

impl RateLimitDecision {
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }

    pub fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_at));
    }
}

/// Builds the limiter key, preferring the most specific identity available.
pub fn identifier(user_id: Option<&str>, session_id: Option<&str>, ip: &str) -> String {
    match (user_id, session_id) {
        (Some(user), _) => format!("user:{user}"),
        (None, Some(session)) => format!("session:{session}"),
        (None, None) => format!("ip:{ip}"),
    }
}

#[derive(Debug)]
struct Record {
    hits: VecDeque<Instant>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Store {
    records: HashMap<String, Record>,
    // last_used tick -> identifier, oldest first
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl Store {
    fn touch(&mut self, key: &str) -> &mut Record {
        self.tick += 1;
        let tick = self.tick;
        if let Some(rec) = self.records.get(key) {
            self.recency.remove(&rec.last_used);
        }
        self.recency.insert(tick, key.to_string());
        let rec = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| Record {
                hits: VecDeque::new(),
                last_used: tick,
            });
        rec.last_used = tick;
        rec
    }

    fn evict_to(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.records.len() > capacity {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            self.records.remove(&key);
            evicted += 1;
        }
        evicted
    }
}

/// Sliding-window request counter keyed by identifier.
///
/// The store is bounded: once `capacity` identifiers are tracked, the least
/// recently used one is dropped. State is per process.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    capacity: usize,
    inner: Arc<Mutex<Store>>,
}

impl RateLimiter {
    pub fn new(window: Duration, limit: usize, capacity: usize) -> Self {
        Self {
            window,
            limit,
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new(Store::default())),
        }
    }

    pub fn from_profile(profile: RateLimitProfile, capacity: usize) -> Self {
        Self::new(profile.window(), profile.max_requests, capacity)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Check against the limiter's own threshold.
    pub async fn allow(&self, key: &str) -> RateLimitDecision {
        self.check(key, self.limit).await
    }

    pub async fn check(&self, key: &str, limit: usize) -> RateLimitDecision {
        let now = Instant::now();
        let window = self.window;
        let mut store = self.inner.lock().await;
        let rec = store.touch(key);

        // purge old
        while let Some(&front) = rec.hits.front() {
            if now.duration_since(front) >= window {
                rec.hits.pop_front();
            } else {
                break;
            }
        }

        let allowed = rec.hits.len() < limit;
        if allowed {
            rec.hits.push_back(now);
        }
        let remaining = limit.saturating_sub(rec.hits.len());
        let reset_after = rec
            .hits
            .front()
            .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(window);

        let evicted = store.evict_to(self.capacity);
        if evicted > 0 {
            trace!(evicted, "rate limiter store at capacity");
        }
        drop(store);

        if !allowed {
            debug!(identifier = %key, limit, "rate limit exceeded");
        }
        RateLimitDecision {
            allowed,
            limit,
            remaining,
            reset_after,
            reset_at: Utc::now().timestamp() + reset_after.as_secs() as i64,
        }
    }

    /// Number of identifiers currently tracked.
    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.records.len()
    }
}

/// Named limiter profiles (auth, translation, upload, api).
#[derive(Debug, Clone)]
pub struct RateLimiterRegistry {
    limiters: Arc<HashMap<String, RateLimiter>>,
    fallback: RateLimiter,
}

impl RateLimiterRegistry {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiters: HashMap<String, RateLimiter> = config
            .profiles
            .iter()
            .map(|(name, profile)| {
                (
                    name.clone(),
                    RateLimiter::from_profile(*profile, config.capacity),
                )
            })
            .collect();
        let fallback = limiters.get(PROFILE_API).cloned().unwrap_or_else(|| {
            RateLimiter::from_profile(RateLimitProfile::new(60, 60), config.capacity)
        });
        Self {
            limiters: Arc::new(limiters),
            fallback,
        }
    }

    /// Limiter for `name`; unknown names share the generic API limiter.
    pub fn profile(&self, name: &str) -> &RateLimiter {
        self.limiters.get(name).unwrap_or(&self.fallback)
    }
}
