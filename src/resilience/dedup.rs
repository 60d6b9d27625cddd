use futures_util::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

type SharedCall<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// SHA-256 over the parts, separated so ("ab","c") != ("a","bc").
pub fn derive_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Collapses concurrent identical calls into one execution.
///
/// Every caller with the same key gets a clone of the same result, error
/// included. The settled result stays shared for `ttl`, then the key is
/// forgotten and the next call runs again.
pub struct QueryDeduplicator<T, E> {
    ttl: Duration,
    inflight: Arc<Mutex<HashMap<String, SharedCall<T, E>>>>,
}

impl<T, E> std::fmt::Debug for QueryDeduplicator<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDeduplicator")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<T, E> Clone for QueryDeduplicator<T, E> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            inflight: self.inflight.clone(),
        }
    }
}

impl<T, E> QueryDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedCall<T, E>>> {
        match self.inflight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub async fn dedupe<F, Fut>(&self, key: &str, make: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let call = {
            let mut inflight = self.lock();
            if let Some(existing) = inflight.get(key) {
                trace!(key, "joining in-flight call");
                existing.clone()
            } else {
                let call = make().boxed().shared();
                inflight.insert(key.to_string(), call.clone());
                self.spawn_eviction(key.to_string(), call.clone());
                call
            }
        };
        call.await
    }

    // Drives the call to completion even if every caller goes away, then
    // forgets the key once the TTL has passed.
    fn spawn_eviction(&self, key: String, call: SharedCall<T, E>) {
        let inflight = self.inflight.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            let _ = call.clone().await;
            tokio::time::sleep(ttl).await;
            let mut map = match inflight.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if map.get(&key).is_some_and(|cur| Shared::ptr_eq(cur, &call)) {
                map.remove(&key);
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}
