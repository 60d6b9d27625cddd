use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("unknown pool resource: {0}")]
    UnknownResource(String),
}

#[derive(Debug)]
struct Resource {
    limit: usize,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub limit: usize,
    pub in_use: usize,
    pub waiting: usize,
}

/// Slot in a named resource; released on drop.
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bounds concurrent in-flight calls per named resource.
///
/// Excess callers wait in FIFO order until a slot frees.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    resources: Arc<HashMap<String, Resource>>,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionPool {
    pub fn new(limits: &HashMap<String, usize>) -> Self {
        let resources = limits
            .iter()
            .map(|(name, &limit)| {
                let limit = limit.max(1);
                (
                    name.clone(),
                    Resource {
                        limit,
                        semaphore: Arc::new(Semaphore::new(limit)),
                        waiting: AtomicUsize::new(0),
                    },
                )
            })
            .collect();
        Self {
            resources: Arc::new(resources),
        }
    }

    fn resource(&self, name: &str) -> Result<&Resource, PoolError> {
        self.resources
            .get(name)
            .ok_or_else(|| PoolError::UnknownResource(name.to_string()))
    }

    pub async fn acquire(&self, name: &str) -> Result<PoolPermit, PoolError> {
        let res = self.resource(name)?;
        res.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&res.waiting);
        trace!(resource = name, "waiting for pool slot");
        let permit = res
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(PoolPermit { _permit: permit })
    }

    /// Runs `fut` while holding a slot of `name`.
    pub async fn run<F, T>(&self, name: &str, fut: F) -> Result<T, PoolError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(name).await?;
        Ok(fut.await)
    }

    pub fn stats(&self, name: &str) -> Option<PoolStats> {
        let res = self.resources.get(name)?;
        Some(PoolStats {
            limit: res.limit,
            in_use: res.limit - res.semaphore.available_permits(),
            waiting: res.waiting.load(Ordering::SeqCst),
        })
    }

    /// Rejects current and future waiters.
    pub fn close(&self) {
        for res in self.resources.values() {
            res.semaphore.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn pool(limit: usize) -> ConnectionPool {
        ConnectionPool::new(&HashMap::from([("llm".to_string(), limit)]))
    }

    async fn wait_for_waiters(pool: &ConnectionPool, n: usize) {
        while pool.stats("llm").unwrap().waiting < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_bounds_concurrency_fifo() {
        let pool = pool(1);
        let held = pool.acquire("llm").await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let worker = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                worker.run("llm", async {
                    order.lock().unwrap().push(i);
                })
                .await
                .unwrap();
            }));
            wait_for_waiters(&pool, i + 1).await;
        }

        let stats = pool.stats("llm").unwrap();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.waiting, 3);

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(pool.stats("llm").unwrap().in_use, 0);
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let pool = pool(2);
        assert_eq!(
            pool.acquire("db").await.unwrap_err(),
            PoolError::UnknownResource("db".to_string())
        );
        assert!(pool.stats("db").is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let pool = pool(1);
        let _held = pool.acquire("llm").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("llm").await.map(|_| ()) })
        };
        wait_for_waiters(&pool, 1).await;
        pool.close();
        assert_eq!(waiter.await.unwrap(), Err(PoolError::Closed));
    }
}
