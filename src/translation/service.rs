//! Text translation with caching and backend protection.
//!
//! A request for one string goes through, in order: the two-layer cache,
//! the in-flight deduplicator, the batcher, the connection pool and the
//! circuit breaker guarding the translator.

use futures_util::future::{join_all, try_join_all};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::Translator;
use crate::config::Config;
use crate::resilience::batch::{BatchProcessor, BatchSettings};
use crate::resilience::cache::{CacheStats, GetOptions, MultiLayerCache};
use crate::resilience::circuit_breaker::{BreakerError, BreakerRegistry, BreakerStatus, CircuitBreaker};
use crate::resilience::dedup::{derive_key, QueryDeduplicator};
use crate::resilience::pool::{ConnectionPool, PoolError, PoolStats};

pub const LLM_RESOURCE: &str = "llm";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslateError {
    /// Breaker open or pool shut down; callers should retry later
    #[error("translation backend unavailable: {0}")]
    Unavailable(String),

    #[error("translation failed: {0}")]
    Failed(String),
}

impl<E: std::fmt::Display> From<BreakerError<E>> for TranslateError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open(_) | BreakerError::ProbeTimeout(_) => {
                TranslateError::Unavailable(err.to_string())
            }
            BreakerError::Inner(e) => TranslateError::Failed(e.to_string()),
        }
    }
}

impl From<PoolError> for TranslateError {
    fn from(err: PoolError) -> Self {
        TranslateError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone)]
struct BatchItem {
    language: String,
    text: String,
}

type BatchOutput = Result<String, TranslateError>;

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub translator: &'static str,
    pub cache: CacheStats,
    /// Distinct texts currently being fetched
    pub in_flight: usize,
    pub pool: Option<PoolStats>,
    pub breaker: BreakerStatus,
}

#[derive(Debug)]
pub struct TranslationService {
    translator_name: &'static str,
    cache: MultiLayerCache<String>,
    dedup: QueryDeduplicator<String, TranslateError>,
    batcher: Arc<BatchProcessor<BatchItem, BatchOutput>>,
    pool: ConnectionPool,
    breaker: CircuitBreaker,
}

impl TranslationService {
    pub fn new(
        config: &Config,
        translator: Arc<dyn Translator>,
        pool: ConnectionPool,
        breakers: &BreakerRegistry,
    ) -> Self {
        let breaker = breakers.get(LLM_RESOURCE);
        let batcher = {
            let pool = pool.clone();
            let breaker = breaker.clone();
            let translator = translator.clone();
            BatchProcessor::new(BatchSettings::from(&config.batch), move |items: Vec<BatchItem>| {
                let pool = pool.clone();
                let breaker = breaker.clone();
                let translator = translator.clone();
                async move {
                    Ok::<_, Infallible>(run_batch(translator.as_ref(), &pool, &breaker, items).await)
                }
            })
        };

        Self {
            translator_name: translator.name(),
            cache: MultiLayerCache::new(&config.cache),
            dedup: QueryDeduplicator::new(Duration::from_millis(config.cache.dedup_ttl_ms)),
            batcher: Arc::new(batcher),
            pool,
            breaker,
        }
    }

    /// Translates one string. Blank input comes back unchanged.
    pub async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslateError> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        let key = derive_key(&["translate", target_language, text]);
        let item = BatchItem {
            language: target_language.to_string(),
            text: text.to_string(),
        };
        let dedup = self.dedup.clone();
        let batcher = self.batcher.clone();
        let dedup_key = key.clone();

        self.cache
            .get(
                &key,
                move || async move {
                    dedup
                        .dedupe(&dedup_key, move || async move {
                            match batcher.add(item).await {
                                Ok(res) => res,
                                Err(e) => Err(TranslateError::Failed(e.to_string())),
                            }
                        })
                        .await
                },
                GetOptions::swr(),
            )
            .await
    }

    /// Translates every string, preserving order; fails if any one fails.
    pub async fn translate_all(
        &self,
        texts: &[String],
        target_language: &str,
    ) -> Result<Vec<String>, TranslateError> {
        try_join_all(texts.iter().map(|t| self.translate(t, target_language))).await
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            translator: self.translator_name,
            cache: self.cache.stats(),
            in_flight: self.dedup.in_flight(),
            pool: self.pool.stats(LLM_RESOURCE),
            breaker: self.breaker.status(),
        }
    }

    /// Flushes pending batches; new calls fail afterwards.
    pub async fn dispose(&self) {
        self.batcher.dispose().await;
        info!("translation service stopped");
    }
}

// Groups the batch by language and sends one backend call per group.
async fn run_batch(
    translator: &dyn Translator,
    pool: &ConnectionPool,
    breaker: &CircuitBreaker,
    items: Vec<BatchItem>,
) -> Vec<BatchOutput> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, item) in items.iter().enumerate() {
        groups.entry(item.language.as_str()).or_default().push(idx);
    }

    let calls = groups.into_iter().map(|(language, idxs)| {
        let texts: Vec<String> = idxs.iter().map(|&i| items[i].text.clone()).collect();
        async move {
            debug!(language, count = texts.len(), "translating batch");
            let result = pool
                .run(LLM_RESOURCE, breaker.execute(|| translator.translate_batch(&texts, language)))
                .await;
            let result = match result {
                Ok(Ok(out)) if out.len() == texts.len() => Ok(out),
                Ok(Ok(out)) => Err(TranslateError::Failed(format!(
                    "expected {} translations, got {}",
                    texts.len(),
                    out.len()
                ))),
                Ok(Err(e)) => Err(breaker_error(e)),
                Err(e) => Err(e.into()),
            };
            (idxs, result)
        }
    });

    let mut outputs: Vec<BatchOutput> = vec![Err(TranslateError::Failed("not translated".into())); items.len()];
    for (idxs, result) in join_all(calls).await {
        match result {
            Ok(translated) => {
                for (i, t) in idxs.into_iter().zip(translated) {
                    outputs[i] = Ok(t);
                }
            }
            Err(e) => {
                for i in idxs {
                    outputs[i] = Err(e.clone());
                }
            }
        }
    }
    outputs
}

fn breaker_error(err: BreakerError<anyhow::Error>) -> TranslateError {
    match err {
        BreakerError::Inner(e) => TranslateError::Failed(format!("{e:#}")),
        other => other.into(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::BreakerSettings;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Upper-cases text and tags it with the language.
    #[derive(Debug, Default)]
    pub(crate) struct EchoTranslator {
        pub calls: AtomicUsize,
        pub batches: Mutex<Vec<Vec<String>>>,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl Translator for EchoTranslator {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn translate_batch(&self, texts: &[String], lang: &str) -> anyhow::Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(texts.to_vec());
            if self.fail.load(Ordering::SeqCst) {
                bail!("upstream error");
            }
            Ok(texts.iter().map(|t| format!("[{lang}] {}", t.to_uppercase())).collect())
        }
    }

    fn service(translator: Arc<EchoTranslator>, config: &Config) -> TranslationService {
        let pool = ConnectionPool::new(&config.pool.limits);
        let breakers = BreakerRegistry::new(BreakerSettings::from(&config.breaker));
        TranslationService::new(config, translator, pool, &breakers)
    }

    #[tokio::test]
    async fn concurrent_texts_share_one_backend_call() {
        let translator = Arc::new(EchoTranslator::default());
        let svc = service(translator.clone(), &Config::default());
        let texts = vec!["hello".to_string(), "world".to_string(), "hello".to_string()];

        let out = svc.translate_all(&texts, "ja").await.unwrap();
        assert_eq!(out, vec!["[ja] HELLO", "[ja] WORLD", "[ja] HELLO"]);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
        // the duplicate "hello" never reached the batch
        assert_eq!(translator.batches.lock().unwrap()[0].len(), 2);
    }

    #[tokio::test]
    async fn cached_translation_skips_backend() {
        let translator = Arc::new(EchoTranslator::default());
        let svc = service(translator.clone(), &Config::default());
        svc.translate("title", "fr").await.unwrap();
        svc.translate("title", "fr").await.unwrap();
        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.stats().cache.hits, 1);
    }

    #[tokio::test]
    async fn languages_are_batched_separately() {
        let translator = Arc::new(EchoTranslator::default());
        let svc = service(translator.clone(), &Config::default());
        let (a, b) = tokio::join!(svc.translate("one", "ja"), svc.translate("one", "de"));
        assert_eq!(a.unwrap(), "[ja] ONE");
        assert_eq!(b.unwrap(), "[de] ONE");
        assert_eq!(translator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blank_text_passes_through() {
        let translator = Arc::new(EchoTranslator::default());
        let svc = service(translator.clone(), &Config::default());
        assert_eq!(svc.translate("  ", "ja").await.unwrap(), "  ");
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures() {
        let translator = Arc::new(EchoTranslator::default());
        translator.fail.store(true, Ordering::SeqCst);
        let mut config = Config::default();
        config.breaker.failure_threshold = 2;
        let svc = service(translator.clone(), &config);

        for text in ["a", "b"] {
            let err = svc.translate(text, "ja").await.unwrap_err();
            assert!(matches!(err, TranslateError::Failed(ref m) if m.contains("upstream error")));
        }
        let err = svc.translate("c", "ja").await.unwrap_err();
        assert!(matches!(err, TranslateError::Unavailable(_)));
        assert_eq!(translator.calls.load(Ordering::SeqCst), 2);
    }
}
