//! Dispatch coordinator with single-flight semantics.
//!
//! `resolve` answers from the cache when it can. On a miss, the first caller
//! for a fingerprint registers an in-flight marker and starts exactly one
//! backend computation; everyone else who misses on the same fingerprint
//! attaches to that marker and receives the same outcome.
//!
//! The computation runs on its own task, so a caller that gives up (timeout
//! or cancellation) never cancels it. Successful results are cached before
//! the marker is removed, which means a caller that finds no marker will
//! always find the cache populated instead.

use crate::backend::AnalysisBackend;
use crate::cache::ResultCache;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{AnalysisArtifact, AnalysisRequest};
use crate::normalizer::{canonicalize, normalize, Fingerprint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What every waiter on a fingerprint eventually receives.
type Outcome = DispatchResult<Arc<AnalysisArtifact>>;

/// Late joiners clone this receiver. `None` until the computation resolves.
type InFlightMarker = watch::Receiver<Option<Outcome>>;

/// Coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// TTL applied to freshly computed artifacts.
    pub ttl: Duration,
    /// Longest a caller waits for an in-flight computation. `None` waits
    /// indefinitely.
    pub max_wait: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_wait: None,
        }
    }
}

/// Snapshot of coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub resolves: u64,
    pub cache_hits: u64,
    pub backend_calls: u64,
    /// Callers that attached to a computation started by someone else.
    pub joins: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    resolves: AtomicU64,
    cache_hits: AtomicU64,
    backend_calls: AtomicU64,
    joins: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

struct Shared {
    backend: Arc<dyn AnalysisBackend>,
    cache: ResultCache,
    in_flight: Mutex<HashMap<Fingerprint, InFlightMarker>>,
    config: DispatchConfig,
    counters: Counters,
}

impl Shared {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<Fingerprint, InFlightMarker>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the in-flight marker when the computation task ends, including
/// when the backend panics.
struct InFlightGuard {
    shared: Arc<Shared>,
    fingerprint: Fingerprint,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.lock_in_flight().remove(&self.fingerprint);
    }
}

enum Lookup {
    Cached(Arc<AnalysisArtifact>),
    Waiting(InFlightMarker),
}

/// Mediates between API callers, the result cache, and the backend.
///
/// Cheap to clone; clones share the same cache and in-flight table.
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Build a coordinator that owns `cache`.
    ///
    /// Fails with `InvalidTtl` when the configured TTL is zero.
    pub fn new(
        backend: Arc<dyn AnalysisBackend>,
        cache: ResultCache,
        config: DispatchConfig,
    ) -> DispatchResult<Self> {
        if config.ttl.is_zero() {
            return Err(DispatchError::InvalidTtl);
        }

        info!(
            "Dispatch coordinator ready (backend: {}, ttl: {}s, capacity: {})",
            backend.name(),
            config.ttl.as_secs(),
            cache
                .max_entries()
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string())
        );

        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                cache,
                in_flight: Mutex::new(HashMap::new()),
                config,
                counters: Counters::default(),
            }),
        })
    }

    #[allow(dead_code)] // Accessor for embedders
    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.shared.cache
    }

    /// Return the artifact for `request`, computing it at most once across
    /// concurrent callers.
    pub async fn resolve(&self, request: &AnalysisRequest) -> Outcome {
        let counters = &self.shared.counters;
        counters.resolves.fetch_add(1, Ordering::Relaxed);

        let (fingerprint, canonical) = canonicalize(request)?;

        if let Some(artifact) = self.shared.cache.get(&fingerprint) {
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {}", fingerprint.short());
            return Ok(artifact);
        }

        match self.join_or_start(fingerprint, canonical) {
            Lookup::Cached(artifact) => {
                counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                Ok(artifact)
            }
            Lookup::Waiting(marker) => self.wait(marker).await,
        }
    }

    /// Atomically attach to an existing computation or register a new one.
    /// The backend only ever sees the canonical `request`.
    fn join_or_start(&self, fingerprint: Fingerprint, request: AnalysisRequest) -> Lookup {
        let mut in_flight = self.shared.lock_in_flight();

        // A computation may have finished between the first lookup and
        // taking the lock.
        if let Some(artifact) = self.shared.cache.get(&fingerprint) {
            return Lookup::Cached(artifact);
        }

        if let Some(marker) = in_flight.get(&fingerprint) {
            self.shared.counters.joins.fetch_add(1, Ordering::Relaxed);
            debug!("Joining in-flight computation for {}", fingerprint.short());
            return Lookup::Waiting(marker.clone());
        }

        let (tx, marker) = watch::channel(None);
        in_flight.insert(fingerprint.clone(), marker.clone());
        drop(in_flight);

        self.spawn_computation(fingerprint, request, tx);
        Lookup::Waiting(marker)
    }

    fn spawn_computation(
        &self,
        fingerprint: Fingerprint,
        request: AnalysisRequest,
        tx: watch::Sender<Option<Outcome>>,
    ) {
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let guard = InFlightGuard {
                shared: Arc::clone(&shared),
                fingerprint: fingerprint.clone(),
            };

            shared.counters.backend_calls.fetch_add(1, Ordering::Relaxed);
            info!(
                "Computing {} via {} backend ({})",
                fingerprint.short(),
                shared.backend.name(),
                request
            );

            let outcome: Outcome = match shared.backend.compute(&request).await {
                Ok(artifact) => {
                    let artifact = Arc::new(artifact);
                    if let Err(e) =
                        shared
                            .cache
                            .put(fingerprint.clone(), Arc::clone(&artifact), shared.config.ttl)
                    {
                        warn!("Could not cache {}: {}", fingerprint.short(), e);
                    }
                    Ok(artifact)
                }
                Err(e) => {
                    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Backend failed for {}: {}", fingerprint.short(), e);
                    Err(e.into())
                }
            };

            drop(guard);
            tx.send_replace(Some(outcome));
        });
    }

    async fn wait(&self, mut marker: InFlightMarker) -> Outcome {
        let outcome = async move {
            let published: Option<Outcome> = match marker.wait_for(Option::is_some).await {
                Ok(value) => value.clone(),
                Err(_) => {
                    return Err(DispatchError::BackendUnavailable(
                        "analysis task ended before producing a result".to_string(),
                    ))
                }
            };
            published.unwrap_or_else(|| {
                Err(DispatchError::BackendUnavailable(
                    "analysis finished without a result".to_string(),
                ))
            })
        };

        let Some(limit) = self.shared.config.max_wait else {
            return outcome.await;
        };

        match tokio::time::timeout(limit, outcome).await {
            Ok(result) => result,
            Err(_) => {
                self.shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("Gave up waiting after {:?}", limit);
                Err(DispatchError::Timeout(limit))
            }
        }
    }

    /// Drop any cached artifact for `request`.
    #[allow(dead_code)] // Exposed for API layers that push updated source data
    pub fn invalidate(&self, request: &AnalysisRequest) -> DispatchResult<()> {
        let fingerprint = normalize(request)?;
        self.shared.cache.invalidate(&fingerprint);
        Ok(())
    }

    /// Number of computations currently running.
    pub fn in_flight(&self) -> usize {
        self.shared.lock_in_flight().len()
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.shared.counters;
        DispatchStats {
            resolves: c.resolves.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            backend_calls: c.backend_calls.load(Ordering::Relaxed),
            joins: c.joins.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }

    /// Tear down: empty the cache.
    ///
    /// Computations already running still finish and deliver to their
    /// waiters.
    pub fn shutdown(&self) {
        let stats = self.stats();
        info!(
            "Shutting down dispatcher ({} resolves, {} backend calls, {} still in flight)",
            stats.resolves, stats.backend_calls, stats.in_flight
        );
        self.shared.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use async_trait::async_trait;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_err, assert_ok};

    /// Backend that counts calls and can be slowed down or made to fail.
    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
        latency: Duration,
        fail: bool,
        panic: bool,
    }

    impl CountingBackend {
        fn slow(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn compute(
            &self,
            request: &AnalysisRequest,
        ) -> Result<AnalysisArtifact, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.panic {
                panic!("backend exploded");
            }
            if self.fail {
                return Err(BackendError::Unavailable("model offline".to_string()));
            }
            Ok(AnalysisArtifact::new(
                vec![json!({"region": request.region()})],
                vec![json!({"trend": "warming"})],
                0.95,
            ))
        }
    }

    fn coordinator(backend: Arc<CountingBackend>, config: DispatchConfig) -> Coordinator {
        Coordinator::new(backend, ResultCache::unbounded(), config).unwrap()
    }

    fn ttl(secs: u64) -> DispatchConfig {
        DispatchConfig {
            ttl: Duration::from_secs(secs),
            max_wait: None,
        }
    }

    fn global_temperature() -> AnalysisRequest {
        AnalysisRequest::new("global", ["temperature"])
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_then_recomputed_after_ttl() {
        let backend = Arc::new(CountingBackend::default());
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));
        let request = global_temperature();

        let first = dispatcher.resolve(&request).await.unwrap();
        assert_eq!(first.confidence, 0.95);
        assert_eq!(backend.calls(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = dispatcher.resolve(&request).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.calls(), 1);

        tokio::time::advance(Duration::from_secs(51)).await;
        let third = dispatcher.resolve(&request).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(backend.calls(), 2);

        let stats = dispatcher.stats();
        assert_eq!(stats.resolves, 3);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.backend_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_computation() {
        let backend = Arc::new(CountingBackend::slow(Duration::from_millis(200)));
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));

        // Same semantic request, different data type order.
        let requests: Vec<AnalysisRequest> = (0..16)
            .map(|i| {
                if i % 2 == 0 {
                    AnalysisRequest::new("global", ["temperature", "co2"])
                } else {
                    AnalysisRequest::new("global", ["co2", "temperature"])
                }
            })
            .collect();

        let results = join_all(requests.iter().map(|r| dispatcher.resolve(r))).await;

        assert_eq!(backend.calls(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(dispatcher.stats().joins, 15);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_across_threads() {
        let backend = Arc::new(CountingBackend::slow(Duration::from_millis(50)));
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.resolve(&global_temperature()).await })
            })
            .collect();

        for handle in join_all(handles).await {
            assert_ok!(handle.unwrap());
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_delivered_to_all_waiters_and_not_cached() {
        let backend = Arc::new(CountingBackend {
            latency: Duration::from_millis(100),
            fail: true,
            ..CountingBackend::default()
        });
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));
        let request = global_temperature();

        let results = join_all((0..5).map(|_| dispatcher.resolve(&request))).await;

        assert_eq!(backend.calls(), 1);
        for result in results {
            assert_eq!(
                result.unwrap_err(),
                DispatchError::BackendUnavailable("model offline".to_string())
            );
        }
        assert!(dispatcher.cache().is_empty());
        assert_eq!(dispatcher.stats().failures, 1);

        // A retry starts a fresh computation.
        assert_err!(dispatcher.resolve(&request).await);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_backend() {
        let backend = Arc::new(CountingBackend::default());
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));

        let empty_region = AnalysisRequest::new("", ["temperature"]);
        let no_types = AnalysisRequest::new("global", Vec::<String>::new());

        assert!(matches!(
            dispatcher.resolve(&empty_region).await,
            Err(DispatchError::InvalidRequest(_))
        ));
        assert!(matches!(
            dispatcher.resolve(&no_types).await,
            Err(DispatchError::InvalidRequest(_))
        ));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_computation_running() {
        let backend = Arc::new(CountingBackend::slow(Duration::from_secs(5)));
        let dispatcher = coordinator(
            Arc::clone(&backend),
            DispatchConfig {
                ttl: Duration::from_secs(60),
                max_wait: Some(Duration::from_secs(1)),
            },
        );
        let request = global_temperature();

        let err = dispatcher.resolve(&request).await.unwrap_err();
        assert_eq!(err, DispatchError::Timeout(Duration::from_secs(1)));
        assert_eq!(dispatcher.in_flight(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.in_flight(), 0);

        let artifact = dispatcher.resolve(&request).await.unwrap();
        assert_eq!(artifact.confidence, 0.95);
        assert_eq!(backend.calls(), 1);
        assert_eq!(dispatcher.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_does_not_cancel_computation() {
        let backend = Arc::new(CountingBackend::slow(Duration::from_secs(2)));
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));

        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.resolve(&global_temperature()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(dispatcher.cache().len(), 1);
        assert_ok!(dispatcher.resolve(&global_temperature()).await);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_backend_clears_marker() {
        let backend = Arc::new(CountingBackend {
            panic: true,
            ..CountingBackend::default()
        });
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));

        let err = dispatcher.resolve(&global_temperature()).await.unwrap_err();

        assert!(matches!(err, DispatchError::BackendUnavailable(_)));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_fingerprints_compute_independently() {
        let backend = Arc::new(CountingBackend::slow(Duration::from_millis(100)));
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));

        let arctic = AnalysisRequest::new("arctic", ["temperature"]);
        let sahel = AnalysisRequest::new("sahel", ["temperature"]);
        let (a, b) = tokio::join!(dispatcher.resolve(&arctic), dispatcher.resolve(&sahel));

        assert_ok!(a);
        assert_ok!(b);
        assert_eq!(backend.calls(), 2);
        assert_eq!(dispatcher.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let backend = Arc::new(CountingBackend::default());
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));
        let request = global_temperature();

        dispatcher.resolve(&request).await.unwrap();
        dispatcher.invalidate(&request).unwrap();
        dispatcher.resolve(&request).await.unwrap();

        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_clears_cache() {
        let backend = Arc::new(CountingBackend::default());
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));

        dispatcher.resolve(&global_temperature()).await.unwrap();
        assert_eq!(dispatcher.cache().len(), 1);

        dispatcher.shutdown();
        assert!(dispatcher.cache().is_empty());
    }

    #[tokio::test]
    async fn test_backend_sees_canonical_request() {
        let backend = Arc::new(CountingBackend::slow(Duration::from_millis(20)));
        let dispatcher = coordinator(Arc::clone(&backend), ttl(60));

        let shouted = AnalysisRequest::new("  GLOBAL ", ["Temperature"]);
        let plain = global_temperature();
        let (first, second) = tokio::join!(dispatcher.resolve(&shouted), dispatcher.resolve(&plain));

        let first = first.unwrap();
        assert!(Arc::ptr_eq(&first, &second.unwrap()));
        assert_eq!(first.insights[0]["region"], "global");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_ttl_still_caches() {
        let backend = Arc::new(CountingBackend::default());
        let dispatcher = coordinator(Arc::clone(&backend), ttl(u64::MAX));
        let request = global_temperature();

        let first = assert_ok!(dispatcher.resolve(&request).await);
        assert_eq!(dispatcher.cache().len(), 1);

        tokio::time::advance(Duration::from_secs(86400 * 365)).await;
        let second = assert_ok!(dispatcher.resolve(&request).await);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let backend: Arc<dyn AnalysisBackend> = Arc::new(CountingBackend::default());
        let result = Coordinator::new(backend, ResultCache::unbounded(), ttl(0));
        assert_eq!(result.err(), Some(DispatchError::InvalidTtl));
    }
}
