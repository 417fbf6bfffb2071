//! # Resource Fetcher
//!
//! This module provides the engine facade. It wires the bounded cache and
//! the fetch coordinator together: lookups hit the cache first, misses are
//! delegated to the coordinator, and successfully fetched payloads populate
//! the cache before observers are notified.
//!
//! The fetcher is a plain constructible component with an explicit lifetime.
//! Applications wanting a process-wide shared instance build one at their
//! composition root.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::BoundedCache;
use crate::config::FetcherConfig;
use crate::coordinator::FetchCoordinator;
use crate::error::FetchError;
use crate::observer::FetchObserver;
use crate::transport::{ByteTransport, HttpTransport};

/// Cache-fronted, request-coalescing resource fetcher.
pub struct ResourceFetcher {
    cache: Arc<BoundedCache>,
    coordinator: FetchCoordinator,
}

impl ResourceFetcher {
    /// Create a fetcher backed by an HTTP transport built from `config`.
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let config = config.sanitized();
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create a fetcher over an arbitrary transport.
    pub fn with_transport(config: FetcherConfig, transport: Arc<dyn ByteTransport>) -> Self {
        let config = config.sanitized();
        let cache = Arc::new(BoundedCache::new(
            config.cache_capacity,
            config.clearance_factor,
        ));
        let coordinator = FetchCoordinator::new(
            transport,
            config.max_concurrent_fetches,
            config.cancel_when_unobserved,
        );

        // Successful payloads land in the cache before fan-out; failures
        // are never cached.
        let populate = Arc::clone(&cache);
        coordinator.set_success_hook(Box::new(move |key, payload| {
            populate.put(key, payload.clone());
        }));

        Self { cache, coordinator }
    }

    /// Fetch the payload for `key` on behalf of `observer`.
    ///
    /// A cache hit completes immediately on the caller's context with
    /// `from_cache = true` and never touches the network. A miss joins or
    /// starts the coordinator's fetch task for the key.
    pub fn fetch(&self, key: &str, observer: &Arc<dyn FetchObserver>) -> Result<(), FetchError> {
        if let Some(payload) = self.cache.get(key) {
            debug!(key, "serving payload from cache");
            observer.on_result(key, Ok(&payload), true);
            return Ok(());
        }
        self.coordinator.request(key, observer)
    }

    /// Withdraw `observer`'s interest in `key` and tell it so.
    ///
    /// A fetch other observers still depend on keeps running.
    pub fn cancel(&self, key: &str, observer: &Arc<dyn FetchObserver>) {
        self.coordinator.detach(key, observer);
        observer.on_cancelled(key);
    }

    /// Silently withdraw `observer`'s interest in every key. Used when the
    /// observer's owner is being torn down or rebound.
    pub fn cancel_all(&self, observer: &Arc<dyn FetchObserver>) {
        self.coordinator.detach_all(observer);
    }

    /// Evict the cached payload for `key` and notify `observer`.
    pub fn evict(&self, key: &str, observer: &Arc<dyn FetchObserver>) {
        self.cache.remove(key);
        observer.on_cache_cleared(key);
    }

    /// Evict every cached payload.
    pub fn evict_all(&self) {
        self.cache.clear();
    }

    /// React to a process-wide low-memory signal by dropping the cache.
    pub fn handle_low_memory(&self) {
        warn!("low-memory signal, clearing payload cache");
        self.cache.clear();
    }

    /// Spawn a background task draining an external low-memory channel into
    /// [`handle_low_memory`]. The task ends when the sender side closes.
    ///
    /// [`handle_low_memory`]: ResourceFetcher::handle_low_memory
    pub fn watch_low_memory(&self, mut signals: mpsc::Receiver<()>) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                warn!("low-memory signal, clearing payload cache");
                cache.clear();
            }
        })
    }

    /// Current cache capacity.
    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Reconfigure the cache capacity for future insertions.
    pub fn set_cache_capacity(&self, capacity: usize) {
        self.cache.set_capacity(capacity);
    }

    /// Number of payloads currently cached.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Number of fetch tasks currently in flight.
    pub fn in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    const KEY: &str = "http://example.com/img1.png";

    struct StubTransport {
        calls: AtomicUsize,
        gate: Semaphore,
        fail: bool,
    }

    impl StubTransport {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                fail: false,
            })
        }

        fn gated() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                fail: true,
            })
        }

        fn release(&self, fetches: usize) {
            self.gate.add_permits(fetches);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ByteTransport for StubTransport {
        async fn fetch_bytes(&self, _key: &str) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            if self.fail {
                Err(FetchError::failed(io::Error::other("stub failure")))
            } else {
                Ok(Bytes::from_static(b"payload"))
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        results: Mutex<Vec<(String, bool, bool)>>,
        cancelled: Mutex<Vec<String>>,
        cleared: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        /// (key, was_ok, from_cache) triples seen so far.
        fn results(&self) -> Vec<(String, bool, bool)> {
            self.results.lock().clone()
        }
    }

    impl FetchObserver for RecordingObserver {
        fn on_result(&self, key: &str, outcome: Result<&Bytes, &FetchError>, from_cache: bool) {
            self.results
                .lock()
                .push((key.to_owned(), outcome.is_ok(), from_cache));
        }

        fn on_cancelled(&self, key: &str) {
            self.cancelled.lock().push(key.to_owned());
        }

        fn on_cache_cleared(&self, key: &str) {
            self.cleared.lock().push(key.to_owned());
        }
    }

    fn observer() -> (Arc<RecordingObserver>, Arc<dyn FetchObserver>) {
        let concrete = Arc::new(RecordingObserver::default());
        let dynamic: Arc<dyn FetchObserver> = concrete.clone();
        (concrete, dynamic)
    }

    fn fetcher(transport: Arc<StubTransport>) -> ResourceFetcher {
        ResourceFetcher::with_transport(FetcherConfig::default(), transport)
    }

    async fn wait_for_results(observer: &RecordingObserver, n: usize) {
        timeout(Duration::from_secs(5), async {
            while observer.results().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for observer deliveries");
    }

    #[tokio::test]
    async fn test_successful_fetch_populates_cache() {
        let transport = StubTransport::open();
        let fetcher = fetcher(transport.clone());

        let (concrete, dynamic) = observer();
        fetcher.fetch(KEY, &dynamic).unwrap();
        wait_for_results(&concrete, 1).await;
        assert_eq!(concrete.results()[0], (KEY.to_owned(), true, false));

        // The payload was cached before fan-out, so the next fetch is
        // answered synchronously without a new transport call.
        fetcher.fetch(KEY, &dynamic).unwrap();
        assert_eq!(concrete.results()[1], (KEY.to_owned(), true, true));
        assert_eq!(transport.calls(), 1);
        assert_eq!(fetcher.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let transport = StubTransport::failing();
        let fetcher = fetcher(transport.clone());

        let (concrete, dynamic) = observer();
        fetcher.fetch(KEY, &dynamic).unwrap();
        wait_for_results(&concrete, 1).await;
        assert_eq!(concrete.results()[0], (KEY.to_owned(), false, false));
        assert_eq!(fetcher.cached_entries(), 0);

        // Wait out the failed task, then retry: the transport is hit again.
        timeout(Duration::from_secs(5), async {
            while fetcher.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        fetcher.fetch(KEY, &dynamic).unwrap();
        wait_for_results(&concrete, 2).await;
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_notifies_observer_but_fetch_completes() {
        let transport = StubTransport::gated();
        let fetcher = fetcher(transport.clone());

        let (leaving, leaving_dyn) = observer();
        let (staying, staying_dyn) = observer();
        fetcher.fetch(KEY, &leaving_dyn).unwrap();
        fetcher.fetch(KEY, &staying_dyn).unwrap();

        fetcher.cancel(KEY, &leaving_dyn);
        assert_eq!(leaving.cancelled.lock().as_slice(), &[KEY.to_owned()]);

        transport.release(1);
        wait_for_results(&staying, 1).await;
        assert!(leaving.results().is_empty());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_is_silent() {
        let transport = StubTransport::gated();
        let fetcher = fetcher(transport.clone());

        let (leaving, leaving_dyn) = observer();
        let (staying, staying_dyn) = observer();
        fetcher.fetch(KEY, &leaving_dyn).unwrap();
        fetcher.fetch(KEY, &staying_dyn).unwrap();

        fetcher.cancel_all(&leaving_dyn);
        assert!(leaving.cancelled.lock().is_empty());

        transport.release(1);
        wait_for_results(&staying, 1).await;
        assert!(leaving.results().is_empty());
    }

    #[tokio::test]
    async fn test_evict_notifies_and_forces_refetch() {
        let transport = StubTransport::open();
        let fetcher = fetcher(transport.clone());

        let (concrete, dynamic) = observer();
        fetcher.fetch(KEY, &dynamic).unwrap();
        wait_for_results(&concrete, 1).await;

        fetcher.evict(KEY, &dynamic);
        assert_eq!(concrete.cleared.lock().as_slice(), &[KEY.to_owned()]);
        assert_eq!(fetcher.cached_entries(), 0);

        fetcher.fetch(KEY, &dynamic).unwrap();
        wait_for_results(&concrete, 2).await;
        assert!(!concrete.results()[1].2, "expected a fresh network fetch");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_evict_all_forces_refetch() {
        let transport = StubTransport::open();
        let fetcher = fetcher(transport.clone());

        let (concrete, dynamic) = observer();
        fetcher.fetch(KEY, &dynamic).unwrap();
        wait_for_results(&concrete, 1).await;
        assert_eq!(fetcher.cached_entries(), 1);

        fetcher.evict_all();
        assert_eq!(fetcher.cached_entries(), 0);

        fetcher.fetch(KEY, &dynamic).unwrap();
        wait_for_results(&concrete, 2).await;
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_low_memory_signal_clears_cache() {
        let transport = StubTransport::open();
        let fetcher = fetcher(transport.clone());

        let (concrete, dynamic) = observer();
        fetcher.fetch(KEY, &dynamic).unwrap();
        wait_for_results(&concrete, 1).await;
        assert_eq!(fetcher.cached_entries(), 1);

        let (tx, rx) = mpsc::channel(1);
        let watcher = fetcher.watch_low_memory(rx);
        tx.send(()).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while fetcher.cached_entries() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cache was not cleared on low-memory signal");

        drop(tx);
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_passthrough() {
        let transport = StubTransport::open();
        let fetcher = fetcher(transport);

        assert_eq!(fetcher.cache_capacity(), 300);
        fetcher.set_cache_capacity(10);
        assert_eq!(fetcher.cache_capacity(), 10);
    }

    #[tokio::test]
    async fn test_invalid_key_surfaces_synchronously() {
        let transport = StubTransport::open();
        let fetcher = fetcher(transport);

        let (_, dynamic) = observer();
        let err = fetcher.fetch("%%%", &dynamic).unwrap_err();
        assert!(matches!(err, FetchError::InvalidKey(_)));
    }
}
