//! Deduplicated, cancellable fetches into the cache.
//!
//! At most one fetch per key is in flight; concurrent callers share its
//! outcome. Every fetch carries a generation number and only writes to the
//! cache if it is still the current fetch for its key when it completes, so
//! cancelling a fetch suppresses its effect without stopping the remote call.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheStore, QueryStatus};
use crate::config::SyncConfig;
use crate::entity::Entity;
use crate::error::{RemoteError, SyncError, classify};
use crate::key::CollectionKey;
use crate::remote::{FetchRequest, RemoteStore};

type FetchOutcome = Result<Vec<Entity>, SyncError>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

struct InFlight {
    generation: u64,
    future: SharedFetch,
}

struct QueryState {
    store: Arc<CacheStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    inflight: DashMap<CollectionKey, InFlight>,
    generation: AtomicU64,
}

/// Loads collection keys from the remote store into the cache.
#[derive(Clone)]
pub struct QueryController {
    state: Arc<QueryState>,
}

impl QueryController {
    pub fn new(store: Arc<CacheStore>, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self {
            state: Arc::new(QueryState {
                store,
                remote,
                config,
                inflight: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.state.store
    }

    /// Fetch `key` from the remote store in its collection's order.
    pub async fn fetch(&self, key: &CollectionKey) -> FetchOutcome {
        let spec = self.state.store.collections().spec(key.collection());
        let request = FetchRequest::for_key(key, &spec.order);
        let remote = Arc::clone(&self.state.remote);
        self.fetch_with(key, move || {
            let remote = Arc::clone(&remote);
            let request = request.clone();
            async move { remote.fetch(&request).await }
        })
        .await
    }

    /// Fetch `key` with a custom loader.
    ///
    /// If a fetch for `key` is already in flight, waits for that one instead
    /// and `loader` is never called. The loader may be called more than once
    /// when network failures are retried.
    pub async fn fetch_with<L, Fut>(&self, key: &CollectionKey, loader: L) -> FetchOutcome
    where
        L: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Entity>, RemoteError>> + Send + 'static,
    {
        let future = match self.state.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                trace!(key = %key, "joining in-flight fetch");
                existing.get().future.clone()
            }
            Entry::Vacant(slot) => {
                let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let future = run_fetch(Arc::clone(&self.state), key.clone(), generation, loader)
                    .boxed()
                    .shared();
                slot.insert(InFlight {
                    generation,
                    future: future.clone(),
                });
                self.state.store.set_status(key, QueryStatus::Loading, None);
                debug!(key = %key, generation, "fetch started");
                future
            }
        };
        future.await
    }

    /// Current entry for `key`, starting a background refetch if it is stale.
    ///
    /// Outside a tokio runtime the entry is returned without refetching.
    pub fn query(&self, key: &CollectionKey) -> CacheEntry {
        let entry = self.state.store.get(key);
        if entry.is_stale(self.state.config.stale_time(), Utc::now()) && !self.is_fetching(key) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let this = self.clone();
                    let key = key.clone();
                    handle.spawn(async move {
                        if let Err(e) = this.fetch(&key).await {
                            debug!(key = %key, error = %e, "background refetch failed");
                        }
                    });
                }
                Err(_) => trace!(key = %key, "no runtime, skipping background refetch"),
            }
        }
        entry
    }

    /// Cancel any in-flight fetch and fetch again.
    pub async fn refetch(&self, key: &CollectionKey) -> FetchOutcome {
        self.cancel(key);
        self.fetch(key).await
    }

    /// Ignore the result of the in-flight fetch for `key`, if any.
    ///
    /// The remote call itself keeps running; callers already waiting on it
    /// still receive its outcome, but the cache is left alone.
    pub fn cancel(&self, key: &CollectionKey) -> bool {
        match self.state.inflight.remove(key) {
            Some((_, cancelled)) => {
                debug!(key = %key, generation = cancelled.generation, "fetch cancelled");
                self.state.store.reset_loading(key);
                true
            }
            None => false,
        }
    }

    /// Mark `key` stale so the next read refetches.
    pub fn invalidate(&self, key: &CollectionKey) -> bool {
        self.state.store.invalidate(key)
    }

    pub fn is_fetching(&self, key: &CollectionKey) -> bool {
        self.state.inflight.contains_key(key)
    }
}

async fn run_fetch<L, Fut>(state: Arc<QueryState>, key: CollectionKey, generation: u64, loader: L) -> FetchOutcome
where
    L: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Entity>, RemoteError>> + Send + 'static,
{
    let spec = state.store.collections().spec(key.collection());
    let mut backoff = ExponentialBackoff {
        initial_interval: state.config.retry_initial_interval(),
        max_interval: state.config.retry_max_interval(),
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();

    let mut attempt = 0u32;
    let outcome = loop {
        match loader().await {
            Ok(items) => break Ok(items),
            Err(e) => {
                let err = classify(&spec, None, e);
                if !err.is_retryable() || attempt >= state.config.fetch_retries {
                    break Err(err);
                }
                attempt += 1;
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| state.config.retry_max_interval());
                warn!(
                    key = %key,
                    attempt,
                    max_retries = state.config.fetch_retries,
                    ?delay,
                    error = %err,
                    "fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    // Apply while holding the in-flight slot so a cancel cannot interleave.
    match state.inflight.entry(key.clone()) {
        Entry::Occupied(current) if current.get().generation == generation => {
            match &outcome {
                Ok(items) => {
                    state.store.set(&key, items.clone());
                    debug!(key = %key, generation, count = items.len(), "fetch applied");
                }
                Err(err) => {
                    state
                        .store
                        .set_status(&key, QueryStatus::Error, Some(err.clone()));
                    warn!(key = %key, error = %err, "fetch failed, keeping cached data");
                }
            }
            current.remove();
        }
        _ => debug!(key = %key, generation, "discarding result of cancelled fetch"),
    }

    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::collection::CollectionRegistry;
    use crate::entity::{EntityId, Record};
    use crate::memory::{MemoryBackend, Operation};
    use serde_json::json;

    fn entity(id: &str, name: &str) -> Entity {
        Entity::new(EntityId::new(id), Record::new()).with("name", name)
    }

    fn controller(config: SyncConfig) -> (QueryController, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = CacheStore::new(Arc::new(CollectionRegistry::default()));
        let remote: Arc<dyn RemoteStore> = backend.clone();
        (QueryController::new(store, remote, config), backend)
    }

    fn fast_retries() -> SyncConfig {
        SyncConfig::builder()
            .retry_interval_ms(1, 2)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_sorts_into_cache() {
        let (queries, backend) = controller(SyncConfig::default());
        backend.seed("categories", vec![json!({"id": "2", "name": "Produce"}), json!({"id": "1", "name": "Bakery"})]);
        let key = CollectionKey::new("categories");

        let items = queries.fetch(&key).await.unwrap();
        assert_eq!(items.len(), 2);

        let entry = queries.store().get(&key);
        assert_eq!(entry.status, QueryStatus::Success);
        let names: Vec<_> = entry.items().iter().filter_map(|e| e.get_str("name")).collect();
        assert_eq!(names, vec!["Bakery", "Produce"]);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_call() {
        let (queries, _) = controller(SyncConfig::default());
        let key = CollectionKey::new("categories");
        let calls = Arc::new(AtomicUsize::new(0));

        let loader = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(vec![entity("1", "Dairy")])
                }
            }
        };
        let (a, b) = tokio::join!(queries.fetch_with(&key, loader.clone()), queries.fetch_with(&key, loader));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!queries.is_fetching(&key));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_does_not_touch_cache() {
        let (queries, _) = controller(SyncConfig::default());
        let key = CollectionKey::new("categories");
        queries.store().set(&key, vec![entity("1", "Dairy")]);

        let fetch = {
            let queries = queries.clone();
            let key = key.clone();
            tokio::spawn(async move {
                queries
                    .fetch_with(&key, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(vec![])
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queries.is_fetching(&key));
        assert!(queries.cancel(&key));
        assert_eq!(queries.store().status(&key), QueryStatus::Success);

        let outcome = fetch.await.unwrap().unwrap();
        assert!(outcome.is_empty());
        assert_eq!(queries.store().data(&key), Some(vec![entity("1", "Dairy")]));
    }

    #[tokio::test]
    async fn test_network_errors_are_retried() {
        let (queries, backend) = controller(fast_retries());
        backend.seed("categories", vec![json!({"id": "1", "name": "Dairy"})]);
        backend.fail_next(Operation::Fetch, RemoteError::Network("connection reset".into()));
        backend.fail_next(Operation::Fetch, RemoteError::Network("connection reset".into()));
        let key = CollectionKey::new("categories");

        let items = queries.fetch(&key).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(backend.calls(Operation::Fetch), 3);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_stale_data() {
        let config = SyncConfig::builder()
            .fetch_retries(1)
            .retry_interval_ms(1, 2)
            .build()
            .unwrap();
        let (queries, backend) = controller(config);
        let key = CollectionKey::new("categories");
        queries.store().set(&key, vec![entity("1", "Dairy")]);
        for _ in 0..2 {
            backend.fail_next(Operation::Fetch, RemoteError::Network("offline".into()));
        }

        let err = queries.fetch(&key).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert_eq!(backend.calls(Operation::Fetch), 2);

        let entry = queries.store().get(&key);
        assert_eq!(entry.status, QueryStatus::Error);
        assert_eq!(entry.error, Some(err));
        assert_eq!(entry.data, Some(vec![entity("1", "Dairy")]));
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let (queries, backend) = controller(fast_retries());
        backend.fail_next(
            Operation::Fetch,
            RemoteError::Api {
                status: 400,
                code: None,
                message: "bad filter".into(),
            },
        );
        let key = CollectionKey::new("categories");

        assert!(queries.fetch(&key).await.is_err());
        assert_eq!(backend.calls(Operation::Fetch), 1);
    }

    #[tokio::test]
    async fn test_query_refetches_invalidated_entry() {
        let (queries, backend) = controller(SyncConfig::default());
        backend.seed("categories", vec![json!({"id": "1", "name": "Dairy"})]);
        let key = CollectionKey::new("categories");
        queries.store().set(&key, vec![]);

        let entry = queries.query(&key);
        assert_eq!(entry.data, Some(vec![]));
        assert_eq!(backend.calls(Operation::Fetch), 0);

        queries.invalidate(&key);
        let mut updates = queries.store().subscribe(&key);
        queries.query(&key);
        tokio::time::timeout(Duration::from_secs(1), async {
            while queries.store().data(&key).map(|d| d.len()) != Some(1) {
                updates.recv().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(!queries.store().get(&key).invalidated);
    }
}
