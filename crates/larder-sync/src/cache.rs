//! In-memory cache of remote collections.
//!
//! One [`CacheEntry`] per [`CollectionKey`], shared by every reader of that
//! key. Reads and writes are synchronous and never held across an await, so
//! each edit is atomic with respect to the async tasks interleaving around it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::collection::CollectionRegistry;
use crate::entity::Entity;
use crate::error::SyncError;
use crate::key::CollectionKey;

/// Broadcast channel capacity for cache updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 1024;

/// Fetch status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Never fetched.
    Idle,
    /// A fetch is in flight.
    Loading,
    /// Last fetch succeeded (or data was written directly).
    Success,
    /// Last fetch failed; previous data is kept.
    Error,
}

/// Cached state of one collection key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CollectionKey,
    /// Ordered entities, or `None` if nothing was ever loaded.
    pub data: Option<Vec<Entity>>,
    pub status: QueryStatus,
    /// Error of the last failed fetch, shown alongside stale data.
    pub error: Option<SyncError>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Set by invalidation; forces a refetch on the next read.
    pub invalidated: bool,
}

impl CacheEntry {
    fn new(key: CollectionKey) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            error: None,
            last_updated: None,
            invalidated: false,
        }
    }

    /// Entities, or an empty slice if nothing was loaded.
    pub fn items(&self) -> &[Entity] {
        self.data.as_deref().unwrap_or_default()
    }

    pub fn find(&self, id: &str) -> Option<&Entity> {
        self.items().iter().find(|e| e.id().as_str() == id)
    }

    /// Whether a read should trigger a refetch.
    pub fn is_stale(&self, stale_time: Duration, now: DateTime<Utc>) -> bool {
        if self.data.is_none() || self.invalidated {
            return true;
        }
        match self.last_updated {
            None => true,
            Some(updated) => {
                let window = chrono::Duration::from_std(stale_time)
                    .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
                now.signed_duration_since(updated) > window
            }
        }
    }
}

/// Update event for cache subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdate {
    /// Entities under the key changed.
    Data { key: CollectionKey },
    /// Fetch status changed.
    Status { key: CollectionKey, status: QueryStatus },
    /// The entry was marked stale.
    Invalidated { key: CollectionKey },
}

impl CacheUpdate {
    pub fn key(&self) -> &CollectionKey {
        match self {
            CacheUpdate::Data { key } | CacheUpdate::Status { key, .. } | CacheUpdate::Invalidated { key } => key,
        }
    }
}

/// Process-wide cache of collection entries.
pub struct CacheStore {
    entries: DashMap<CollectionKey, CacheEntry>,
    collections: Arc<CollectionRegistry>,
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl CacheStore {
    /// Create a new empty cache.
    pub fn new(collections: Arc<CollectionRegistry>) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            entries: DashMap::new(),
            collections,
            updates_tx,
        })
    }

    pub fn collections(&self) -> &CollectionRegistry {
        &self.collections
    }

    /// Current entry for `key`, created empty on first access.
    pub fn get(&self, key: &CollectionKey) -> CacheEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone()))
            .clone()
    }

    /// Current entities for `key`, without creating the entry.
    pub fn data(&self, key: &CollectionKey) -> Option<Vec<Entity>> {
        self.entries.get(key).and_then(|e| e.data.clone())
    }

    pub fn status(&self, key: &CollectionKey) -> QueryStatus {
        self.entries
            .get(key)
            .map(|e| e.status)
            .unwrap_or(QueryStatus::Idle)
    }

    /// Replace the entities for `key` and mark the entry fresh.
    pub fn set(&self, key: &CollectionKey, mut data: Vec<Entity>) {
        self.normalize(key, &mut data);
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            entry.data = Some(data);
            entry.status = QueryStatus::Success;
            entry.error = None;
            entry.last_updated = Some(Utc::now());
            entry.invalidated = false;
        }
        trace!(key = %key, "cache: entry set");
        self.broadcast(CacheUpdate::Data { key: key.clone() });
    }

    /// Edit the entities for `key` in place.
    ///
    /// An entry with no data is edited as an empty list and stays absent if
    /// the edit leaves it empty. Ordering and id uniqueness are restored
    /// after the edit. Freshness is not touched.
    pub fn update<F, R>(&self, key: &CollectionKey, f: F) -> R
    where
        F: FnOnce(&mut Vec<Entity>) -> R,
    {
        let result = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            let was_absent = entry.data.is_none();
            let mut data = entry.data.take().unwrap_or_default();
            let result = f(&mut data);
            self.normalize(key, &mut data);
            entry.data = if was_absent && data.is_empty() { None } else { Some(data) };
            result
        };
        trace!(key = %key, "cache: entry updated");
        self.broadcast(CacheUpdate::Data { key: key.clone() });
        result
    }

    /// Edit the entities for `key` only if data is loaded.
    ///
    /// `f` reports whether it changed anything; subscribers are only notified
    /// when it did. Returns `false` when nothing is loaded.
    pub fn update_loaded<F>(&self, key: &CollectionKey, f: F) -> bool
    where
        F: FnOnce(&mut Vec<Entity>) -> bool,
    {
        let changed = {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return false;
            };
            let Some(data) = entry.data.as_mut() else {
                return false;
            };
            let changed = f(data);
            if changed {
                self.normalize(key, data);
            }
            changed
        };
        if changed {
            trace!(key = %key, "cache: loaded entry updated");
            self.broadcast(CacheUpdate::Data { key: key.clone() });
        }
        changed
    }

    /// Put back previously captured data exactly as it was.
    pub fn restore(&self, key: &CollectionKey, data: Option<Vec<Entity>>) {
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            entry.data = data;
        }
        trace!(key = %key, "cache: entry restored");
        self.broadcast(CacheUpdate::Data { key: key.clone() });
    }

    /// Mark `key` stale so the next read refetches. Returns `false` if the
    /// key was never accessed.
    pub fn invalidate(&self, key: &CollectionKey) -> bool {
        let found = match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.invalidated = true;
                true
            }
            None => false,
        };
        if found {
            trace!(key = %key, "cache: entry invalidated");
            self.broadcast(CacheUpdate::Invalidated { key: key.clone() });
        }
        found
    }

    /// Record a status change, optionally with the error that caused it.
    pub fn set_status(&self, key: &CollectionKey, status: QueryStatus, error: Option<SyncError>) {
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            if entry.status == status && entry.error == error {
                return;
            }
            entry.status = status;
            entry.error = error;
        }
        self.broadcast(CacheUpdate::Status {
            key: key.clone(),
            status,
        });
    }

    /// Leave `Loading` after a fetch was abandoned.
    pub(crate) fn reset_loading(&self, key: &CollectionKey) {
        let next = match self.entries.get(key) {
            Some(entry) if entry.status == QueryStatus::Loading => {
                if entry.data.is_some() {
                    QueryStatus::Success
                } else {
                    QueryStatus::Idle
                }
            }
            _ => return,
        };
        self.set_status(key, next, None);
    }

    /// Subscribe to updates for one key.
    pub fn subscribe(&self, key: &CollectionKey) -> CacheSubscription {
        CacheSubscription {
            key: key.clone(),
            rx: self.updates_tx.subscribe(),
        }
    }

    /// Subscribe to updates for every key.
    pub fn subscribe_all(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    pub fn keys(&self) -> Vec<CollectionKey> {
        let mut keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Every cached key of one collection, whatever its scope.
    pub fn keys_for_collection(&self, collection: &str) -> Vec<CollectionKey> {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().collection() == collection)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop every entry (end of session).
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Enforce unique ids and the collection's ordering.
    fn normalize(&self, key: &CollectionKey, data: &mut Vec<Entity>) {
        let mut seen = HashSet::with_capacity(data.len());
        let before = data.len();
        data.retain(|e| seen.insert(e.id().clone()));
        if data.len() != before {
            warn!(key = %key, dropped = before - data.len(), "cache: dropped duplicate ids");
        }

        let spec = self.collections.spec(key.collection());
        if !spec.is_sorted(data) {
            spec.sort(data);
        }
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }
}

/// Receiver of cache updates for a single key.
pub struct CacheSubscription {
    key: CollectionKey,
    rx: broadcast::Receiver<CacheUpdate>,
}

impl CacheSubscription {
    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    /// Wait for the next update to this key.
    pub async fn recv(&mut self) -> Result<CacheUpdate, broadcast::error::RecvError> {
        loop {
            let update = self.rx.recv().await?;
            if update.key() == &self.key {
                return Ok(update);
            }
        }
    }
}
