//! Pre-mutation snapshots of cache entries.
//!
//! A snapshot is taken synchronously before an optimistic edit and before
//! any await point, so the data it holds is exactly what readers saw
//! immediately before the mutation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::entity::{CorrelationId, Entity};
use crate::key::CollectionKey;

/// Saved entry data for one in-flight mutation.
#[derive(Debug, Clone)]
struct Snapshot {
    key: CollectionKey,
    data: Option<Vec<Entity>>,
    taken_at: DateTime<Utc>,
}

/// Claim on a captured snapshot.
///
/// Consumed by exactly one of [`SnapshotManager::restore`] or
/// [`SnapshotManager::discard`], so a snapshot can be used at most once and
/// belongs to a single mutation.
#[must_use = "a captured snapshot must be restored or discarded"]
#[derive(Debug)]
pub struct SnapshotTicket {
    correlation_id: CorrelationId,
    key: CollectionKey,
}

impl SnapshotTicket {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn key(&self) -> &CollectionKey {
        &self.key
    }
}

/// Holds one snapshot per in-flight mutation.
pub struct SnapshotManager {
    store: Arc<CacheStore>,
    snapshots: DashMap<CorrelationId, Snapshot>,
}

impl SnapshotManager {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            snapshots: DashMap::new(),
        }
    }

    /// Record the current data for `key` under `correlation_id`.
    ///
    /// Returns `None` if that mutation already holds a snapshot.
    pub fn capture(&self, correlation_id: CorrelationId, key: &CollectionKey) -> Option<SnapshotTicket> {
        match self.snapshots.entry(correlation_id) {
            Entry::Occupied(_) => {
                warn!(correlation_id = %correlation_id, key = %key, "snapshot already captured for mutation");
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(Snapshot {
                    key: key.clone(),
                    data: self.store.data(key),
                    taken_at: Utc::now(),
                });
                debug!(correlation_id = %correlation_id, key = %key, "snapshot captured");
                Some(SnapshotTicket {
                    correlation_id,
                    key: key.clone(),
                })
            }
        }
    }

    /// Write the captured data back into the cache verbatim.
    pub fn restore(&self, ticket: SnapshotTicket) -> bool {
        match self.snapshots.remove(&ticket.correlation_id) {
            Some((_, snapshot)) => {
                let held_ms = Utc::now()
                    .signed_duration_since(snapshot.taken_at)
                    .num_milliseconds();
                self.store.restore(&snapshot.key, snapshot.data);
                debug!(
                    correlation_id = %ticket.correlation_id,
                    key = %ticket.key,
                    held_ms,
                    "snapshot restored"
                );
                true
            }
            None => {
                warn!(correlation_id = %ticket.correlation_id, "no snapshot to restore");
                false
            }
        }
    }

    /// Drop the captured data without touching the cache.
    pub fn discard(&self, ticket: SnapshotTicket) {
        self.snapshots.remove(&ticket.correlation_id);
    }

    /// Data captured for a mutation, if it is still held.
    pub fn peek(&self, correlation_id: &CorrelationId) -> Option<Option<Vec<Entity>>> {
        self.snapshots.get(correlation_id).map(|s| s.data.clone())
    }

    /// Number of snapshots currently held.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionRegistry;
    use crate::entity::{EntityId, Record};

    fn setup() -> (Arc<CacheStore>, SnapshotManager, CollectionKey) {
        let store = CacheStore::new(Arc::new(CollectionRegistry::default()));
        let manager = SnapshotManager::new(Arc::clone(&store));
        let key = CollectionKey::new("categories");
        store.set(&key, vec![Entity::new(EntityId::new("1"), Record::new()).with("name", "Dairy")]);
        (store, manager, key)
    }

    #[test]
    fn test_restore_puts_back_captured_data() {
        let (store, manager, key) = setup();
        let before = store.data(&key);
        let id = CorrelationId::new();

        let ticket = manager.capture(id, &key).unwrap();
        store.update(&key, |items| items.clear());
        assert_eq!(manager.peek(&id), Some(before.clone()));

        assert!(manager.restore(ticket));
        assert_eq!(store.data(&key), before);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_capture_of_absent_entry_restores_absent() {
        let (store, manager, _) = setup();
        let key = CollectionKey::new("recipes");

        let ticket = manager.capture(CorrelationId::new(), &key).unwrap();
        store.update(&key, |items| {
            items.push(Entity::new(EntityId::new("temp-1-0"), Record::new()))
        });
        manager.restore(ticket);

        assert_eq!(store.data(&key), None);
    }

    #[test]
    fn test_one_snapshot_per_mutation() {
        let (_, manager, key) = setup();
        let id = CorrelationId::new();

        let ticket = manager.capture(id, &key).unwrap();
        assert!(manager.capture(id, &key).is_none());
        assert_eq!(manager.len(), 1);

        let other = manager.capture(CorrelationId::new(), &key).unwrap();
        assert_eq!(manager.len(), 2);

        manager.discard(ticket);
        manager.discard(other);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_discard_leaves_cache_alone() {
        let (store, manager, key) = setup();
        let ticket = manager.capture(CorrelationId::new(), &key).unwrap();

        store.update(&key, |items| items.clear());
        manager.discard(ticket);

        assert_eq!(store.data(&key), Some(vec![]));
    }
}
