//! Temporary entities for inserts the remote store has not acknowledged.
//!
//! Temporary ids are `temp-<millis>-<seq>`: a timestamp that never goes
//! backwards within the process plus a sequence number, behind a prefix the
//! store never issues.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::cache::CacheStore;
use crate::entity::{CorrelationId, Entity, EntityId, ID_FIELD, Record, TEMP_ID_PREFIX, timestamp_now};
use crate::key::CollectionKey;

/// Issues temporary entities and swaps them for authoritative ones.
pub struct TempAllocator {
    last_millis: AtomicI64,
    sequence: AtomicU64,
    /// Outstanding temporaries by owning mutation.
    issued: DashMap<CorrelationId, (CollectionKey, EntityId)>,
}

impl TempAllocator {
    pub fn new() -> Self {
        Self {
            last_millis: AtomicI64::new(0),
            sequence: AtomicU64::new(0),
            issued: DashMap::new(),
        }
    }

    /// Build a temporary entity from the fields of a pending insert.
    pub fn allocate(&self, correlation_id: CorrelationId, key: &CollectionKey, mut fields: Record) -> Entity {
        let now = Utc::now().timestamp_millis();
        let millis = self.last_millis.fetch_max(now, Ordering::SeqCst).max(now);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = EntityId::new(format!("{}{}-{}", TEMP_ID_PREFIX, millis, seq));

        fields.remove(ID_FIELD);
        let stamp = timestamp_now();
        for field in ["created_at", "updated_at"] {
            fields
                .entry(field)
                .or_insert_with(|| Value::String(stamp.clone()));
        }

        self.issued.insert(correlation_id, (key.clone(), id.clone()));
        trace!(correlation_id = %correlation_id, id = %id, "temporary entity allocated");
        Entity::new(id, fields)
    }

    /// Temporary id issued to a mutation that has not resolved or released it.
    pub fn temporary_id(&self, correlation_id: &CorrelationId) -> Option<EntityId> {
        self.issued.get(correlation_id).map(|r| r.value().1.clone())
    }

    /// Whether `id` belongs to an outstanding mutation.
    pub fn is_outstanding(&self, id: &EntityId) -> bool {
        self.issued.iter().any(|r| &r.value().1 == id)
    }

    /// Replace the mutation's temporary entity with the authoritative one.
    ///
    /// The authoritative entity takes the temporary one's position; any other
    /// copy with the same id (delivered early by the feed) is dropped. Returns
    /// `false` if the temporary entity is no longer in the cache.
    pub fn resolve(&self, store: &CacheStore, correlation_id: CorrelationId, authoritative: Entity) -> bool {
        let Some((_, (key, temp_id))) = self.issued.remove(&correlation_id) else {
            return false;
        };

        let real_id = authoritative.id().clone();
        let resolved = store.update(&key, |items| {
            let Some(pos) = items.iter().position(|e| e.id() == &temp_id) else {
                return false;
            };
            items[pos] = authoritative;
            let mut index = 0;
            items.retain(|e| {
                let keep = index == pos || e.id() != &real_id;
                index += 1;
                keep
            });
            true
        });

        if resolved {
            debug!(correlation_id = %correlation_id, temp_id = %temp_id, id = %real_id, "temporary entity resolved");
        } else {
            debug!(correlation_id = %correlation_id, temp_id = %temp_id, "temporary entity already gone");
        }
        resolved
    }

    /// Forget a mutation's temporary id (after rollback).
    pub fn release(&self, correlation_id: &CorrelationId) -> Option<EntityId> {
        self.issued.remove(correlation_id).map(|(_, (_, id))| id)
    }

    /// Number of temporaries awaiting resolution.
    pub fn outstanding(&self) -> usize {
        self.issued.len()
    }
}

impl Default for TempAllocator {
    fn default() -> Self {
        Self::new()
    }
}
