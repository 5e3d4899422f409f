//! Optimistic mutations.
//!
//! Each mutation moves through
//! `Idle -> OptimisticApplied -> {Committed | RolledBack} -> Settled`:
//!
//! 1. the actor is checked; without one the mutation fails and the cache is
//!    left alone
//! 2. in-flight fetches for the key are cancelled, a snapshot is captured and
//!    the edit is applied to the cache, all before the first await
//! 3. the remote call runs
//! 4. on success the snapshot is dropped and an inserted temporary entity is
//!    swapped for the authoritative one; on failure the snapshot is restored
//! 5. the entry is invalidated and refetched whatever the outcome
//!
//! Mutations are never retried.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::allocator::TempAllocator;
use crate::cache::CacheStore;
use crate::collection::CollectionSpec;
use crate::config::SyncConfig;
use crate::entity::{CorrelationId, Entity, EntityId, Record};
use crate::error::{RemoteError, SyncError, ValidationError, classify};
use crate::key::CollectionKey;
use crate::query::QueryController;
use crate::remote::{Actor, RemoteStore};
use crate::snapshot::{SnapshotManager, SnapshotTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationPhase {
    Idle,
    OptimisticApplied,
    Committed,
    RolledBack,
    Settled,
}

impl MutationPhase {
    /// Whether `next` may follow this phase.
    pub fn can_transition_to(self, next: MutationPhase) -> bool {
        use MutationPhase::*;
        matches!(
            (self, next),
            (Idle, OptimisticApplied)
                | (OptimisticApplied, Committed)
                | (OptimisticApplied, RolledBack)
                | (Committed, Settled)
                | (RolledBack, Settled)
        )
    }
}

/// Bookkeeping for one in-flight mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub correlation_id: CorrelationId,
    pub key: CollectionKey,
    pub kind: MutationKind,
    /// Entity addressed by an update or delete, or the temporary id of an insert.
    pub target_id: Option<EntityId>,
    pub phase: MutationPhase,
}

/// Mutations between optimistic apply and settle, by correlation id.
#[derive(Debug, Default)]
pub struct MutationLedger {
    records: DashMap<CorrelationId, MutationRecord>,
}

impl MutationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, record: MutationRecord) {
        self.records.insert(record.correlation_id, record);
    }

    /// Move a mutation to `phase`. Returns `false` for unknown mutations and
    /// illegal transitions.
    pub fn transition(&self, correlation_id: &CorrelationId, phase: MutationPhase) -> bool {
        match self.records.get_mut(correlation_id) {
            Some(mut record) if record.phase.can_transition_to(phase) => {
                record.phase = phase;
                true
            }
            Some(record) => {
                warn!(
                    correlation_id = %correlation_id,
                    from = ?record.phase,
                    to = ?phase,
                    "illegal mutation phase transition"
                );
                false
            }
            None => false,
        }
    }

    /// Remove a settled mutation.
    pub fn finish(&self, correlation_id: &CorrelationId) -> Option<MutationRecord> {
        self.records.remove(correlation_id).map(|(_, mut record)| {
            if record.phase.can_transition_to(MutationPhase::Settled) {
                record.phase = MutationPhase::Settled;
            }
            record
        })
    }

    pub fn get(&self, correlation_id: &CorrelationId) -> Option<MutationRecord> {
        self.records.get(correlation_id).map(|r| r.clone())
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.records.contains_key(correlation_id)
    }

    /// [`MutationLedger::contains`] for an id read off the wire.
    pub fn contains_str(&self, correlation_id: &str) -> bool {
        CorrelationId::parse(correlation_id).is_some_and(|id| self.contains(&id))
    }

    /// Number of in-flight mutations on `key`.
    pub fn count_for(&self, key: &CollectionKey) -> usize {
        self.records.iter().filter(|r| &r.key == key).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Undo data handed out by the optimistic apply step.
///
/// Consumed either by commit (dropping the snapshot) or by rollback
/// (restoring it).
#[must_use = "an applied mutation must be committed or rolled back"]
#[derive(Debug)]
pub struct Compensation {
    ticket: SnapshotTicket,
}

/// Result of the optimistic apply step.
#[derive(Debug)]
struct Applied {
    record: MutationRecord,
    compensation: Compensation,
}

enum Edit<'a> {
    Insert(Record),
    Update(&'a EntityId, &'a Record),
    Delete(&'a EntityId),
}

impl Edit<'_> {
    fn kind(&self) -> MutationKind {
        match self {
            Edit::Insert(_) => MutationKind::Insert,
            Edit::Update(..) => MutationKind::Update,
            Edit::Delete(_) => MutationKind::Delete,
        }
    }
}

/// Runs optimistic mutations against the cache and the remote store.
#[derive(Clone)]
pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    queries: QueryController,
    remote: Arc<dyn RemoteStore>,
    snapshots: Arc<SnapshotManager>,
    allocator: Arc<TempAllocator>,
    ledger: Arc<MutationLedger>,
    config: SyncConfig,
}

impl MutationCoordinator {
    pub fn new(
        queries: QueryController,
        remote: Arc<dyn RemoteStore>,
        ledger: Arc<MutationLedger>,
        config: SyncConfig,
    ) -> Self {
        let store = Arc::clone(queries.store());
        Self {
            snapshots: Arc::new(SnapshotManager::new(Arc::clone(&store))),
            allocator: Arc::new(TempAllocator::new()),
            store,
            queries,
            remote,
            ledger,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<MutationLedger> {
        &self.ledger
    }

    pub fn allocator(&self) -> &TempAllocator {
        &self.allocator
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Number of mutations on `key` that have not settled.
    pub fn in_flight(&self, key: &CollectionKey) -> usize {
        self.ledger.count_for(key)
    }

    /// Insert a new entity.
    ///
    /// A temporary entity appears in the cache immediately and is replaced by
    /// the stored one, in the same position, once the remote store accepts it.
    /// Scope fields of `key` missing from `fields` are filled in from the key.
    pub async fn insert(&self, key: &CollectionKey, mut fields: Record) -> Result<Entity, SyncError> {
        let spec = self.store.collections().spec(key.collection());
        let actor = self.require_actor(&spec, None).await?;
        let correlation_id = CorrelationId::new();

        // The row has to land under the key it was inserted through.
        for (field, value) in key.scope() {
            fields
                .entry(field.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }
        if let Some(owner) = &self.config.owner_field {
            fields
                .entry(owner.clone())
                .or_insert_with(|| Value::String(actor.id.clone()));
        }
        self.tag(&mut fields, correlation_id);

        let applied = self.apply_optimistic(correlation_id, key, &spec, Edit::Insert(fields.clone()))?;
        let result = self.remote.insert(key.collection(), fields).await;

        let outcome = match result {
            Ok(entity) => {
                self.commit(applied, Some(entity.clone()));
                Ok(entity)
            }
            Err(e) => Err(self.roll_back(applied, &spec, None, e)),
        };
        self.settle(correlation_id, key).await;
        outcome
    }

    /// Patch an existing entity.
    pub async fn update(&self, key: &CollectionKey, id: &EntityId, mut patch: Record) -> Result<Entity, SyncError> {
        let spec = self.store.collections().spec(key.collection());
        self.require_persisted(&spec, id)?;
        self.require_actor(&spec, Some(id)).await?;
        let correlation_id = CorrelationId::new();
        self.tag(&mut patch, correlation_id);

        let applied = self.apply_optimistic(correlation_id, key, &spec, Edit::Update(id, &patch))?;
        let result = self.remote.update(key.collection(), id, patch).await;

        let outcome = match result {
            Ok(entity) => {
                self.commit(applied, None);
                Ok(entity)
            }
            Err(e) => Err(self.roll_back(applied, &spec, Some(id), e)),
        };
        self.settle(correlation_id, key).await;
        outcome
    }

    /// Delete an entity.
    pub async fn delete(&self, key: &CollectionKey, id: &EntityId) -> Result<(), SyncError> {
        let spec = self.store.collections().spec(key.collection());
        self.require_persisted(&spec, id)?;
        self.require_actor(&spec, Some(id)).await?;
        let correlation_id = CorrelationId::new();

        let applied = self.apply_optimistic(correlation_id, key, &spec, Edit::Delete(id))?;
        let result = self.remote.delete(key.collection(), id).await;

        let outcome = match result {
            Ok(()) => {
                self.commit(applied, None);
                Ok(())
            }
            Err(e) => Err(self.roll_back(applied, &spec, Some(id), e)),
        };
        self.settle(correlation_id, key).await;
        outcome
    }

    async fn require_actor(&self, spec: &CollectionSpec, target: Option<&EntityId>) -> Result<Actor, SyncError> {
        match self.remote.current_actor().await {
            Ok(Some(actor)) => Ok(actor),
            Ok(None) => {
                warn!(collection = %spec.name, "mutation rejected: not signed in");
                Err(SyncError::Authentication("no authenticated user".to_string()))
            }
            Err(e) => {
                let err = classify(spec, target, e);
                warn!(collection = %spec.name, error = %err, "mutation rejected: could not resolve user");
                Err(err)
            }
        }
    }

    /// Temporary entities only exist locally; their own insert resolves them.
    fn require_persisted(&self, spec: &CollectionSpec, id: &EntityId) -> Result<(), SyncError> {
        if id.is_temporary() {
            return Err(ValidationError::Invalid(format!("This {} is still being saved", spec.label)).into());
        }
        Ok(())
    }

    fn tag(&self, fields: &mut Record, correlation_id: CorrelationId) {
        if self.config.echo_correlation_ids {
            fields.insert(
                self.config.correlation_field.clone(),
                Value::String(correlation_id.to_string()),
            );
        }
    }

    /// Cancel fetches, capture the snapshot and edit the cache.
    ///
    /// Synchronous: readers see the edit before the remote call is made.
    fn apply_optimistic(
        &self,
        correlation_id: CorrelationId,
        key: &CollectionKey,
        spec: &CollectionSpec,
        edit: Edit<'_>,
    ) -> Result<Applied, SyncError> {
        self.queries.cancel(key);
        let Some(ticket) = self.snapshots.capture(correlation_id, key) else {
            return Err(ValidationError::Invalid(format!("mutation {} was already applied", correlation_id)).into());
        };
        let kind = edit.kind();

        let target_id = self.store.update(key, |items| match edit {
            Edit::Insert(fields) => {
                let temp = self.allocator.allocate(correlation_id, key, fields);
                let id = temp.id().clone();
                let index = spec.insertion_index(items, &temp);
                items.insert(index, temp);
                Some(id)
            }
            Edit::Update(id, patch) => {
                match items.iter_mut().find(|e| e.id() == id) {
                    Some(entity) => {
                        entity.merge(patch);
                        entity.touch();
                    }
                    None => debug!(key = %key, id = %id, "update target not cached"),
                }
                Some(id.clone())
            }
            Edit::Delete(id) => {
                items.retain(|e| e.id() != id);
                Some(id.clone())
            }
        });

        let record = MutationRecord {
            correlation_id,
            key: key.clone(),
            kind,
            target_id,
            phase: MutationPhase::Idle,
        };
        self.ledger.begin(record.clone());
        self.ledger
            .transition(&correlation_id, MutationPhase::OptimisticApplied);
        debug!(correlation_id = %correlation_id, key = %key, kind = %kind, "optimistic edit applied");

        Ok(Applied {
            record,
            compensation: Compensation { ticket },
        })
    }

    fn commit(&self, applied: Applied, authoritative: Option<Entity>) {
        let Applied { record, compensation } = applied;
        self.snapshots.discard(compensation.ticket);
        if let Some(entity) = authoritative {
            self.allocator
                .resolve(&self.store, record.correlation_id, entity);
        }
        self.ledger
            .transition(&record.correlation_id, MutationPhase::Committed);
        debug!(correlation_id = %record.correlation_id, key = %record.key, kind = %record.kind, "mutation committed");
    }

    fn roll_back(&self, applied: Applied, spec: &CollectionSpec, target: Option<&EntityId>, err: RemoteError) -> SyncError {
        let Applied { record, compensation } = applied;
        let err = classify(spec, target, err);

        self.snapshots.restore(compensation.ticket);
        self.allocator.release(&record.correlation_id);
        self.prune_orphans(&record.key);
        self.ledger
            .transition(&record.correlation_id, MutationPhase::RolledBack);

        warn!(
            correlation_id = %record.correlation_id,
            key = %record.key,
            kind = %record.kind,
            error = %err,
            "mutation rolled back"
        );
        err
    }

    /// Drop temporaries whose mutation is gone.
    ///
    /// A snapshot taken while another insert on the same key was in flight
    /// holds that insert's temporary entity; if the insert finished in the
    /// meantime, restoring the snapshot brings the temporary back with no
    /// owner left to resolve it.
    fn prune_orphans(&self, key: &CollectionKey) {
        let pruned = self.store.update_loaded(key, |items| {
            let before = items.len();
            items.retain(|e| !e.is_temporary() || self.allocator.is_outstanding(e.id()));
            items.len() != before
        });
        if pruned {
            debug!(key = %key, "pruned orphaned temporary entities");
        }
    }

    async fn settle(&self, correlation_id: CorrelationId, key: &CollectionKey) {
        self.queries.invalidate(key);
        if let Some(record) = self.ledger.finish(&correlation_id) {
            info!(
                correlation_id = %correlation_id,
                key = %key,
                kind = %record.kind,
                phase = ?record.phase,
                "mutation settled"
            );
        }
        if let Err(e) = self.queries.refetch(key).await {
            warn!(key = %key, error = %e, "refetch after mutation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use MutationPhase::*;
        assert!(Idle.can_transition_to(OptimisticApplied));
        assert!(OptimisticApplied.can_transition_to(Committed));
        assert!(OptimisticApplied.can_transition_to(RolledBack));
        assert!(RolledBack.can_transition_to(Settled));
        assert!(!Idle.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(RolledBack));
        assert!(!Settled.can_transition_to(Idle));
    }

    #[test]
    fn test_ledger_tracks_phases() {
        let ledger = MutationLedger::new();
        let id = CorrelationId::new();
        let key = CollectionKey::new("categories");
        ledger.begin(MutationRecord {
            correlation_id: id,
            key: key.clone(),
            kind: MutationKind::Insert,
            target_id: None,
            phase: MutationPhase::Idle,
        });

        assert!(ledger.transition(&id, MutationPhase::OptimisticApplied));
        assert!(!ledger.transition(&id, MutationPhase::Settled));
        assert!(ledger.transition(&id, MutationPhase::Committed));
        assert_eq!(ledger.count_for(&key), 1);
        assert!(ledger.contains_str(&id.to_string()));
        assert!(!ledger.contains_str("not-a-uuid"));

        let finished = ledger.finish(&id).unwrap();
        assert_eq!(finished.phase, MutationPhase::Settled);
        assert!(ledger.is_empty());
        assert!(!ledger.transition(&id, MutationPhase::Settled));
    }
}
