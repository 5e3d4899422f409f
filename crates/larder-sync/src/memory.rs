//! In-process backend implementing both collaborator contracts.
//!
//! Behaves like the hosted store closely enough to exercise the sync layer:
//! unique constraints fail with the unique-violation code, missing targets
//! fail with not-found, and every committed write is pushed to change-feed
//! subscribers. Failures and latency can be injected per operation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::collection::sort_by_keys;
use crate::entity::{Entity, EntityId, ID_FIELD, Record, timestamp_now};
use crate::error::{RemoteError, UNIQUE_VIOLATION_CODE};
use crate::key::{Filter, filter_matches};
use crate::remote::{
    Actor, ChangeFeed, ChangeFeedEvent, ChangeKind, FeedMessage, FeedStream, FetchRequest, RemoteStore,
};

const FEED_CHANNEL_CAPACITY: usize = 256;

/// Collaborator call, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Fetch,
    Insert,
    Update,
    Delete,
    CurrentActor,
}

/// Tables, constraints and a change feed held in memory.
pub struct MemoryBackend {
    tables: DashMap<String, Vec<Entity>>,
    unique: DashMap<String, Vec<String>>,
    next_id: AtomicU64,
    actor: RwLock<Option<Actor>>,
    failures: DashMap<Operation, VecDeque<RemoteError>>,
    calls: DashMap<Operation, usize>,
    latency_ms: AtomicU64,
    op_latency: DashMap<Operation, Duration>,
    feed_tx: broadcast::Sender<(String, FeedMessage)>,
    subscriptions: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Empty backend with a signed-in actor `user-1`.
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        Self {
            tables: DashMap::new(),
            unique: DashMap::new(),
            next_id: AtomicU64::new(1),
            actor: RwLock::new(Some(Actor {
                id: "user-1".to_string(),
                email: None,
            })),
            failures: DashMap::new(),
            calls: DashMap::new(),
            latency_ms: AtomicU64::new(0),
            op_latency: DashMap::new(),
            feed_tx,
            subscriptions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Builder-style [`MemoryBackend::set_actor`].
    pub fn with_actor(self, actor: Option<Actor>) -> Self {
        self.set_actor(actor);
        self
    }

    pub fn set_actor(&self, actor: Option<Actor>) {
        *self.actor.write().unwrap_or_else(|e| e.into_inner()) = actor;
    }

    /// Reject inserts and updates that repeat an existing value of `field`.
    pub fn unique(&self, collection: &str, field: &str) {
        self.unique
            .entry(collection.to_string())
            .or_default()
            .push(field.to_string());
    }

    /// Add rows without publishing feed events. Rows without an id get one.
    pub fn seed(&self, collection: &str, rows: impl IntoIterator<Item = Value>) {
        for row in rows {
            let Value::Object(mut record) = row else {
                continue;
            };
            let entity = match Entity::from_record(record.clone()) {
                Some(entity) => entity,
                None => {
                    record.remove(ID_FIELD);
                    Entity::new(self.allocate_id(collection), record)
                }
            };
            self.tables
                .entry(collection.to_string())
                .or_default()
                .push(entity);
        }
    }

    /// Stored rows of a collection, in insertion order.
    pub fn rows(&self, collection: &str) -> Vec<Entity> {
        self.tables
            .get(collection)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Push a message to feed subscribers of `collection`.
    pub fn publish(&self, collection: &str, message: FeedMessage) {
        if self.feed_tx.send((collection.to_string(), message)).is_err() {
            trace!(collection, "no feed subscribers");
        }
    }

    /// Make the next call of `op` fail with `err`. Failures queue up.
    pub fn fail_next(&self, op: Operation, err: RemoteError) {
        self.failures.entry(op).or_default().push_back(err);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Delay calls of `op` by `latency`, overriding [`MemoryBackend::set_latency`].
    pub fn set_operation_latency(&self, op: Operation, latency: Duration) {
        self.op_latency.insert(op, latency);
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: Operation) -> usize {
        self.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Open feed subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: Operation) -> Result<(), RemoteError> {
        *self.calls.entry(op).or_insert(0) += 1;
        let latency = match self.op_latency.get(&op) {
            Some(latency) => *latency,
            None => Duration::from_millis(self.latency_ms.load(Ordering::SeqCst)),
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let injected = self.failures.get_mut(&op).and_then(|mut q| q.pop_front());
        match injected {
            Some(err) => {
                debug!(?op, error = %err, "memory backend: injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn allocate_id(&self, collection: &str) -> EntityId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            let taken = self
                .tables
                .get(collection)
                .is_some_and(|t| t.iter().any(|e| e.id().as_str() == id));
            if !taken {
                return EntityId::new(id);
            }
        }
    }

    fn check_unique(&self, collection: &str, record: &Record, except: Option<&EntityId>) -> Result<(), RemoteError> {
        let Some(fields) = self.unique.get(collection) else {
            return Ok(());
        };
        let Some(rows) = self.tables.get(collection) else {
            return Ok(());
        };
        for field in fields.iter() {
            let Some(value) = record.get(field) else {
                continue;
            };
            let clash = rows
                .iter()
                .filter(|e| Some(e.id()) != except)
                .any(|e| e.get(field) == Some(value));
            if clash {
                return Err(RemoteError::Api {
                    status: 409,
                    code: Some(UNIQUE_VIOLATION_CODE.to_string()),
                    message: format!(
                        "duplicate key value violates unique constraint \"{}_{}_key\"",
                        collection, field
                    ),
                });
            }
        }
        Ok(())
    }

    fn emit(&self, collection: &str, kind: ChangeKind, record: Entity) {
        self.publish(collection, FeedMessage::Event(ChangeFeedEvent { kind, record }));
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryBackend {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Entity>, RemoteError> {
        self.enter(Operation::Fetch).await?;
        let mut rows: Vec<Entity> = self
            .rows(&request.collection)
            .into_iter()
            .filter(|e| filter_matches(&request.filter, e.fields()))
            .collect();
        sort_by_keys(&request.order, &mut rows);
        Ok(rows)
    }

    async fn insert(&self, collection: &str, mut fields: Record) -> Result<Entity, RemoteError> {
        self.enter(Operation::Insert).await?;
        self.check_unique(collection, &fields, None)?;

        fields.remove(ID_FIELD);
        let stamp = timestamp_now();
        for field in ["created_at", "updated_at"] {
            fields
                .entry(field)
                .or_insert_with(|| Value::String(stamp.clone()));
        }
        let entity = Entity::new(self.allocate_id(collection), fields);
        self.tables
            .entry(collection.to_string())
            .or_default()
            .push(entity.clone());

        self.emit(collection, ChangeKind::Insert, entity.clone());
        Ok(entity)
    }

    async fn update(&self, collection: &str, id: &EntityId, patch: Record) -> Result<Entity, RemoteError> {
        self.enter(Operation::Update).await?;
        self.check_unique(collection, &patch, Some(id))?;

        let updated = {
            let mut table = self.tables.entry(collection.to_string()).or_default();
            let entity = table
                .iter_mut()
                .find(|e| e.id() == id)
                .ok_or_else(|| RemoteError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            entity.merge(&patch);
            entity.touch();
            entity.clone()
        };

        self.emit(collection, ChangeKind::Update, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, collection: &str, id: &EntityId) -> Result<(), RemoteError> {
        self.enter(Operation::Delete).await?;
        let removed = {
            let mut table = self.tables.entry(collection.to_string()).or_default();
            let before = table.len();
            table.retain(|e| e.id() != id);
            table.len() != before
        };
        if !removed {
            return Err(RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        self.emit(collection, ChangeKind::Delete, Entity::new(id.clone(), Record::new()));
        Ok(())
    }

    async fn current_actor(&self) -> Result<Option<Actor>, RemoteError> {
        self.enter(Operation::CurrentActor).await?;
        Ok(self.actor.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, collection: &str, filter: &Filter) -> Result<FeedStream, RemoteError> {
        let rx = self.feed_tx.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        debug!(collection, "memory backend: feed subscribed");

        let state = (rx, stop_rx, collection.to_string(), filter.clone());
        let events = stream::unfold(state, |(mut rx, mut stop, collection, filter)| async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => return None,
                    received = rx.recv() => match received {
                        Ok((target, message)) => {
                            if target != collection || !passes(&filter, &message) {
                                continue;
                            }
                            return Some((message, (rx, stop, collection, filter)));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            return Some((FeedMessage::Resync, (rx, stop, collection, filter)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        })
        .boxed();

        let subscriptions = Arc::clone(&self.subscriptions);
        let collection = collection.to_string();
        Ok(FeedStream {
            events,
            unsubscribe: Box::new(move || {
                let _ = stop_tx.send(true);
                subscriptions.fetch_sub(1, Ordering::SeqCst);
                debug!(collection = %collection, "memory backend: feed unsubscribed");
            }),
        })
    }
}

/// Server-side filtering: deletes carry only the id and always pass.
fn passes(filter: &Filter, message: &FeedMessage) -> bool {
    match message {
        FeedMessage::Event(event) if event.kind != ChangeKind::Delete => {
            filter_matches(filter, event.record.fields())
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SortKey;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_latency_saturates_instead_of_wrapping() {
        let backend = MemoryBackend::new();
        backend.set_latency(Duration::MAX);
        assert_eq!(backend.latency_ms.load(Ordering::SeqCst), u64::MAX);

        backend.set_latency(Duration::from_millis(1500));
        assert_eq!(backend.latency_ms.load(Ordering::SeqCst), 1500);
    }

    #[tokio::test]
    async fn test_operation_latency_overrides_global() {
        let backend = MemoryBackend::new();
        backend.set_latency(Duration::from_secs(60));
        backend.set_operation_latency(Operation::Fetch, Duration::ZERO);

        let request = FetchRequest::for_key(&crate::key::CollectionKey::new("recipes"), &[]);
        let rows = tokio::time::timeout(Duration::from_secs(1), backend.fetch(&request))
            .await
            .expect("fetch used the global latency")
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_insert_assigns_fresh_ids() {
        let backend = MemoryBackend::new();
        backend.seed("categories", vec![json!({"id": "1", "name": "Bakery"})]);

        let created = backend
            .insert("categories", record(json!({"name": "Dairy"})))
            .await
            .unwrap();
        assert_eq!(created.id().as_str(), "2");
        assert!(created.get_str("created_at").is_some());
        assert_eq!(backend.rows("categories").len(), 2);
    }

    #[tokio::test]
    async fn test_unique_violation_code() {
        let backend = MemoryBackend::new();
        backend.unique("categories", "name");
        backend.seed("categories", vec![json!({"id": "1", "name": "Dairy"})]);

        let err = backend
            .insert("categories", record(json!({"name": "Dairy"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(UNIQUE_VIOLATION_CODE));

        // Renaming a row to its own name is fine.
        backend
            .update("categories", &EntityId::new("1"), record(json!({"name": "Dairy"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_targets_are_not_found() {
        let backend = MemoryBackend::new();
        let id = EntityId::new("42");

        let err = backend.delete("food_items", &id).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound { .. }));
        let err = backend
            .update("food_items", &id, Record::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetch_filters_and_orders() {
        let backend = MemoryBackend::new();
        backend.seed(
            "meal_plans",
            vec![
                json!({"id": "1", "user_id": "u1", "planned_for": "2024-03-02"}),
                json!({"id": "2", "user_id": "u2", "planned_for": "2024-03-01"}),
                json!({"id": "3", "user_id": "u1", "planned_for": "2024-03-01"}),
            ],
        );

        let mut filter = Filter::new();
        filter.insert("user_id".to_string(), "u1".to_string());
        let rows = backend
            .fetch(&FetchRequest {
                collection: "meal_plans".to_string(),
                filter,
                order: vec![SortKey::asc("planned_for")],
            })
            .await
            .unwrap();

        let ids: Vec<_> = rows.iter().map(|e| e.id().as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);
    }

    #[tokio::test]
    async fn test_feed_publishes_writes_until_unsubscribed() {
        let backend = MemoryBackend::new();
        let mut feed = ChangeFeed::subscribe(&backend, "food_items", &Filter::new())
            .await
            .unwrap();
        assert_eq!(backend.subscriptions(), 1);

        let created = backend
            .insert("food_items", record(json!({"name": "Eggs"})))
            .await
            .unwrap();
        backend.delete("food_items", created.id()).await.unwrap();

        match feed.events.next().await {
            Some(FeedMessage::Event(event)) => {
                assert_eq!(event.kind, ChangeKind::Insert);
                assert_eq!(event.record, created);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(
            feed.events.next().await,
            Some(FeedMessage::Event(ChangeFeedEvent::delete(created.id().clone())))
        );

        (feed.unsubscribe)();
        assert_eq!(backend.subscriptions(), 0);
        assert_eq!(feed.events.next().await, None);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let backend = MemoryBackend::new().with_actor(None);
        backend.fail_next(Operation::CurrentActor, RemoteError::Network("down".into()));

        assert!(backend.current_actor().await.is_err());
        assert_eq!(backend.current_actor().await.unwrap(), None);
        assert_eq!(backend.calls(Operation::CurrentActor), 2);
    }
}
