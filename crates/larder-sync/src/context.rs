//! Session-scoped wiring of the sync layer.
//!
//! A [`SyncContext`] is built once per signed-in session and owns the
//! cache together with every component that reads or writes it. Consumers
//! take a [`CollectionHandle`] for the key they display.

use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheEntry, CacheStore, CacheSubscription};
use crate::collection::{CollectionRegistry, CollectionSpec};
use crate::config::{ConfigError, SyncConfig};
use crate::entity::{Entity, EntityId, Record};
use crate::error::SyncError;
use crate::feed::{ChangeFeedListener, Subscription};
use crate::key::CollectionKey;
use crate::mutation::{MutationCoordinator, MutationLedger};
use crate::query::QueryController;
use crate::remote::{ChangeFeed, RemoteStore};

/// Owns the cache and its controllers for one session.
pub struct SyncContext {
    store: Arc<CacheStore>,
    queries: QueryController,
    mutations: MutationCoordinator,
    listener: ChangeFeedListener,
    config: SyncConfig,
}

impl SyncContext {
    pub fn builder(remote: Arc<dyn RemoteStore>) -> SyncContextBuilder {
        SyncContextBuilder::new(remote)
    }

    /// Handle for reading and mutating one collection key.
    pub fn collection(&self, key: CollectionKey) -> CollectionHandle<'_> {
        CollectionHandle { ctx: self, key }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn queries(&self) -> &QueryController {
        &self.queries
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn listener(&self) -> &ChangeFeedListener {
        &self.listener
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Drop every cached entry at the end of the session.
    pub fn end(&self) {
        for key in self.store.keys() {
            self.queries.cancel(&key);
        }
        self.store.clear();
        info!("sync session ended, cache cleared");
    }
}

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
    remote: Arc<dyn RemoteStore>,
    feed: Option<Arc<dyn ChangeFeed>>,
    config: SyncConfig,
    collections: CollectionRegistry,
}

impl SyncContextBuilder {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote,
            feed: None,
            config: SyncConfig::default(),
            collections: CollectionRegistry::default(),
        }
    }

    /// Attach a change feed. Without one, keys converge through settle-time
    /// refetches only.
    pub fn feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the collection definitions.
    pub fn collections(mut self, collections: CollectionRegistry) -> Self {
        self.collections = collections;
        self
    }

    /// Add or override one collection definition.
    pub fn register(mut self, spec: CollectionSpec) -> Self {
        self.collections.register(spec);
        self
    }

    pub fn build(self) -> Result<SyncContext, ConfigError> {
        self.config.validate()?;

        let store = CacheStore::new(Arc::new(self.collections));
        let queries = QueryController::new(Arc::clone(&store), Arc::clone(&self.remote), self.config.clone());
        let ledger = Arc::new(MutationLedger::new());
        let mutations = MutationCoordinator::new(
            queries.clone(),
            Arc::clone(&self.remote),
            Arc::clone(&ledger),
            self.config.clone(),
        );
        let listener = ChangeFeedListener::new(queries.clone(), self.feed, ledger, self.config.clone());

        Ok(SyncContext {
            store,
            queries,
            mutations,
            listener,
            config: self.config,
        })
    }
}

/// One collection key as seen by a consumer.
pub struct CollectionHandle<'a> {
    ctx: &'a SyncContext,
    key: CollectionKey,
}

impl CollectionHandle<'_> {
    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    /// Cached entry, refreshed in the background when stale.
    pub fn read(&self) -> CacheEntry {
        self.ctx.queries.query(&self.key)
    }

    /// Cached entities without triggering a fetch.
    pub fn items(&self) -> Vec<Entity> {
        self.ctx.store.data(&self.key).unwrap_or_default()
    }

    pub async fn fetch(&self) -> Result<Vec<Entity>, SyncError> {
        self.ctx.queries.fetch(&self.key).await
    }

    pub async fn insert(&self, fields: Record) -> Result<Entity, SyncError> {
        self.ctx.mutations.insert(&self.key, fields).await
    }

    pub async fn update(&self, id: &EntityId, patch: Record) -> Result<Entity, SyncError> {
        self.ctx.mutations.update(&self.key, id, patch).await
    }

    pub async fn delete(&self, id: &EntityId) -> Result<(), SyncError> {
        self.ctx.mutations.delete(&self.key, id).await
    }

    /// Cache updates for this key.
    pub fn watch(&self) -> CacheSubscription {
        self.ctx.store.subscribe(&self.key)
    }

    /// Apply change-feed events for this key until the subscription drops.
    pub async fn listen(&self) -> Result<Option<Subscription>, SyncError> {
        self.ctx.listener.subscribe(&self.key).await
    }

    /// Unsettled mutations on this key.
    pub fn in_flight(&self) -> usize {
        self.ctx.mutations.in_flight(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let remote: Arc<dyn RemoteStore> = Arc::new(MemoryBackend::new());
        let config = SyncConfig {
            feed_channel_capacity: 1,
            ..SyncConfig::default()
        };
        assert!(SyncContext::builder(remote).config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed("recipes", vec![json!({"id": "1", "name": "Pancakes"})]);
        let ctx = SyncContext::builder(backend.clone()).build().unwrap();
        let recipes = ctx.collection(CollectionKey::new("recipes"));

        assert_eq!(recipes.fetch().await.unwrap().len(), 1);
        let created = recipes
            .insert(json!({"name": "Curry"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let names: Vec<_> = recipes
            .items()
            .iter()
            .filter_map(|e| e.get_str("name").map(str::to_string))
            .collect();
        assert_eq!(names, vec!["Curry", "Pancakes"]);
        assert_eq!(created.get_str("user_id"), Some("user-1"));
        assert_eq!(recipes.in_flight(), 0);

        ctx.end();
        assert!(ctx.store().keys().is_empty());
    }
}
