//! Change feed listener.
//!
//! One upstream subscription per collection key, fanned out over a broadcast
//! channel to every listener of that key. Each listener applies events to the
//! cache on its own; application is idempotent, so several listeners on the
//! same key converge on the same entry.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::entity::Entity;
use crate::error::{SyncError, classify};
use crate::key::CollectionKey;
use crate::mutation::MutationLedger;
use crate::query::QueryController;
use crate::remote::{ChangeFeed, ChangeFeedEvent, ChangeKind, FeedMessage, Unsubscribe};

/// Shared upstream subscription for one key.
struct Hub {
    tx: broadcast::Sender<FeedMessage>,
    listeners: usize,
    unsubscribe: Unsubscribe,
    pump: JoinHandle<()>,
}

type Hubs = Arc<DashMap<CollectionKey, Hub>>;

/// Applies pushed changes to the cache.
#[derive(Clone)]
pub struct ChangeFeedListener {
    store: Arc<CacheStore>,
    queries: QueryController,
    feed: Option<Arc<dyn ChangeFeed>>,
    ledger: Arc<MutationLedger>,
    config: SyncConfig,
    hubs: Hubs,
}

impl ChangeFeedListener {
    pub fn new(
        queries: QueryController,
        feed: Option<Arc<dyn ChangeFeed>>,
        ledger: Arc<MutationLedger>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store: Arc::clone(queries.store()),
            queries,
            feed,
            ledger,
            config,
            hubs: Arc::new(DashMap::new()),
        }
    }

    /// Start applying feed events for `key`.
    ///
    /// Returns `None` when there is no feed, or when the collection does not
    /// publish one; such keys converge through settle-time refetches only.
    pub async fn subscribe(&self, key: &CollectionKey) -> Result<Option<Subscription>, SyncError> {
        let spec = self.store.collections().spec(key.collection());
        let feed = match &self.feed {
            Some(feed) if spec.has_feed => Arc::clone(feed),
            _ => {
                debug!(key = %key, "no change feed for collection");
                return Ok(None);
            }
        };

        let rx = match self.join(key) {
            Some(rx) => rx,
            None => {
                // Opened outside the map so no shard lock is held across the await.
                let upstream = feed
                    .subscribe(key.collection(), key.scope())
                    .await
                    .map_err(|e| classify(&spec, None, e))?;

                match self.hubs.entry(key.clone()) {
                    Entry::Occupied(mut hub) => {
                        hub.get_mut().listeners += 1;
                        let rx = hub.get().tx.subscribe();
                        drop(hub);
                        trace!(key = %key, "feed already opened concurrently, closing duplicate");
                        (upstream.unsubscribe)();
                        rx
                    }
                    Entry::Vacant(slot) => {
                        let (tx, rx) = broadcast::channel(self.config.feed_channel_capacity);
                        let pump = tokio::spawn(pump(key.clone(), upstream.events, tx.clone()));
                        slot.insert(Hub {
                            tx,
                            listeners: 1,
                            unsubscribe: upstream.unsubscribe,
                            pump,
                        });
                        info!(key = %key, "change feed opened");
                        rx
                    }
                }
            }
        };

        let task = tokio::spawn(listen(self.clone(), key.clone(), rx));
        Ok(Some(Subscription {
            key: key.clone(),
            task,
            hubs: Arc::clone(&self.hubs),
            released: false,
        }))
    }

    /// Attach to an already open upstream subscription.
    fn join(&self, key: &CollectionKey) -> Option<broadcast::Receiver<FeedMessage>> {
        let mut hub = self.hubs.get_mut(key)?;
        hub.listeners += 1;
        Some(hub.tx.subscribe())
    }

    /// Number of listeners sharing the feed for `key`.
    pub fn listeners(&self, key: &CollectionKey) -> usize {
        self.hubs.get(key).map(|h| h.listeners).unwrap_or(0)
    }

    /// Apply one event to the entry for `key`. Returns whether it changed.
    ///
    /// Entries that were never loaded are left alone; the first fetch will
    /// include the change.
    pub fn apply(&self, key: &CollectionKey, event: &ChangeFeedEvent) -> bool {
        let record = &event.record;
        if record.is_temporary() {
            trace!(key = %key, id = %record.id(), "ignoring event for temporary entity");
            return false;
        }
        if self.is_echo(record) {
            debug!(key = %key, id = %record.id(), kind = %event.kind, "suppressing echo of in-flight mutation");
            return false;
        }

        let changed = self.store.update_loaded(key, |items| apply_event(key, items, event));
        trace!(key = %key, id = %record.id(), kind = %event.kind, changed, "feed event applied");
        changed
    }

    fn is_echo(&self, record: &Entity) -> bool {
        self.config.echo_correlation_ids
            && record
                .get_str(&self.config.correlation_field)
                .is_some_and(|id| self.ledger.contains_str(id))
    }

    /// Reload `key` after events may have been missed.
    async fn resync(&self, key: &CollectionKey) {
        self.queries.invalidate(key);
        if let Err(e) = self.queries.refetch(key).await {
            warn!(key = %key, error = %e, "resync fetch failed");
        }
    }
}

fn apply_event(key: &CollectionKey, items: &mut Vec<Entity>, event: &ChangeFeedEvent) -> bool {
    let record = &event.record;
    let position = items.iter().position(|e| e.id() == record.id());

    match (event.kind, position) {
        (ChangeKind::Insert, Some(_)) => false,
        (ChangeKind::Insert | ChangeKind::Update, None) => {
            if !key.matches(record.fields()) {
                return false;
            }
            items.push(record.clone());
            true
        }
        (ChangeKind::Update, Some(index)) => {
            let mut merged = items[index].clone();
            merged.merge(record.fields());
            if !key.matches(merged.fields()) {
                items.remove(index);
                return true;
            }
            if merged == items[index] {
                return false;
            }
            items[index] = merged;
            true
        }
        (ChangeKind::Delete, Some(index)) => {
            items.remove(index);
            true
        }
        (ChangeKind::Delete, None) => false,
    }
}

/// Forward upstream messages to the key's listeners.
async fn pump(key: CollectionKey, mut events: BoxStream<'static, FeedMessage>, tx: broadcast::Sender<FeedMessage>) {
    while let Some(message) = events.next().await {
        if tx.send(message).is_err() {
            trace!(key = %key, "no listeners for feed message");
        }
    }
    debug!(key = %key, "upstream change feed ended");
}

async fn listen(listener: ChangeFeedListener, key: CollectionKey, mut rx: broadcast::Receiver<FeedMessage>) {
    loop {
        match rx.recv().await {
            Ok(FeedMessage::Event(event)) => {
                listener.apply(&key, &event);
            }
            Ok(FeedMessage::Resync) => {
                info!(key = %key, "feed reconnected, resyncing");
                listener.resync(&key).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(key = %key, skipped, "feed listener lagged, resyncing");
                listener.resync(&key).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// A listener's claim on the feed for one key.
///
/// Dropping it stops the listener; the upstream subscription closes when the
/// last listener for the key goes away.
pub struct Subscription {
    key: CollectionKey,
    task: JoinHandle<()>,
    hubs: Hubs,
    released: bool,
}

impl Subscription {
    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.task.abort();

        let closed = self.hubs.remove_if_mut(&self.key, |_, hub| {
            hub.listeners = hub.listeners.saturating_sub(1);
            hub.listeners == 0
        });
        if let Some((_, hub)) = closed {
            hub.pump.abort();
            (hub.unsubscribe)();
            info!(key = %self.key, "change feed closed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}
