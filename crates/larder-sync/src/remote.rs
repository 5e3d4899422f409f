//! Collaborator contracts: the persistence API and the change feed.
//!
//! [`crate::client::RestClient`] and [`crate::realtime::RealtimeFeed`] talk
//! to the hosted backend; [`crate::memory::MemoryBackend`] implements both
//! traits in-process.

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::collection::SortKey;
use crate::entity::{Entity, EntityId, Record};
use crate::error::RemoteError;
use crate::key::{CollectionKey, Filter};

/// The authenticated user on whose behalf mutations are made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// A filtered, ordered read of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub collection: String,
    pub filter: Filter,
    pub order: Vec<SortKey>,
}

impl FetchRequest {
    /// Request for everything under `key`, in the order its collection declares.
    pub fn for_key(key: &CollectionKey, order: &[SortKey]) -> Self {
        Self {
            collection: key.collection().to_string(),
            filter: key.scope().clone(),
            order: order.to_vec(),
        }
    }
}

/// The persistence API.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Entity>, RemoteError>;

    /// Create a record. Returns the authoritative entity with its real id.
    async fn insert(&self, collection: &str, fields: Record) -> Result<Entity, RemoteError>;

    /// Patch a record. Returns the authoritative entity.
    async fn update(&self, collection: &str, id: &EntityId, patch: Record) -> Result<Entity, RemoteError>;

    async fn delete(&self, collection: &str, id: &EntityId) -> Result<(), RemoteError>;

    /// The current actor, or `None` if no one is signed in.
    async fn current_actor(&self) -> Result<Option<Actor>, RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// One committed change, as pushed by the feed.
///
/// For deletes `record` carries at least the id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFeedEvent {
    pub kind: ChangeKind,
    pub record: Entity,
}

impl ChangeFeedEvent {
    pub fn insert(record: Entity) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn update(record: Entity) -> Self {
        Self {
            kind: ChangeKind::Update,
            record,
        }
    }

    pub fn delete(id: impl Into<EntityId>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            record: Entity::new(id.into(), Record::new()),
        }
    }
}

/// Item on a feed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Event(ChangeFeedEvent),
    /// Events may have been missed (reconnect or overflow); reload.
    Resync,
}

/// Closes the upstream subscription.
pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// An open feed subscription.
///
/// Dropping the stream alone does not close the upstream side; call
/// `unsubscribe`.
pub struct FeedStream {
    pub events: BoxStream<'static, FeedMessage>,
    pub unsubscribe: Unsubscribe,
}

impl fmt::Debug for FeedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedStream").finish_non_exhaustive()
    }
}

/// Push notifications of committed changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, collection: &str, filter: &Filter) -> Result<FeedStream, RemoteError>;
}
