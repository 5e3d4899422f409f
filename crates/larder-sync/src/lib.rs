//! Optimistic collection cache for Larder.
//!
//! Keeps a client-side copy of remote collections (food items, categories,
//! cosmetics, recipes, meal plans) that reflects local writes immediately,
//! rolls them back when the remote store rejects them, and reconciles with
//! both the write's own response and an independent push feed.
//!
//! ## Components
//!
//! - **Cache Store**: keyed in-memory map from collection key to ordered entities
//! - **Snapshots**: pre-mutation copies of a cache entry, restored on failure
//! - **Temporary ids**: placeholder identities for not-yet-acknowledged inserts
//! - **Query Controller**: deduplicated, cancellable fetches with staleness tracking
//! - **Mutation Coordinator**: optimistic apply, commit or roll back, settle
//! - **Change Feed Listener**: idempotent application of pushed insert/update/delete events
//!
//! The HTTP and WebSocket collaborators live in [`client`] and [`realtime`];
//! [`memory`] provides an in-process backend with the same contracts.

pub mod allocator;
pub mod cache;
pub mod client;
pub mod collection;
pub mod config;
pub mod context;
mod entity;
mod error;
pub mod feed;
mod key;
pub mod memory;
pub mod mutation;
pub mod preferences;
pub mod query;
pub mod realtime;
pub mod remote;
pub mod snapshot;

pub use allocator::TempAllocator;
pub use cache::{CacheEntry, CacheStore, CacheSubscription, CacheUpdate, QueryStatus};
pub use client::RestClient;
pub use collection::{CollectionRegistry, CollectionSpec, Direction, SortKey, SortKind};
pub use config::{ConfigError, SyncConfig, SyncConfigBuilder};
pub use context::{CollectionHandle, SyncContext, SyncContextBuilder};
pub use entity::{CorrelationId, Entity, EntityId, Record, TEMP_ID_PREFIX};
pub use error::{NO_ROWS_CODE, RemoteError, SyncError, UNIQUE_VIOLATION_CODE, ValidationError, classify};
pub use feed::{ChangeFeedListener, Subscription};
pub use key::{CollectionKey, Filter};
pub use memory::{MemoryBackend, Operation};
pub use mutation::{MutationCoordinator, MutationKind, MutationLedger, MutationPhase, MutationRecord};
pub use preferences::{Preferences, Units, WeekStart};
pub use query::QueryController;
pub use realtime::RealtimeFeed;
pub use remote::{Actor, ChangeFeed, ChangeFeedEvent, ChangeKind, FeedMessage, FeedStream, FetchRequest, RemoteStore};
pub use snapshot::{SnapshotManager, SnapshotTicket};
