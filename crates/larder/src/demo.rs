//! Scripted walkthrough of the sync behaviors against the in-process backend.

use std::sync::Arc;
use std::time::Duration;

use miette::{Result, miette};
use serde_json::{Value, json};
use tracing::info;

use larder_sync::{
    CollectionKey, Entity, MemoryBackend, Operation, Record, RemoteError, SyncContext, SyncError,
};

use crate::commands::print_entries;

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

fn session(backend: &Arc<MemoryBackend>) -> Result<SyncContext> {
    SyncContext::builder(backend.clone())
        .feed(backend.clone())
        .build()
        .map_err(|e| miette!("{}", e))
}

fn expect_failure(result: Result<Entity, SyncError>) -> Result<SyncError> {
    match result {
        Ok(entity) => Err(miette!("expected a failure, got {}", entity.id())),
        Err(err) => Ok(err),
    }
}

/// Wait for the next change to `key`, giving up after a second.
async fn next_change(ctx: &SyncContext, key: &CollectionKey) -> Result<()> {
    let mut updates = ctx.store().subscribe(key);
    tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .map_err(|_| miette!("no change arrived for {}", key))?
        .map_err(|e| miette!("{}", e))?;
    Ok(())
}

pub async fn run(latency_ms: u64) -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    backend.unique("categories", "name");
    backend.seed(
        "food_items",
        vec![json!({"id": "42", "name": "Milk", "created_at": "2024-01-01T00:00:00Z"})],
    );
    backend.seed("categories", vec![json!({"id": "1", "name": "Dairy"})]);
    backend.set_latency(Duration::from_millis(latency_ms));

    rollback(&backend).await?;
    duplicate(&backend).await?;
    feed(&backend).await?;
    signed_out(&backend).await?;

    info!("demo finished");
    Ok(())
}

async fn rollback(backend: &Arc<MemoryBackend>) -> Result<()> {
    println!("\n== insert rolled back after a network failure");
    let ctx = session(backend)?;
    let foods = ctx.collection(CollectionKey::new("food_items"));
    foods.fetch().await.map_err(|e| miette!("{}", e))?;
    print_entries(foods.key(), &foods.items());

    backend.fail_next(Operation::Insert, RemoteError::Network("connection reset".into()));
    let mut updates = foods.watch();
    let (result, _) = tokio::join!(foods.insert(record(json!({"name": "Eggs"}))), async {
        if updates.recv().await.is_ok() {
            println!("optimistic:");
            print_entries(foods.key(), &foods.items());
        }
    });

    let err = expect_failure(result)?;
    println!("failed: {}", err.user_message());
    println!("after rollback:");
    print_entries(foods.key(), &foods.items());
    Ok(())
}

async fn duplicate(backend: &Arc<MemoryBackend>) -> Result<()> {
    println!("\n== duplicate category name");
    let ctx = session(backend)?;
    let categories = ctx.collection(CollectionKey::new("categories"));
    categories.fetch().await.map_err(|e| miette!("{}", e))?;

    let err = expect_failure(categories.insert(record(json!({"name": "Dairy"}))).await)?;
    println!("failed: {}", err.user_message());
    print_entries(categories.key(), &categories.items());
    Ok(())
}

async fn feed(backend: &Arc<MemoryBackend>) -> Result<()> {
    println!("\n== delete in one session reaches another over the feed");
    let key = CollectionKey::new("food_items");
    let first = session(backend)?;
    let second = session(backend)?;

    let watched = first.collection(key.clone());
    watched.fetch().await.map_err(|e| miette!("{}", e))?;
    let subscription = watched
        .listen()
        .await
        .map_err(|e| miette!("{}", e))?
        .ok_or_else(|| miette!("food_items has no change feed"))?;

    let writer = second.collection(key.clone());
    writer.fetch().await.map_err(|e| miette!("{}", e))?;
    let target = writer
        .items()
        .into_iter()
        .next()
        .ok_or_else(|| miette!("nothing to delete"))?;

    let (deleted, changed) = tokio::join!(writer.delete(target.id()), next_change(&first, &key));
    deleted.map_err(|e| miette!("{}", e))?;
    changed?;

    println!("first session after the delete in the second:");
    print_entries(watched.key(), &watched.items());
    subscription.unsubscribe();
    Ok(())
}

async fn signed_out(backend: &Arc<MemoryBackend>) -> Result<()> {
    println!("\n== write without a signed-in user");
    backend.set_actor(None);
    let ctx = session(backend)?;
    let recipes = ctx.collection(CollectionKey::new("recipes"));
    recipes.fetch().await.map_err(|e| miette!("{}", e))?;

    let err = expect_failure(recipes.insert(record(json!({"name": "Pancakes"}))).await)?;
    println!("failed: {}", err.user_message());
    print_entries(recipes.key(), &recipes.items());
    Ok(())
}
