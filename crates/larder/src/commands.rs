//! Commands that run against the remote store.

use std::sync::Arc;

use miette::{Result, miette};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use larder_sync::preferences::PREFERENCES_COLLECTION;
use larder_sync::{
    CacheUpdate, CollectionKey, Entity, EntityId, Preferences, RealtimeFeed, Record, RemoteStore, RestClient,
    SyncConfig, SyncContext, SyncError,
};

use crate::RemoteArgs;

/// A connected sync context plus the client it writes through.
struct Session {
    ctx: SyncContext,
    remote: Arc<RestClient>,
}

async fn connect(args: &RemoteArgs) -> Result<Session> {
    let config = SyncConfig::builder()
        .stale_time_ms(args.stale_secs.saturating_mul(1000))
        .fetch_retries(args.fetch_retries)
        .build()
        .map_err(|e| miette!("{}", e))?;

    let client = RestClient::new(&args.url, &args.api_key)
        .map_err(|e| miette!("failed to create client: {}", e))?;
    client.set_access_token(args.access_token.clone()).await;
    let remote = Arc::new(client);

    let feed_url = args.realtime_url.as_deref().unwrap_or(&args.url);
    let feed = RealtimeFeed::new(feed_url, &args.api_key).with_channel_capacity(config.feed_channel_capacity);
    feed.set_access_token(args.access_token.clone()).await;

    let ctx = SyncContext::builder(remote.clone())
        .feed(Arc::new(feed))
        .config(config)
        .build()
        .map_err(|e| miette!("{}", e))?;

    info!(url = %remote.base_url(), signed_in = args.access_token.is_some(), "connected");
    Ok(Session { ctx, remote })
}

fn failed(err: SyncError) -> miette::Report {
    miette!("{}", err.user_message())
}

/// Parse `FIELD=VALUE` pairs. Values that read as JSON keep their type,
/// anything else is a string.
pub(crate) fn parse_fields(pairs: &[String]) -> Result<Record> {
    let mut record = Record::new();
    for pair in pairs {
        let (field, raw) = pair
            .split_once('=')
            .ok_or_else(|| miette!("expected FIELD=VALUE, got '{}'", pair))?;
        if field.is_empty() {
            return Err(miette!("missing field name in '{}'", pair));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        record.insert(field.to_string(), value);
    }
    Ok(record)
}

pub(crate) fn print_entity(entity: &Entity) {
    let fields = serde_json::to_string(entity.fields()).unwrap_or_default();
    println!("{:>12}  {}", entity.id().as_str(), fields);
}

pub(crate) fn print_entries(key: &CollectionKey, items: &[Entity]) {
    println!("{} ({} items)", key, items.len());
    for entity in items {
        print_entity(entity);
    }
}

pub async fn list(args: &RemoteArgs, key: CollectionKey) -> Result<()> {
    let session = connect(args).await?;
    let handle = session.ctx.collection(key);
    let items = handle.fetch().await.map_err(failed)?;
    print_entries(handle.key(), &items);
    Ok(())
}

pub async fn add(args: &RemoteArgs, key: CollectionKey, fields: &[String]) -> Result<()> {
    let fields = parse_fields(fields)?;
    let session = connect(args).await?;
    let handle = session.ctx.collection(key);
    let created = handle.insert(fields).await.map_err(failed)?;
    print_entity(&created);
    Ok(())
}

pub async fn edit(args: &RemoteArgs, key: CollectionKey, id: &str, fields: &[String]) -> Result<()> {
    let patch = parse_fields(fields)?;
    let session = connect(args).await?;
    let handle = session.ctx.collection(key);
    let updated = handle
        .update(&EntityId::new(id), patch)
        .await
        .map_err(failed)?;
    print_entity(&updated);
    Ok(())
}

pub async fn remove(args: &RemoteArgs, key: CollectionKey, id: &str) -> Result<()> {
    let session = connect(args).await?;
    let handle = session.ctx.collection(key);
    handle.delete(&EntityId::new(id)).await.map_err(failed)?;
    println!("removed {}", id);
    Ok(())
}

pub async fn watch(args: &RemoteArgs, key: CollectionKey) -> Result<()> {
    let session = connect(args).await?;
    let handle = session.ctx.collection(key);

    let mut updates = handle.watch();
    let items = handle.fetch().await.map_err(failed)?;
    print_entries(handle.key(), &items);

    let Some(subscription) = handle.listen().await.map_err(failed)? else {
        warn!(key = %handle.key(), "collection has no change feed");
        return Ok(());
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            update = updates.recv() => match update {
                Ok(CacheUpdate::Data { .. }) => print_entries(handle.key(), &handle.items()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch fell behind, reprinting");
                    print_entries(handle.key(), &handle.items());
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    subscription.unsubscribe();
    session.ctx.end();
    Ok(())
}

pub async fn prefs(args: &RemoteArgs, assignments: &[String]) -> Result<()> {
    let patch = parse_fields(assignments)?;
    let session = connect(args).await?;

    let actor = session
        .remote
        .current_actor()
        .await
        .map_err(|e| miette!("failed to look up the signed-in user: {}", e))?
        .ok_or_else(|| miette!("not signed in; pass --access-token"))?;

    let handle = session
        .ctx
        .collection(CollectionKey::new(PREFERENCES_COLLECTION).scoped("user_id", actor.id.as_str()));
    let rows = handle.fetch().await.map_err(failed)?;
    let existing = rows.first();

    let current = match existing {
        Some(row) => Preferences::from_entity(row).map_err(|e| miette!("stored preferences are invalid: {}", e))?,
        None => Preferences::default(),
    };

    if patch.is_empty() {
        print_preferences(&current);
        return Ok(());
    }

    let mut merged = current.to_record();
    merged.extend(patch.clone());
    let updated = Preferences::from_record(&merged).map_err(|e| miette!("{}", e))?;

    match existing {
        Some(row) => {
            handle.update(row.id(), patch).await.map_err(failed)?;
        }
        None => {
            handle.insert(updated.to_record()).await.map_err(failed)?;
        }
    }
    print_preferences(&updated);
    Ok(())
}

fn print_preferences(prefs: &Preferences) {
    println!("expiry_warning_days  {}", prefs.expiry_warning_days);
    println!("pao_reminder_days    {}", prefs.pao_reminder_days);
    println!("week_start           {:?}", prefs.week_start);
    println!("units                {:?}", prefs.units);
    println!(
        "default_category_id  {}",
        prefs.default_category_id.as_deref().unwrap_or("-")
    );
    for (field, value) in prefs.extra() {
        println!("{:<20} {}", field, value);
    }
}
