//! Larder: household inventory client
//!
//! Main binary with subcommands:
//! - `list`: Print a collection
//! - `add` / `edit` / `remove`: Optimistic writes against the remote store
//! - `watch`: Follow a collection through the change feed
//! - `prefs`: Show or change the signed-in user's preferences
//! - `demo`: Walk through the sync scenarios against an in-process backend

use clap::{Args, Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use larder_sync::CollectionKey;

mod commands;
mod demo;

#[derive(Parser)]
#[command(name = "larder")]
#[command(about = "Household inventory with an optimistic local cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Connection and tuning shared by the commands that talk to the remote store.
#[derive(Args, Debug, Clone)]
pub struct RemoteArgs {
    /// Base URL of the remote store
    #[arg(long, env = "LARDER_URL")]
    pub url: String,

    /// Project API key
    #[arg(long, env = "LARDER_API_KEY")]
    pub api_key: String,

    /// Session access token of the signed-in user
    #[arg(long, env = "LARDER_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Change feed base URL (defaults to --url)
    #[arg(long, env = "LARDER_REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// Seconds before fetched data counts as stale
    #[arg(long, default_value = "30")]
    pub stale_secs: u64,

    /// Extra attempts for a failed read
    #[arg(long, default_value = "3")]
    pub fetch_retries: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the entities of a collection
    List {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Collection key, e.g. `food_items` or `food_items?category_id=3`
        #[arg(value_name = "COLLECTION")]
        key: CollectionKey,
    },

    /// Insert an entity
    Add {
        #[command(flatten)]
        remote: RemoteArgs,

        #[arg(value_name = "COLLECTION")]
        key: CollectionKey,

        /// Field assignments (`name=Milk`, `quantity=2`)
        #[arg(value_name = "FIELD=VALUE", required = true)]
        fields: Vec<String>,
    },

    /// Change fields of an existing entity
    Edit {
        #[command(flatten)]
        remote: RemoteArgs,

        #[arg(value_name = "COLLECTION")]
        key: CollectionKey,

        /// Entity id
        id: String,

        #[arg(value_name = "FIELD=VALUE", required = true)]
        fields: Vec<String>,
    },

    /// Delete an entity
    Remove {
        #[command(flatten)]
        remote: RemoteArgs,

        #[arg(value_name = "COLLECTION")]
        key: CollectionKey,

        /// Entity id
        id: String,
    },

    /// Print a collection and keep it current from the change feed
    Watch {
        #[command(flatten)]
        remote: RemoteArgs,

        #[arg(value_name = "COLLECTION")]
        key: CollectionKey,
    },

    /// Show preferences, or change them with --set
    Prefs {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Preference assignments (`expiry_warning_days=5`, `units=imperial`)
        #[arg(long = "set", value_name = "FIELD=VALUE")]
        set: Vec<String>,
    },

    /// Run the sync scenarios against an in-process backend
    Demo {
        /// Simulated remote latency in milliseconds
        #[arg(long, default_value = "25")]
        latency_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "larder=info,larder_sync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List { remote, key } => commands::list(&remote, key).await,
        Commands::Add {
            remote,
            key,
            fields,
        } => commands::add(&remote, key, &fields).await,
        Commands::Edit {
            remote,
            key,
            id,
            fields,
        } => commands::edit(&remote, key, &id, &fields).await,
        Commands::Remove { remote, key, id } => commands::remove(&remote, key, &id).await,
        Commands::Watch { remote, key } => commands::watch(&remote, key).await,
        Commands::Prefs { remote, set } => commands::prefs(&remote, &set).await,
        Commands::Demo { latency_ms } => demo::run(latency_ms).await,
    }
}
