//! inbox-sync: keeps a local view of one server collection in sync and logs
//! every change to it.

use anyhow::{Context, Result};
use clap::Parser;
use inbox_core::{
    CredentialSource, DispatchEvent, FileCredentials, SortOrder, StaticCredential, StoreEvent,
    SyncError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use inbox_client::{ClientConfig, RestCollection, SessionEvent, SyncSession};

#[derive(Parser, Debug)]
#[command(name = "inbox-sync")]
#[command(about = "Keep a local view of a server collection in sync")]
struct Args {
    /// JSON config file (defaults apply when missing)
    #[arg(short, long, default_value = "inbox-sync.json")]
    config: PathBuf,

    /// Base URL of the REST API
    #[arg(long)]
    api_base: Option<String>,

    /// Collection to sync (e.g. "messages", "projects")
    #[arg(long)]
    collection: Option<String>,

    /// Push socket URL; `{user_id}` is replaced by the resolved subject
    #[arg(long)]
    socket_url: Option<String>,

    /// Bearer credential
    #[arg(long, env = "INBOX_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// File holding the bearer credential, re-read on every poll (wins over --token)
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Poll period in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Server-side ordering (created, -created, update, -update, title, -title)
    #[arg(long)]
    ordering: Option<SortOrder>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Command-line flags override the config file.
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(api_base) = &self.api_base {
            config.api_base = api_base.clone();
        }
        if let Some(collection) = &self.collection {
            config.collection = collection.clone();
        }
        if let Some(socket_url) = &self.socket_url {
            config.socket_url = Some(socket_url.clone());
        }
        if let Some(interval_ms) = self.interval_ms {
            config.poll_interval_ms = interval_ms;
        }
        if let Some(ordering) = self.ordering {
            config.ordering = ordering;
        }
    }

    fn credentials(&self) -> Arc<dyn CredentialSource> {
        match &self.token_file {
            Some(path) => Arc::new(FileCredentials::new(path.clone())),
            None => Arc::new(StaticCredential::new(self.token.clone())),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,inbox_client=debug,inbox_core=debug"
    } else {
        "info,inbox_client=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ClientConfig::load(&args.config)?;
    args.apply(&mut config);

    info!("Starting inbox-sync");
    info!("Collection: {}/{}", config.api_base, config.collection);

    let collection =
        RestCollection::from_config(&config).context("Failed to build HTTP client")?;
    let (mut session, mut events) =
        SyncSession::new(config, Arc::new(collection), args.credentials());

    let _store_sub = session.store().subscribe(|event| match event {
        StoreEvent::Replaced { count } => info!("Collection now holds {} item(s)", count),
        StoreEvent::Removed { id, count } => info!("Removed item {} ({} left)", id, count),
        StoreEvent::Appended { id, count } => debug!("Previewed item {} ({} total)", id, count),
        StoreEvent::Updated { id, .. } => info!("Updated item {}", id),
    });
    let _push_sub = session.subscribe_push(|event| match event {
        DispatchEvent::Message(msg) => info!("Push #{}: {}", msg.seq, msg.value),
        DispatchEvent::ParseError(e) => warn!("Dropped push frame: {}", e),
    });

    match session.start().await {
        Ok(identity) => info!("Signed in as {}", identity.subject_id),
        Err(SyncError::Unauthenticated) => {
            warn!("No valid credential; set --token or INBOX_SYNC_TOKEN");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    info!("Syncing. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                match event {
                    SessionEvent::Tick(Err(e)) if e.is_transport() => {
                        debug!("Keeping previous items after failed poll");
                    }
                    SessionEvent::Tick(_) => {}
                    SessionEvent::PollingStopped => {
                        warn!("Credential expired or removed, stopping");
                        break;
                    }
                    SessionEvent::Connection(event) => {
                        debug!("Push channel {}: {:?}", event.handle(), event);
                    }
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    session.shutdown().await;
    Ok(())
}
