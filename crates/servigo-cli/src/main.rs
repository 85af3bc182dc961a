use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use servigo_catalog::ListingCatalog;
use servigo_i18n::{LanguagePrefs, Localizer};
use servigo_store::{
    ListingChangeFeed, MarketStore, PollingChangeWatcher, RestMarketStore, StoreConfig,
};
use servigo_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "servigo")]
#[command(about = "ServiGO marketplace command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the marketplace web UI.
    Serve,
    /// Run one listing load and print a summary, for checking config.
    Fetch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store: Arc<dyn MarketStore> = Arc::new(RestMarketStore::new(StoreConfig::from_env())?);
    let catalog = ListingCatalog::new(Arc::clone(&store));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let locale = Arc::new(Localizer::new(LanguagePrefs::new(prefs_path())));
            if let Err(err) = catalog.load().await {
                eprintln!("initial listing load failed, serving empty: {err}");
            }

            let feed = ListingChangeFeed::new();
            let _watch = catalog.watch_changes(&feed);
            let _poll =
                PollingChangeWatcher::new(Arc::clone(&store), feed, poll_interval()).spawn();

            let port: u16 = std::env::var("SERVIGO_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080);
            println!("serving on http://0.0.0.0:{port}");
            servigo_web::serve(AppState::new(catalog, store, locale), port).await?;
        }
        Commands::Fetch => {
            let snapshot = catalog.load().await?;
            println!(
                "fetch complete: listings={} categories={} generation={}",
                snapshot.listings.len(),
                snapshot.categories.len(),
                snapshot.generation
            );
            for enriched in snapshot.listings.iter() {
                println!(
                    "  {} | {} | {}",
                    enriched.listing.id,
                    enriched.provider_name,
                    enriched.listing.location.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

fn prefs_path() -> PathBuf {
    std::env::var("SERVIGO_PREFS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.servigo/language.json"))
}

fn poll_interval() -> Duration {
    Duration::from_secs(
        std::env::var("SERVIGO_POLL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30),
    )
}
