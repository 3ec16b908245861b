use std::sync::Arc;

use clap::Parser;
use hubcache_engine::{
    CacheManager, HttpFeed, HttpFetcher, HubCacheConfig, HubCacheConfigBuilder, PiletFeed, PiletStore,
    create_client,
};
use tracing::{Level, debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod commands;
mod error;

use cli::CliArgs;
use commands::Session;
use error::AppError;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    // A missing .env file is fine
    let env_file = dotenvy::dotenv().ok();

    let args = CliArgs::parse();

    // Logs go to stderr so bundle and JSON output stay clean on stdout.
    // RUST_LOG takes precedence over --verbose.
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_ascii_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    if let Some(path) = env_file {
        debug!(path = %path.display(), "Loaded environment file");
    }

    let mut builder = HubCacheConfigBuilder::from_config(HubCacheConfig::from_env()?);
    if let Some(dir) = args.cache_dir {
        builder = builder.with_cache_dir(dir);
    }
    if let Some(strategy) = args.strategy {
        builder = builder.with_strategy(strategy);
    }
    if let Some(url) = args.feed_url {
        builder = builder.with_feed_url(url);
    }
    if args.no_preload {
        builder = builder.with_preloading(false);
    }
    let config = builder.build();
    config.validate()?;

    let client = create_client(&config.feed)?;
    let feed: Option<Arc<dyn PiletFeed>> = match config.feed.url.as_deref() {
        Some(url) => Some(Arc::new(HttpFeed::new(client.clone(), url)?)),
        None => None,
    };

    let store = Arc::new(PiletStore::open(config.store.clone()).await);
    info!(
        persistent = store.is_persistent(),
        max_size_bytes = store.max_size_bytes(),
        "Pilet store ready"
    );

    let manager = CacheManager::new(
        config.manager.clone(),
        store.clone(),
        Arc::new(HttpFetcher::new(client)),
    );

    let session = Session { manager, feed };
    let result = session.run(args.command).await;
    store.close();
    result
}
