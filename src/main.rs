//! Waypoint - caching reverse proxy daemon

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waypoint::{
    admin,
    cache::{self, CacheStore},
    config::{load_vhost_files, Args, GlobalConfig},
    routing::RoutingTable,
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    if args.version {
        println!("Waypoint - caching reverse proxy");
        println!(
            "Version: {} (commit {})",
            waypoint::VERSION,
            option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown")
        );
        return Ok(());
    }

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("waypoint={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load the global config; a missing file falls back to defaults so a
    // bare invocation still starts
    let config = match GlobalConfig::load(&args.config) {
        Ok(config) => {
            info!("Loaded waypoint config from {}", args.config.display());
            config
        }
        Err(e) => {
            warn!("Using default config: {}", e);
            GlobalConfig::default()
        }
    };

    info!("======================================");
    info!("  Waypoint - caching reverse proxy");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Bind address: {}", config.server);
    info!("Admin port: {}", config.admin_port);
    info!("Hot tier capacity: {} entries", config.cache.hot_capacity);
    info!("MongoDB: {}", config.cache.mongodb_uri);
    info!("======================================");

    // Connect the cold tier; an unreachable MongoDB degrades the cache to
    // hot-tier-only rather than refusing to start
    let cold = cache::connect_cold_tier(&config.cache.mongodb_uri, &config.cache.mongodb_db).await;
    let store = Arc::new(CacheStore::new(config.cache.hot_capacity, cold));

    // Build the routing table from the vhost directory
    let vhost_dir = args.vhost_dir.clone().unwrap_or_else(|| config.vhostpath.clone());
    let files = match load_vhost_files(&vhost_dir) {
        Ok(files) => files,
        Err(e) => {
            warn!("Warning: {}", e);
            Vec::new()
        }
    };
    let table = RoutingTable::build(&files, &config);

    let purge_interval = Duration::from_secs(config.cache.purge_interval_secs);
    let state = Arc::new(AppState::new(args, config, Arc::clone(&store), table));

    // Background purge of expired cold entries and idle collapse targets
    let _purge = cache::spawn_purge_task(store, Arc::clone(&state.routing), purge_interval);

    // Admin remote-control listener
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = admin::run(state).await {
                error!("Admin listener error: {:?}", e);
            }
        });
    }

    // Serve until interrupted
    tokio::select! {
        result = server::run(state) => {
            if let Err(e) = result {
                error!("Server error: {:?}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
    }

    Ok(())
}
