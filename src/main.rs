//! Courier Dispatch - Axum Server
//!
//! Usage: `courier-dispatch [--config dispatch.toml]`. `DISPATCH_CONFIG` names
//! the file when the flag is absent.

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use courier_dispatch::api::{create_router, AppState};
use courier_dispatch::clock::{Clock, SystemClock};
use courier_dispatch::config::{DispatchConfig, StoreConfig};
use courier_dispatch::console;
use courier_dispatch::coordinator::DispatchCoordinator;
use courier_dispatch::demo_data;
use courier_dispatch::distance::{
    CacheStore, DistanceCache, DistanceService, MemoryCacheStore, PgCacheStore,
};
use courier_dispatch::events;
use courier_dispatch::store::{MemoryOrderStore, OrderStore, PgOrderStore};

/// Command-line arguments for the dispatch service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("courier_dispatch=info".parse()?))
        .init();

    let config = DispatchConfig::load(args.config.as_deref())?;
    console::print_banner();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Postgres deployments share the distance cache between replicas too
    let (store, cache_store): (Arc<dyn OrderStore>, Arc<dyn CacheStore>) = match &config.store {
        StoreConfig::Memory { seed_demo } => {
            let store = MemoryOrderStore::new();
            if *seed_demo {
                demo_data::seed_store(&store, clock.now()).await?;
            }
            (Arc::new(store), Arc::new(MemoryCacheStore::new()))
        }
        StoreConfig::Postgres {
            url,
            max_connections,
        } => {
            let store = PgOrderStore::connect(url, *max_connections).await?;
            let cache_store = PgCacheStore::new(store.pool().clone());
            (Arc::new(store), Arc::new(cache_store))
        }
    };

    let provider = config.provider.build(config.clustering.road_factor)?;
    let cache = Arc::new(DistanceCache::with_store(
        config.cache.clone(),
        clock.clone(),
        cache_store,
    ));
    let distance = Arc::new(DistanceService::new(
        cache,
        provider,
        config.clustering.road_factor,
    ));

    let (publisher, notifications) = events::channel();
    let _relay = events::spawn_notification_relay(notifications);

    let coordinator = Arc::new(DispatchCoordinator::new(
        store.clone(),
        distance.clone(),
        clock,
        Arc::new(publisher),
        &config,
    ));
    let _sweeper = coordinator.locks().clone().spawn_sweeper();

    console::print_config(&config, store.backend(), distance.provider_name());

    let state = Arc::new(AppState::new(coordinator).with_console(true));
    let app = create_router(state);

    let addr = config.socket_addr()?;
    println!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
