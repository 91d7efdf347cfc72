//!
//! src/main.rs  Andrew Belles  Oct 5th, 2025
//!
//! Entry point: wires configuration, logging, the station store, the
//! last.fm client and the response cache together and serves the router
//! until ctrl-c
//!

use std::sync::Arc;

use rs_aggregator::{
    api::{build_router, AppState},
    cache::{MemoryStore, ReadThrough},
    config,
    errors::AggregatorError,
    fetch::LastFmClient,
    logging,
    persistent::{Persistent, StationRecord},
    policy::Policies
};

/// Loads station rows from a json array file, used to seed a fresh database
async fn seed_stations(db: &Persistent, path: &str) -> Result<usize, AggregatorError> {
    let raw = tokio::fs::read(path).await?;
    let records: Vec<StationRecord> = serde_json::from_slice(&raw)?;
    for record in &records {
        db.upsert_station(record).await?;
    }
    Ok(records.len())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "shutdown.signal.failed");
    }
    tracing::info!("shutdown.requested");
}

#[tokio::main]
async fn main() -> Result<(), AggregatorError> {
    let cfgs = config::load_config()?;
    let _guard = logging::init_logging(&cfgs.logging)?;

    tracing::info!(
        service="rs-aggregator",
        version=%env!("CARGO_PKG_VERSION"),
        bind=%cfgs.server.bind,
        "starting"
    );

    let db = Persistent::init(&cfgs.persistence.db_url).await?;
    if let Some(path) = cfgs.persistence.seed_path.as_deref() {
        let seeded = seed_stations(&db, path).await?;
        tracing::info!(seeded, path, "stations.seeded");
    }
    tracing::info!(stations = db.count_stations().await?, "stations.ready");

    let lastfm = LastFmClient::new(&cfgs.http, &cfgs.lastfm)?;
    let store  = MemoryStore::new(cfgs.cache.max_entries);
    let cache  = ReadThrough::new(Arc::new(store));

    let policies = Policies::new(Arc::new(lastfm), Arc::new(db), cache.clone(), cfgs.cache.clone());
    let router = build_router(AppState::new(policies));

    let listener = tokio::net::TcpListener::bind(cfgs.server.bind).await?;
    tracing::info!(addr = %cfgs.server.bind, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cache.settle().await;
    tracing::info!("stopped");
    Ok(())
}
