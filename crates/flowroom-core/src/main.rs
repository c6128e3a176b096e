// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowroom Core - background worker
//!
//! Runs the workers that act on a flowroom database:
//! - Contact fires (campaign events, wait expirations and timeouts)
//! - Backfilling the fires of new and edited campaign points
//! - Retries of messages that never reached the courier
//! - Pending flow starts and broadcasts
//! - Webhook incident recovery

use std::sync::Arc;
use tracing::{info, warn};

use flowroom_core::assets::AssetCache;
use flowroom_core::config::{Config, SessionStorage};
use flowroom_core::engine::mock::MockEngine;
use flowroom_core::models::channel_log::MemoryLogStore;
use flowroom_core::runtime::Runtime;
use flowroom_core::search::StaticSearch;
use flowroom_core::storage::{MemoryStore, ObjectStore, S3Store};
use flowroom_core::workers::Workers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowroom_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        redis_url = %config.redis_url,
        session_storage = ?config.session_storage,
        has_readonly_db = config.readonly_database_url.is_some(),
        "Starting Flowroom Core"
    );

    let db = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    flowroom_core::migrations::run_postgres(&db).await?;

    info!("Database migrations applied");

    let readonly_db = match &config.readonly_database_url {
        Some(url) => {
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?
        }
        None => db.clone(),
    };

    let redis = redis::Client::open(config.redis_url.as_str())?;

    let store: Arc<dyn ObjectStore> = match config.session_storage {
        SessionStorage::S3 => Arc::new(S3Store::from_env().await),
        SessionStorage::Db => Arc::new(MemoryStore::new()),
    };

    // The engine and contact index are provided by the embedding service, standalone we run
    // the scripted engine against an empty index.
    warn!("Using the scripted engine and an empty contact index");

    let rt = Runtime {
        db,
        readonly_db,
        redis,
        store,
        channel_logs: Arc::new(MemoryLogStore::new()),
        engine: Arc::new(MockEngine::new()),
        search: Arc::new(StaticSearch::new()),
        assets: Arc::new(AssetCache::new(config.asset_cache_ttl)),
        config: Arc::new(config),
    };

    let workers = Workers::start(&rt);

    info!("Flowroom Core ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    workers.shutdown().await;

    info!("Flowroom Core shut down");

    Ok(())
}
