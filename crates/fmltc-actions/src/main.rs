// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fmltc worker
//!
//! Consumes the action queue and runs resumable actions:
//! - Frame extraction from uploaded videos
//! - Dataset production (TFRecord shards) and zip exports
//! - Training monitoring and minute accounting
//! - Interactive tracking sessions
//! - Deletion and team administration

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use fmltc_actions::resumption::SysinfoMemoryProbe;
use fmltc_actions::training::MlEngineClient;
use fmltc_actions::{
    ActionDispatcher, ActionServices, ActionSettings, ActionWorker, ActionWorkerConfig,
};
use fmltc_core::Config;
use fmltc_core::blob::{BlobStore, FsBlobStore};
use fmltc_core::clock::SystemClock;
use fmltc_core::config_store::{ConfigStore, MemoryConfigStore, RedisConfigStore};
use fmltc_core::persistence::SqlitePersistence;
use fmltc_core::queue::BlobActionQueue;
use fmltc_media::video::FfmpegOpener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fmltc_actions=info,fmltc_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        blob_root = %config.blob_root.display(),
        time_budget_secs = config.action_time_budget.as_secs(),
        memory_limit_bytes = config.active_memory_limit_bytes,
        concurrency = config.worker_concurrency,
        "Starting fmltc worker"
    );

    let store = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    info!("Connected to database");

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
        &config.blob_root,
        &config.blob_base_url,
        &config.blob_signing_key,
    ));
    let queue = Arc::new(BlobActionQueue::new(blobs.clone()));
    let receiver = queue
        .subscribe()
        .context("queue notifications already taken")?;

    let config_store: Arc<dyn ConfigStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisConfigStore::connect(url).await?;
            info!("Using Redis config store");
            Arc::new(store)
        }
        None => Arc::new(MemoryConfigStore::new()),
    };

    let services = ActionServices {
        store,
        blobs,
        queue,
        config_store,
        clock: Arc::new(SystemClock),
        training: Arc::new(MlEngineClient::new(
            &config.training_api_url,
            &config.project_id,
            config.training_api_token.clone(),
        )),
        video_opener: Arc::new(FfmpegOpener::new()),
        memory: Arc::new(SysinfoMemoryProbe::new()),
        settings: ActionSettings::from_config(&config),
    };

    let worker = ActionWorker::new(
        ActionDispatcher::new(services),
        receiver,
        ActionWorkerConfig {
            concurrency: config.worker_concurrency,
            ..ActionWorkerConfig::default()
        },
    );
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(worker.run());

    info!("Worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.notify_one();
    handle.await?;

    info!("fmltc worker shut down");

    Ok(())
}
