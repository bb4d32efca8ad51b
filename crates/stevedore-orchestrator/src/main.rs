// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stevedore - Job Execution Orchestrator
//!
//! A long-running service responsible for:
//! - Draining cluster submission queues and launching runs on the engine
//! - Reconciling backend status into the authoritative store
//! - Requeueing runs that failed for transient infrastructure reasons

use std::sync::Arc;

use tracing::{info, warn};

use stevedore_core::lock::PostgresLock;
use stevedore_core::queue::{PostgresQueue, Queue};
use stevedore_core::store::PostgresStateStore;
use stevedore_orchestrator::config::Config;
use stevedore_orchestrator::engine::{EngineSettings, new_engine};
use stevedore_orchestrator::runtime::OrchestratorRuntime;
use stevedore_orchestrator::workers::{
    RetryWorkerConfig, StatusPollWorkerConfig, StatusWorkerConfig, SubmitWorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stevedore=info,stevedore_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        engine = %config.engine_name,
        deployment = %config.deployment,
        clusters = ?config.clusters,
        "Starting Stevedore"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    stevedore_core::migrations::run(&pool).await?;

    info!("Database schema verified");

    // Core collaborators over the shared pool
    let store = Arc::new(PostgresStateStore::new(pool.clone()));
    let queue = Arc::new(
        PostgresQueue::new(pool.clone(), &config.deployment, config.visibility_timeout)
            .with_retention(config.message_retention),
    );
    let lock = Arc::new(PostgresLock::new(pool.clone()));

    // Resolve the status channel before constructing the engine; the
    // push-based engines report into it.
    let status_url = queue.url_for(&config.status_queue_name, true).await?;

    let engine = new_engine(
        &config.engine_name,
        EngineSettings {
            deployment: config.deployment.clone(),
            status_queue_url: status_url,
            container_runtime: config.container_runtime.clone(),
        },
        queue.clone(),
    )?;
    info!(engine = engine.name(), "Engine initialized");

    // Start the runtime
    let runtime = OrchestratorRuntime::builder()
        .store(store)
        .queue(queue)
        .lock(lock)
        .engine(engine)
        .deployment(&config.deployment)
        .clusters(config.clusters.clone())
        .status_queue_name(&config.status_queue_name)
        .submit_config(SubmitWorkerConfig {
            poll_interval: config.submit_poll_interval,
        })
        .status_config(StatusWorkerConfig {
            poll_interval: config.status_poll_interval,
            deployment: config.deployment.clone(),
        })
        .status_poll_config(StatusPollWorkerConfig {
            poll_interval: config.status_poll_interval,
            batch_size: config.status_batch_size,
            lock_ttl: config.lock_ttl,
            stale_queued_timeout: config.stale_queued_timeout,
        })
        .retry_config(RetryWorkerConfig {
            poll_interval: config.retry_poll_interval,
            batch_size: config.retry_batch_size,
        })
        .build()?
        .start()
        .await?;

    info!("Stevedore ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Stevedore shut down");

    Ok(())
}
