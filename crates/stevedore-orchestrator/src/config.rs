// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for stevedore-orchestrator.

use std::time::Duration;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Active engine name ("process", "container", "mock").
    pub engine_name: String,
    /// Deployment token: queue namespace and status correlation value.
    pub deployment: String,
    /// Clusters whose submission queues are created at startup.
    pub clusters: Vec<String>,
    /// Name of the status side channel queue.
    pub status_queue_name: String,
    /// OCI CLI used by the container engine.
    pub container_runtime: String,
    /// Submit worker poll interval.
    pub submit_poll_interval: Duration,
    /// Status worker poll interval (both variants).
    pub status_poll_interval: Duration,
    /// Retry worker poll interval.
    pub retry_poll_interval: Duration,
    /// Retry worker page size.
    pub retry_batch_size: i64,
    /// Polling status worker page size.
    pub status_batch_size: i64,
    /// Queue visibility timeout before an unacked message is redelivered.
    pub visibility_timeout: Duration,
    /// Queue message retention window.
    pub message_retention: Duration,
    /// TTL of the per-run reconciliation lock.
    pub lock_ttl: Duration,
    /// How long a run may sit without a backend trace before it is failed.
    pub stale_queued_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STEVEDORE_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("STEVEDORE_DATABASE_URL"))?;

        let engine_name =
            std::env::var("STEVEDORE_ENGINE").unwrap_or_else(|_| "process".to_string());

        let deployment =
            std::env::var("STEVEDORE_DEPLOYMENT").unwrap_or_else(|_| "stevedore".to_string());

        let clusters: Vec<String> = std::env::var("STEVEDORE_CLUSTERS")
            .unwrap_or_else(|_| "default".to_string())
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if clusters.is_empty() {
            return Err(ConfigError::InvalidValue("STEVEDORE_CLUSTERS"));
        }

        let status_queue_name =
            std::env::var("STEVEDORE_STATUS_QUEUE").unwrap_or_else(|_| "status".to_string());

        let container_runtime =
            std::env::var("STEVEDORE_CONTAINER_RUNTIME").unwrap_or_else(|_| "docker".to_string());

        Ok(Self {
            database_url,
            engine_name,
            deployment,
            clusters,
            status_queue_name,
            container_runtime,
            submit_poll_interval: secs_var("STEVEDORE_SUBMIT_POLL_INTERVAL_SECS", 3)?,
            status_poll_interval: secs_var("STEVEDORE_STATUS_POLL_INTERVAL_SECS", 3)?,
            retry_poll_interval: secs_var("STEVEDORE_RETRY_POLL_INTERVAL_SECS", 30)?,
            retry_batch_size: int_var("STEVEDORE_RETRY_BATCH_SIZE", 10)?,
            status_batch_size: int_var("STEVEDORE_STATUS_BATCH_SIZE", 20)?,
            visibility_timeout: secs_var("STEVEDORE_VISIBILITY_TIMEOUT_SECS", 45)?,
            message_retention: secs_var("STEVEDORE_MESSAGE_RETENTION_SECS", 24 * 3600)?,
            lock_ttl: secs_var("STEVEDORE_LOCK_TTL_SECS", 15)?,
            stale_queued_timeout: secs_var("STEVEDORE_STALE_QUEUED_TIMEOUT_SECS", 3600)?,
        })
    }
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn int_var(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unparseable value.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
