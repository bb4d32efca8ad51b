// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry worker: re-queues runs parked in `NEEDS_RETRY`.
//!
//! The status flip is written before the enqueue. A crash between the two
//! leaves the run QUEUED-but-not-queued, which the next pass of whoever
//! created it cannot distinguish from a fresh run — benign. The opposite
//! order would leave a queued message for a run still marked NEEDS_RETRY,
//! which the submit worker would reject as "not QUEUED".

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use stevedore_core::events::EventSink;
use stevedore_core::queue::Queue;
use stevedore_core::run::{Run, RunPatch, RunStatus};
use stevedore_core::store::StateStore;

use crate::error::Result;

/// Configuration for the retry worker.
#[derive(Debug, Clone)]
pub struct RetryWorkerConfig {
    /// How often to scan for runs needing retry.
    pub poll_interval: Duration,
    /// Maximum runs requeued per pass.
    pub batch_size: i64,
}

impl Default for RetryWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 10,
        }
    }
}

/// Background worker that resets `NEEDS_RETRY` runs back to `QUEUED`.
pub struct RetryWorker {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    events: Arc<dyn EventSink>,
    config: RetryWorkerConfig,
    shutdown: Arc<Notify>,
}

impl RetryWorker {
    /// Create a new retry worker.
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        events: Arc<dyn EventSink>,
        config: RetryWorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the retry worker loop.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Retry worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retry worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Retry pass failed");
                    }
                }
            }
        }

        info!("Retry worker stopped");
    }

    /// One retry pass over a bounded oldest-first page.
    pub async fn run_once(&self) -> Result<()> {
        let page = self.store.list_needs_retry(self.config.batch_size).await?;
        if page.is_empty() {
            debug!("No runs need retry");
            return Ok(());
        }

        info!(count = page.len(), "Requeueing runs for retry");
        for run in page {
            if let Err(e) = self.requeue(&run).await {
                error!(run_id = %run.run_id, error = %e, "Failed to requeue run");
            }
        }
        Ok(())
    }

    async fn requeue(&self, run: &Run) -> Result<()> {
        let url = self.queue.url_for(&run.cluster_name, true).await?;

        // Flip before enqueue; see the module docs for why this order.
        let updated = self
            .store
            .update_run(&run.run_id, &RunPatch::status(RunStatus::Queued))
            .await?;
        self.queue.enqueue(&url, &updated).await?;

        self.events
            .run_status_changed(&updated, RunStatus::NeedsRetry);
        self.events.count("retry.requeued", 1);
        info!(run_id = %run.run_id, cluster_name = %run.cluster_name, "Run requeued for retry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RetryWorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 10);
    }
}
