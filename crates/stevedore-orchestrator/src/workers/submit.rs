// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submit worker: drains the cluster queues and launches runs.
//!
//! The queue payload is a trigger, not truth. Every receipt is checked
//! against the authoritative store before launching, which makes duplicate
//! and stale deliveries ack-and-skip no-ops. A retryable launch failure
//! leaves both the store and the message untouched so the visibility
//! timeout redelivers the attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use stevedore_core::events::EventSink;
use stevedore_core::queue::{Queue, RunReceipt};
use stevedore_core::run::{RunPatch, RunStatus};
use stevedore_core::store::StateStore;

use crate::engine::Engine;
use crate::error::Result;

/// Configuration for the submit worker.
#[derive(Debug, Clone)]
pub struct SubmitWorkerConfig {
    /// How often to drain the cluster queues.
    pub poll_interval: Duration,
}

impl Default for SubmitWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
        }
    }
}

/// Background worker that submits queued runs to the engine.
pub struct SubmitWorker {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    engine: Arc<dyn Engine>,
    events: Arc<dyn EventSink>,
    config: SubmitWorkerConfig,
    shutdown: Arc<Notify>,
}

impl SubmitWorker {
    /// Create a new submit worker.
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        engine: Arc<dyn Engine>,
        events: Arc<dyn EventSink>,
        config: SubmitWorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            engine,
            events,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the submit worker loop.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            engine = self.engine.name(),
            "Submit worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Submit worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Submit pass failed");
                    }
                }
            }
        }

        info!("Submit worker stopped");
    }

    /// One submit pass: receive at most one run per known queue.
    pub async fn run_once(&self) -> Result<()> {
        let urls = self.queue.list().await?;
        for url in urls {
            match self.queue.receive_run(&url).await {
                Ok(Some(receipt)) => {
                    if let Err(e) = self.process_receipt(receipt).await {
                        error!(queue = %url, error = %e, "Failed to process run receipt");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %url, error = %e, "Failed to receive from queue");
                }
            }
        }
        Ok(())
    }

    async fn process_receipt(&self, receipt: RunReceipt) -> Result<()> {
        let run_id = receipt.run.run_id.clone();

        let Some(run) = self.store.get_run(&run_id).await? else {
            // Presumably deleted since it was enqueued.
            warn!(run_id = %run_id, "Queued run no longer exists, acking");
            self.queue.ack(&receipt.handle).await?;
            return Ok(());
        };

        let Some(definition) = self.store.get_definition(&run.definition_id).await? else {
            warn!(
                run_id = %run_id,
                definition_id = %run.definition_id,
                "Definition for queued run no longer exists, acking"
            );
            self.queue.ack(&receipt.handle).await?;
            return Ok(());
        };

        if run.status != RunStatus::Queued {
            // Stale or duplicate trigger; already processed.
            debug!(
                run_id = %run_id,
                status = %run.status,
                "Run is no longer QUEUED, acking stale trigger"
            );
            self.events.count("submit.stale_trigger", 1);
            self.queue.ack(&receipt.handle).await?;
            return Ok(());
        }

        match self.engine.execute(&definition, run).await {
            Ok(launched) => {
                let patch = RunPatch {
                    status: Some(launched.status),
                    backend_handle: launched.backend_handle.clone(),
                    instance_id: launched.instance_id.clone(),
                    instance_dns_name: launched.instance_dns_name.clone(),
                    started_at: launched.started_at,
                    ..RunPatch::default()
                };
                let updated = self.store.update_run(&run_id, &patch).await?;
                self.events.run_submitted(&updated, &definition);
                self.events.count("submit.launched", 1);
                self.queue.ack(&receipt.handle).await?;
                info!(
                    run_id = %run_id,
                    backend_handle = ?updated.backend_handle,
                    status = %updated.status,
                    "Run submitted"
                );
            }
            Err(e) if e.is_retryable() => {
                // No mutation, no ack: the visibility timeout redelivers
                // this receipt and the attempt is retried untouched.
                debug!(run_id = %run_id, error = %e, "Retryable launch failure, leaving for redelivery");
                self.events.count("submit.retryable_failure", 1);
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Permanent launch failure, stopping run");
                let updated = self
                    .store
                    .update_run(&run_id, &RunPatch::stopped(format!("Submission failed: {e}")))
                    .await?;
                self.events.run_status_changed(&updated, RunStatus::Queued);
                self.events.count("submit.permanent_failure", 1);
                self.queue.ack(&receipt.handle).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SubmitWorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(3));
    }
}
