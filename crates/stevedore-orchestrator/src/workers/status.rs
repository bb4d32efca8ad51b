// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message-driven status worker.
//!
//! Consumes status updates pushed by the backend onto the status side
//! channel and reconciles them into the store under the forward-only
//! transition rule. Updates for another deployment, unresolvable backend
//! handles, and out-of-order deliveries are acknowledged without a store
//! write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use stevedore_core::events::EventSink;
use stevedore_core::queue::{Queue, QueueUrl, StatusReceipt};
use stevedore_core::run::{RunPatch, RunStatus};
use stevedore_core::store::StateStore;

use crate::error::Result;

/// Configuration for the message-driven status worker.
#[derive(Debug, Clone)]
pub struct StatusWorkerConfig {
    /// How often to poll the status channel.
    pub poll_interval: Duration,
    /// Active deployment token; updates carrying another token are skipped.
    pub deployment: String,
}

impl Default for StatusWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            deployment: "stevedore".to_string(),
        }
    }
}

/// Background worker that reconciles pushed status updates.
pub struct StatusWorker {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    events: Arc<dyn EventSink>,
    status_url: QueueUrl,
    config: StatusWorkerConfig,
    shutdown: Arc<Notify>,
}

impl StatusWorker {
    /// Create a new status worker consuming from `status_url`.
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        events: Arc<dyn EventSink>,
        status_url: QueueUrl,
        config: StatusWorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            status_url,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the status worker loop.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            status_queue = %self.status_url,
            "Status worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Status worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Status pass failed");
                    }
                }
            }
        }

        info!("Status worker stopped");
    }

    /// One status pass: receive and reconcile at most one update.
    pub async fn run_once(&self) -> Result<()> {
        let Some(receipt) = self.queue.receive_status(&self.status_url).await? else {
            return Ok(());
        };
        self.process_receipt(receipt).await
    }

    async fn process_receipt(&self, receipt: StatusReceipt) -> Result<()> {
        let update = &receipt.update;

        if update.correlation.as_deref() != Some(self.config.deployment.as_str()) {
            // Another deployment sharing the backend; not ours to apply.
            debug!(
                backend_handle = %update.backend_handle,
                correlation = ?update.correlation,
                "Status update belongs to another deployment, acking"
            );
            self.events.count("status.foreign_deployment", 1);
            self.queue.ack(&receipt.handle).await?;
            return Ok(());
        }

        let Some(run) = self.store.get_run_by_handle(&update.backend_handle).await? else {
            warn!(
                backend_handle = %update.backend_handle,
                "No run owns this backend handle, acking"
            );
            self.events.count("status.unresolved_handle", 1);
            self.queue.ack(&receipt.handle).await?;
            return Ok(());
        };

        if !run.status.can_advance_to(update.status) {
            // Duplicate or out-of-order delivery; the store already moved on.
            debug!(
                run_id = %run.run_id,
                stored = %run.status,
                reported = %update.status,
                "Status update does not advance the run, acking"
            );
            self.events.count("status.stale_update", 1);
            self.queue.ack(&receipt.handle).await?;
            return Ok(());
        }

        let now = Utc::now();
        let patch = RunPatch {
            status: Some(update.status),
            started_at: matches!(update.status, RunStatus::Running | RunStatus::Stopped)
                .then_some(now),
            finished_at: (update.status == RunStatus::Stopped).then_some(now),
            exit_code: update.exit_code,
            exit_reason: update.exit_reason.clone(),
            ..RunPatch::default()
        };
        let updated = self.store.update_run(&run.run_id, &patch).await?;
        self.events.run_status_changed(&updated, run.status);
        self.events.count("status.applied", 1);
        self.queue.ack(&receipt.handle).await?;

        info!(
            run_id = %updated.run_id,
            previous = %run.status,
            status = %updated.status,
            "Run status reconciled"
        );
        Ok(())
    }
}
