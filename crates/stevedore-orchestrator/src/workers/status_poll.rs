// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling status worker.
//!
//! Actively asks the engine for state deltas on in-flight runs. Multiple
//! replicas may run concurrently; a short-TTL distributed lock keyed by
//! `(run_id, "status")` serializes reconciliation per run, and a replica
//! that loses the lock skips silently until its next cycle.
//!
//! A run the backend has no trace of is only failed once it has been queued
//! longer than the configured stale threshold; before that the absence is
//! treated as the backend still warming up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stevedore_core::events::EventSink;
use stevedore_core::lock::{DistributedLock, status_lock_key};
use stevedore_core::run::{Run, RunPatch, RunStatus};
use stevedore_core::store::{ListRunsOptions, SortField, SortOrder, StateStore};

use crate::engine::{Engine, EngineError};
use crate::error::Result;

/// Configuration for the polling status worker.
#[derive(Debug, Clone)]
pub struct StatusPollWorkerConfig {
    /// How often to run a reconciliation pass.
    pub poll_interval: Duration,
    /// Maximum candidates per pass.
    pub batch_size: i64,
    /// TTL of the per-run reconciliation lock.
    pub lock_ttl: Duration,
    /// How long a run may sit without a backend trace before it is failed.
    pub stale_queued_timeout: Duration,
}

impl Default for StatusPollWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            lock_ttl: Duration::from_secs(15),
            stale_queued_timeout: Duration::from_secs(3600),
        }
    }
}

/// Background worker that polls the engine for status deltas.
pub struct StatusPollWorker {
    store: Arc<dyn StateStore>,
    engine: Arc<dyn Engine>,
    lock: Arc<dyn DistributedLock>,
    events: Arc<dyn EventSink>,
    config: StatusPollWorkerConfig,
    /// Identifies this replica as a lock owner.
    owner_token: String,
    shutdown: Arc<Notify>,
}

impl StatusPollWorker {
    /// Create a new polling status worker.
    pub fn new(
        store: Arc<dyn StateStore>,
        engine: Arc<dyn Engine>,
        lock: Arc<dyn DistributedLock>,
        events: Arc<dyn EventSink>,
        config: StatusPollWorkerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            lock,
            events,
            config,
            owner_token: Uuid::new_v4().to_string(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the polling status worker loop.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            lock_ttl_secs = self.config.lock_ttl.as_secs(),
            engine = self.engine.name(),
            "Polling status worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Polling status worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }

        info!("Polling status worker stopped");
    }

    /// One reconciliation pass over a bounded page of in-flight runs.
    pub async fn run_once(&self) -> Result<()> {
        let (candidates, _) = self
            .store
            .list_runs(&ListRunsOptions {
                statuses: vec![RunStatus::Pending, RunStatus::Running],
                sort_by: SortField::QueuedAt,
                order: SortOrder::Asc,
                limit: self.config.batch_size,
                ..ListRunsOptions::default()
            })
            .await?;

        for candidate in candidates {
            if let Err(e) = self.reconcile(&candidate.run_id).await {
                error!(run_id = %candidate.run_id, error = %e, "Failed to reconcile run");
            }
        }
        Ok(())
    }

    async fn reconcile(&self, run_id: &str) -> Result<()> {
        // Reload the authoritative copy; the listing may already be stale.
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(());
        };
        if run.status.is_terminal() {
            return Ok(());
        }

        let acquired = self
            .lock
            .try_acquire(
                &status_lock_key(&run.run_id),
                &self.owner_token,
                self.config.lock_ttl,
            )
            .await?;
        if !acquired {
            // Another replica owns this update cycle; not an error.
            debug!(run_id = %run.run_id, "Reconciliation lock held elsewhere, skipping");
            self.events.count("status_poll.lock_contention", 1);
            return Ok(());
        }

        match self.engine.fetch_status(&run).await {
            Ok(Some(update)) => self.apply_update(&run, update).await,
            Ok(None) => Ok(()),
            Err(EngineError::NotFound(_)) => self.handle_not_found(&run).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_update(
        &self,
        run: &Run,
        update: stevedore_core::queue::StatusUpdate,
    ) -> Result<()> {
        // Write only on material change; backends repeat themselves.
        if update.status == run.status && update.exit_code == run.exit_code {
            self.events.count("status_poll.unchanged", 1);
            return Ok(());
        }
        if !run.status.can_advance_to(update.status) {
            debug!(
                run_id = %run.run_id,
                stored = %run.status,
                reported = %update.status,
                "Polled status does not advance the run"
            );
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
        self.events.count("status_poll.applied", 1);
        info!(
            run_id = %updated.run_id,
            previous = %run.status,
            status = %updated.status,
            "Run status reconciled from poll"
        );
        Ok(())
    }

    async fn handle_not_found(&self, run: &Run) -> Result<()> {
        let stale = run
            .queued_at
            .map(|queued_at| {
                Utc::now() - queued_at
                    > chrono::Duration::from_std(self.config.stale_queued_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600))
            })
            .unwrap_or(false);

        if !stale {
            // Recent enough that the backend may simply not know it yet.
            debug!(run_id = %run.run_id, "Backend has no trace yet, waiting");
            return Ok(());
        }

        warn!(
            run_id = %run.run_id,
            queued_at = ?run.queued_at,
            "Backend has no trace of run past the stale threshold, stopping it"
        );
        let updated = self
            .store
            .update_run(
                &run.run_id,
                &RunPatch::stopped(format!(
                    "Backend reports no trace of this run after {}s in flight",
                    self.config.stale_queued_timeout.as_secs()
                )),
            )
            .await?;
        self.events.run_status_changed(&updated, run.status);
        self.events.count("status_poll.stale_not_found", 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = StatusPollWorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.lock_ttl, Duration::from_secs(15));
        assert_eq!(config.stale_queued_timeout, Duration::from_secs(3600));
    }
}
