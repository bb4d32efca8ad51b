// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State store abstraction.
//!
//! The store is the single source of truth for a run's persisted fields.
//! Queue payloads are triggers; workers always reconcile against the store
//! before applying a possibly-stale update.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStateStore;
pub use self::postgres::PostgresStateStore;

use async_trait::async_trait;

use crate::definition::Definition;
use crate::error::Result;
use crate::run::{EnvVar, Run, RunPatch, RunStatus};

/// Field to sort run listings by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    /// Creation/enqueue time (default).
    #[default]
    QueuedAt,
    /// Backend start time.
    StartedAt,
    /// Terminal time.
    FinishedAt,
    /// Lifecycle status.
    Status,
}

/// Sort direction for run listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Newest first (default).
    #[default]
    Desc,
    /// Oldest first.
    Asc,
}

/// Filter and pagination options for listing runs.
#[derive(Debug, Clone, Default)]
pub struct ListRunsOptions {
    /// Restrict to these statuses; empty means all.
    pub statuses: Vec<RunStatus>,
    /// Restrict to a cluster.
    pub cluster_name: Option<String>,
    /// Restrict to a group.
    pub group_name: Option<String>,
    /// Restrict to runs of one definition alias.
    pub alias: Option<String>,
    /// Require these env name/value pairs on the run.
    pub env_filters: Vec<EnvVar>,
    /// Restrict to runs owned by these engines; empty means all.
    pub engines: Vec<String>,
    /// Sort field.
    pub sort_by: SortField,
    /// Sort direction.
    pub order: SortOrder,
    /// Maximum results to return.
    pub limit: i64,
    /// Pagination offset.
    pub offset: i64,
}

/// Persistence operations the orchestration core requires.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new run.
    async fn create_run(&self, run: &Run) -> Result<()>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Resolve the run owning a backend correlation handle.
    ///
    /// The handle index lives in the store, not in worker memory, so any
    /// worker replica can resolve inbound status events.
    async fn get_run_by_handle(&self, backend_handle: &str) -> Result<Option<Run>>;

    /// Apply a partial update and return the stored run.
    ///
    /// Unset patch fields leave existing values untouched; timestamps are
    /// first-writer-wins (see [`RunPatch`]).
    async fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<Run>;

    /// List runs matching the filter, returning the page and the total count.
    async fn list_runs(&self, options: &ListRunsOptions) -> Result<(Vec<Run>, i64)>;

    /// Bounded oldest-first page of runs parked in `NeedsRetry`.
    async fn list_needs_retry(&self, limit: i64) -> Result<Vec<Run>>;

    /// Persist a new definition.
    async fn create_definition(&self, definition: &Definition) -> Result<()>;

    /// Fetch a definition by id.
    async fn get_definition(&self, definition_id: &str) -> Result<Option<Definition>>;

    /// Fetch a definition by its unique alias.
    async fn get_definition_by_alias(&self, alias: &str) -> Result<Option<Definition>>;
}

/// Merge a patch into a run, enforcing the patch semantics shared by every
/// store implementation: unset fields untouched, timestamps
/// first-writer-wins.
pub(crate) fn apply_patch(run: &mut Run, patch: &RunPatch) {
    if let Some(status) = patch.status {
        run.status = status;
    }
    if run.started_at.is_none() {
        run.started_at = patch.started_at;
    }
    if run.finished_at.is_none() {
        run.finished_at = patch.finished_at;
    }
    if patch.exit_code.is_some() {
        run.exit_code = patch.exit_code;
    }
    if patch.exit_reason.is_some() {
        run.exit_reason = patch.exit_reason.clone();
    }
    if patch.backend_handle.is_some() {
        run.backend_handle = patch.backend_handle.clone();
    }
    if patch.instance_id.is_some() {
        run.instance_id = patch.instance_id.clone();
    }
    if patch.instance_dns_name.is_some() {
        run.instance_dns_name = patch.instance_dns_name.clone();
    }
}
