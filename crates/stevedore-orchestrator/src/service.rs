// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run service: the contract the orchestration core exposes upward.
//!
//! Creation validates placement and image once, persists the run as
//! `QUEUED`, and enqueues it onto its cluster queue — from there the worker
//! loops own the lifecycle. Termination is the sanctioned direct path to
//! `STOPPED` from any state.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use stevedore_core::definition::Definition;
use stevedore_core::events::EventSink;
use stevedore_core::queue::Queue;
use stevedore_core::run::{EnvVar, Run, RunPatch, RunStatus};
use stevedore_core::store::{ListRunsOptions, StateStore};

use crate::engine::{Engine, EngineError};
use crate::error::{Error, Result};
use crate::validate::{ClusterValidator, ImageValidator};

/// How a definition is referenced when creating a run.
#[derive(Debug, Clone)]
pub enum DefinitionRef {
    /// By definition id.
    Id(String),
    /// By unique alias.
    Alias(String),
}

/// Request to create a run.
#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    /// Definition to execute.
    pub definition: DefinitionRef,
    /// Target cluster.
    pub cluster_name: String,
    /// Env overrides layered over the definition's env.
    pub env: Vec<EnvVar>,
    /// Command override.
    pub command: Option<String>,
    /// CPU request override (millicores).
    pub cpu: Option<i64>,
    /// Memory request override (MiB).
    pub memory: Option<i64>,
    /// GPU count override.
    pub gpu: Option<i64>,
}

/// Upward-facing run operations.
pub struct RunService {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    engine: Arc<dyn Engine>,
    events: Arc<dyn EventSink>,
    cluster_validator: Arc<dyn ClusterValidator>,
    image_validator: Arc<dyn ImageValidator>,
}

impl RunService {
    /// Create the service over its collaborators.
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        engine: Arc<dyn Engine>,
        events: Arc<dyn EventSink>,
        cluster_validator: Arc<dyn ClusterValidator>,
        image_validator: Arc<dyn ImageValidator>,
    ) -> Self {
        Self {
            store,
            queue,
            engine,
            events,
            cluster_validator,
            image_validator,
        }
    }

    /// Register a definition: backend template first, then the store.
    pub async fn register_definition(&self, definition: Definition) -> Result<Definition> {
        if !self
            .image_validator
            .is_image_valid(&definition.image)
            .await?
        {
            return Err(Error::ImageRejected(definition.image));
        }
        let defined = self.engine.define(definition).await?;
        self.store.create_definition(&defined).await?;
        info!(
            definition_id = %defined.definition_id,
            alias = %defined.alias,
            template_handle = ?defined.template_handle,
            "Definition registered"
        );
        Ok(defined)
    }

    /// Create a run: validate once, persist `QUEUED`, enqueue the trigger.
    pub async fn create(&self, request: CreateRunRequest) -> Result<Run> {
        let definition = match &request.definition {
            DefinitionRef::Id(id) => self
                .store
                .get_definition(id)
                .await?
                .ok_or_else(|| Error::DefinitionNotFound(id.clone()))?,
            DefinitionRef::Alias(alias) => self
                .store
                .get_definition_by_alias(alias)
                .await?
                .ok_or_else(|| Error::DefinitionNotFound(alias.clone()))?,
        };

        if !self
            .image_validator
            .is_image_valid(&definition.image)
            .await?
        {
            return Err(Error::ImageRejected(definition.image));
        }
        if !self
            .cluster_validator
            .can_be_run(&request.cluster_name, &definition)
            .await?
        {
            return Err(Error::ClusterRejected {
                cluster: request.cluster_name,
                definition: definition.alias,
            });
        }

        let run = Run {
            run_id: Run::generate_id(),
            definition_id: definition.definition_id.clone(),
            alias: definition.alias.clone(),
            cluster_name: request.cluster_name.clone(),
            group_name: definition.group_name.clone(),
            engine: Some(self.engine.name().to_string()),
            status: RunStatus::Queued,
            queued_at: Some(Utc::now()),
            started_at: None,
            finished_at: None,
            exit_code: None,
            exit_reason: None,
            backend_handle: None,
            instance_id: None,
            instance_dns_name: None,
            env: merge_env(&definition.env, &request.env),
            command: request.command,
            cpu: request.cpu,
            memory: request.memory,
            gpu: request.gpu,
        };

        self.store.create_run(&run).await?;
        let url = self.queue.url_for(&run.cluster_name, true).await?;
        self.queue.enqueue(&url, &run).await?;
        self.events.count("service.run_created", 1);
        info!(
            run_id = %run.run_id,
            alias = %run.alias,
            cluster_name = %run.cluster_name,
            "Run created and enqueued"
        );
        Ok(run)
    }

    /// Fetch a run by id.
    pub async fn get(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// List runs with filters and pagination.
    pub async fn list(&self, options: &ListRunsOptions) -> Result<(Vec<Run>, i64)> {
        Ok(self.store.list_runs(options).await?)
    }

    /// Terminate a run, forcing it to `STOPPED` from any state.
    pub async fn terminate(&self, run_id: &str) -> Result<Run> {
        let run = self.get(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        match self.engine.terminate(&run).await {
            Ok(()) => {}
            // Nothing on the backend to stop; still force the store over.
            Err(EngineError::NotFound(_)) | Err(EngineError::Unsupported(_)) => {}
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Engine terminate failed, stopping run anyway");
            }
        }

        let updated = self
            .store
            .update_run(run_id, &RunPatch::stopped("Terminated by user"))
            .await?;
        self.events.run_status_changed(&updated, run.status);
        self.events.count("service.run_terminated", 1);
        Ok(updated)
    }
}

/// Layer run overrides over definition env: definition order is preserved,
/// overrides win on name collision, and new names append in their order.
fn merge_env(base: &[EnvVar], overrides: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = base
        .iter()
        .map(|var| {
            overrides
                .iter()
                .find(|o| o.name == var.name)
                .unwrap_or(var)
                .clone()
        })
        .collect();
    for var in overrides {
        if !merged.iter().any(|m| m.name == var.name) {
            merged.push(var.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_env_overrides_win_and_order_is_kept() {
        let base = vec![EnvVar::new("A", "1"), EnvVar::new("B", "2")];
        let overrides = vec![EnvVar::new("B", "override"), EnvVar::new("C", "3")];

        let merged = merge_env(&base, &overrides);
        assert_eq!(
            merged,
            vec![
                EnvVar::new("A", "1"),
                EnvVar::new("B", "override"),
                EnvVar::new("C", "3"),
            ]
        );
    }

    #[test]
    fn test_merge_env_with_no_overrides() {
        let base = vec![EnvVar::new("A", "1")];
        assert_eq!(merge_env(&base, &[]), base);
    }

    #[test]
    fn test_merge_env_names_stay_unique() {
        let merged = merge_env(
            &[EnvVar::new("A", "1")],
            &[EnvVar::new("A", "2")],
        );
        assert_eq!(merged, vec![EnvVar::new("A", "2")]);
    }
}
