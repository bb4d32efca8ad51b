// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory state store for tests and embedded single-process deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::definition::Definition;
use crate::error::{CoreError, Result};
use crate::run::{Run, RunPatch};

use super::{ListRunsOptions, SortField, SortOrder, StateStore, apply_patch};

#[derive(Default)]
struct Inner {
    runs: BTreeMap<String, Run>,
    definitions: BTreeMap<String, Definition>,
}

/// In-memory [`StateStore`] implementation.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(run: &Run, options: &ListRunsOptions) -> bool {
    if !options.statuses.is_empty() && !options.statuses.contains(&run.status) {
        return false;
    }
    if let Some(cluster) = &options.cluster_name
        && &run.cluster_name != cluster
    {
        return false;
    }
    if let Some(group) = &options.group_name
        && &run.group_name != group
    {
        return false;
    }
    if let Some(alias) = &options.alias
        && &run.alias != alias
    {
        return false;
    }
    if !options.engines.is_empty() {
        match &run.engine {
            Some(engine) if options.engines.contains(engine) => {}
            _ => return false,
        }
    }
    options
        .env_filters
        .iter()
        .all(|filter| run.env_value(&filter.name) == Some(filter.value.as_str()))
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.get(run_id).cloned())
    }

    async fn get_run_by_handle(&self, backend_handle: &str) -> Result<Option<Run>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .find(|r| r.backend_handle.as_deref() == Some(backend_handle))
            .cloned())
    }

    async fn update_run(&self, run_id: &str, patch: &RunPatch) -> Result<Run> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))?;
        apply_patch(run, patch);
        Ok(run.clone())
    }

    async fn list_runs(&self, options: &ListRunsOptions) -> Result<(Vec<Run>, i64)> {
        let inner = self.inner.lock().await;
        let mut items: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| matches(r, options))
            .cloned()
            .collect();
        let total = items.len() as i64;

        items.sort_by(|a, b| {
            let ordering = match options.sort_by {
                SortField::QueuedAt => a.queued_at.cmp(&b.queued_at),
                SortField::StartedAt => a.started_at.cmp(&b.started_at),
                SortField::FinishedAt => a.finished_at.cmp(&b.finished_at),
                SortField::Status => a.status.as_str().cmp(b.status.as_str()),
            };
            match options.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let offset = options.offset.max(0) as usize;
        let limit = if options.limit > 0 {
            options.limit as usize
        } else {
            items.len()
        };
        let page = items.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn list_needs_retry(&self, limit: i64) -> Result<Vec<Run>> {
        let inner = self.inner.lock().await;
        let mut items: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.status == crate::run::RunStatus::NeedsRetry)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn create_definition(&self, definition: &Definition) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .definitions
            .insert(definition.definition_id.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, definition_id: &str) -> Result<Option<Definition>> {
        let inner = self.inner.lock().await;
        Ok(inner.definitions.get(definition_id).cloned())
    }

    async fn get_definition_by_alias(&self, alias: &str) -> Result<Option<Definition>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .definitions
            .values()
            .find(|d| d.alias == alias)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{EnvVar, RunStatus};
    use chrono::{Duration, Utc};

    fn run_with(id: &str, status: RunStatus, minutes_ago: i64) -> Run {
        Run {
            run_id: id.to_string(),
            definition_id: "def-1".to_string(),
            alias: "sleeper".to_string(),
            cluster_name: "default".to_string(),
            group_name: "batch".to_string(),
            engine: Some("process".to_string()),
            status,
            queued_at: Some(Utc::now() - Duration::minutes(minutes_ago)),
            started_at: None,
            finished_at: None,
            exit_code: None,
            exit_reason: None,
            backend_handle: None,
            instance_id: None,
            instance_dns_name: None,
            env: vec![EnvVar::new("OWNER", "ops")],
            command: None,
            cpu: None,
            memory: None,
            gpu: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let store = MemoryStateStore::new();
        store
            .create_run(&run_with("run-1", RunStatus::Queued, 0))
            .await
            .unwrap();

        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert!(store.get_run("run-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_run_by_handle() {
        let store = MemoryStateStore::new();
        let mut run = run_with("run-1", RunStatus::Pending, 0);
        run.backend_handle = Some("container-abc".to_string());
        store.create_run(&run).await.unwrap();

        let found = store.get_run_by_handle("container-abc").await.unwrap();
        assert_eq!(found.unwrap().run_id, "run-1");
        assert!(store.get_run_by_handle("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_run_patch_semantics() {
        let store = MemoryStateStore::new();
        store
            .create_run(&run_with("run-1", RunStatus::Queued, 0))
            .await
            .unwrap();

        let started = Utc::now();
        let updated = store
            .update_run(
                "run-1",
                &RunPatch {
                    status: Some(RunStatus::Running),
                    started_at: Some(started),
                    ..RunPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Running);
        assert_eq!(updated.started_at, Some(started));
        // Untouched fields survive.
        assert_eq!(updated.env.len(), 1);

        // started_at is first-writer-wins.
        let later = store
            .update_run(
                "run-1",
                &RunPatch {
                    started_at: Some(started + Duration::minutes(5)),
                    ..RunPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(later.started_at, Some(started));
    }

    #[tokio::test]
    async fn test_update_missing_run_is_not_found() {
        let store = MemoryStateStore::new();
        let err = store
            .update_run("ghost", &RunPatch::status(RunStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_pagination() {
        let store = MemoryStateStore::new();
        store
            .create_run(&run_with("run-1", RunStatus::Stopped, 30))
            .await
            .unwrap();
        store
            .create_run(&run_with("run-2", RunStatus::Running, 20))
            .await
            .unwrap();
        store
            .create_run(&run_with("run-3", RunStatus::Running, 10))
            .await
            .unwrap();

        let (items, total) = store
            .list_runs(&ListRunsOptions {
                statuses: vec![RunStatus::Running],
                sort_by: SortField::QueuedAt,
                order: SortOrder::Asc,
                limit: 1,
                offset: 0,
                ..ListRunsOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].run_id, "run-2");

        let (items, total) = store
            .list_runs(&ListRunsOptions {
                env_filters: vec![EnvVar::new("OWNER", "nobody")],
                limit: 10,
                ..ListRunsOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 0);
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_list_runs_engine_filter() {
        let store = MemoryStateStore::new();
        let mut other = run_with("run-1", RunStatus::Running, 5);
        other.engine = Some("container".to_string());
        store.create_run(&other).await.unwrap();
        store
            .create_run(&run_with("run-2", RunStatus::Running, 5))
            .await
            .unwrap();

        let (items, total) = store
            .list_runs(&ListRunsOptions {
                engines: vec!["process".to_string()],
                limit: 10,
                ..ListRunsOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].run_id, "run-2");
    }

    #[tokio::test]
    async fn test_list_needs_retry_oldest_first() {
        let store = MemoryStateStore::new();
        store
            .create_run(&run_with("run-new", RunStatus::NeedsRetry, 1))
            .await
            .unwrap();
        store
            .create_run(&run_with("run-old", RunStatus::NeedsRetry, 60))
            .await
            .unwrap();
        store
            .create_run(&run_with("run-ok", RunStatus::Running, 60))
            .await
            .unwrap();

        let page = store.list_needs_retry(10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].run_id, "run-old");
        assert_eq!(page[1].run_id, "run-new");

        let bounded = store.list_needs_retry(1).await.unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].run_id, "run-old");
    }

    #[tokio::test]
    async fn test_definitions_by_id_and_alias() {
        let store = MemoryStateStore::new();
        let definition = Definition {
            definition_id: "def-1".to_string(),
            image: "example/sleeper:1".to_string(),
            alias: "sleeper".to_string(),
            group_name: "batch".to_string(),
            command: Some("sleep 1".to_string()),
            env: vec![],
            memory: Some(256),
            cpu: Some(500),
            gpu: None,
            ports: vec![],
            tags: vec!["nightly".to_string()],
            template_handle: None,
        };
        store.create_definition(&definition).await.unwrap();

        assert_eq!(
            store.get_definition("def-1").await.unwrap().unwrap().alias,
            "sleeper"
        );
        assert_eq!(
            store
                .get_definition_by_alias("sleeper")
                .await
                .unwrap()
                .unwrap()
                .definition_id,
            "def-1"
        );
        assert!(store.get_definition("def-2").await.unwrap().is_none());
    }
}
