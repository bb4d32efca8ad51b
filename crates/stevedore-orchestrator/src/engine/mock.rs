// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock engine for testing.
//!
//! Outcomes are scripted per call; every operation is recorded so tests can
//! assert on exactly what the workers did.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use stevedore_core::definition::Definition;
use stevedore_core::queue::{RunMetrics, StatusUpdate};
use stevedore_core::run::{Run, RunStatus};

use super::{Engine, EngineError, EngineResult};

/// Scripted outcome for one `execute` call.
#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    /// Launch succeeds; the run advances to `Pending` with a mock handle.
    Success,
    /// Launch fails with a retryable error.
    Retryable(String),
    /// Launch fails with a permanent error.
    Permanent(String),
}

/// Scripted outcome for `fetch_status` on one backend handle.
#[derive(Debug, Clone)]
pub enum FetchScript {
    /// The backend has no trace of the run.
    NotFound,
    /// No state delta.
    NoChange,
    /// Report this update.
    Update(StatusUpdate),
}

/// Mock engine for testing.
#[derive(Default)]
pub struct MockEngine {
    execute_outcomes: Mutex<VecDeque<ExecuteOutcome>>,
    execute_calls: AtomicUsize,
    terminated: Mutex<Vec<String>>,
    enqueued: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
    fetch_scripts: Mutex<HashMap<String, FetchScript>>,
}

impl MockEngine {
    /// Create a mock engine. `execute` succeeds unless an outcome is queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next unscripted `execute` call.
    pub async fn push_execute_outcome(&self, outcome: ExecuteOutcome) {
        self.execute_outcomes.lock().await.push_back(outcome);
    }

    /// Script what `fetch_status` reports for a backend handle.
    pub async fn script_fetch(&self, handle: impl Into<String>, script: FetchScript) {
        self.fetch_scripts.lock().await.insert(handle.into(), script);
    }

    /// Number of `execute` calls observed.
    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    /// Run ids passed to `terminate`.
    pub async fn terminated(&self) -> Vec<String> {
        self.terminated.lock().await.clone()
    }

    /// Run ids passed to `enqueue`.
    pub async fn enqueued(&self) -> Vec<String> {
        self.enqueued.lock().await.clone()
    }

    /// Definition ids passed to `deregister`.
    pub async fn deregistered(&self) -> Vec<String> {
        self.deregistered.lock().await.clone()
    }

    /// The handle `execute` assigns for a run id.
    pub fn handle_for(run_id: &str) -> String {
        format!("mock-{run_id}")
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn define(&self, mut definition: Definition) -> EngineResult<Definition> {
        definition.template_handle = Some(format!("mock-{}", definition.alias));
        Ok(definition)
    }

    async fn deregister(&self, definition: &Definition) -> EngineResult<()> {
        self.deregistered
            .lock()
            .await
            .push(definition.definition_id.clone());
        Ok(())
    }

    async fn execute(&self, _definition: &Definition, mut run: Run) -> EngineResult<Run> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .execute_outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or(ExecuteOutcome::Success);
        match outcome {
            ExecuteOutcome::Success => {
                run.status = RunStatus::Pending;
                run.backend_handle = Some(Self::handle_for(&run.run_id));
                run.instance_id = Some("mock-instance".to_string());
                run.instance_dns_name = Some("mock-instance.local".to_string());
                Ok(run)
            }
            ExecuteOutcome::Retryable(reason) => Err(EngineError::Retryable(reason)),
            ExecuteOutcome::Permanent(reason) => Err(EngineError::Permanent(reason)),
        }
    }

    async fn terminate(&self, run: &Run) -> EngineResult<()> {
        self.terminated.lock().await.push(run.run_id.clone());
        Ok(())
    }

    async fn enqueue(&self, run: &Run) -> EngineResult<()> {
        self.enqueued.lock().await.push(run.run_id.clone());
        Ok(())
    }

    async fn fetch_status(&self, run: &Run) -> EngineResult<Option<StatusUpdate>> {
        let handle = run
            .backend_handle
            .as_deref()
            .ok_or_else(|| EngineError::NotFound(run.run_id.clone()))?;
        match self.fetch_scripts.lock().await.get(handle) {
            Some(FetchScript::NotFound) => Err(EngineError::NotFound(handle.to_string())),
            Some(FetchScript::Update(update)) => Ok(Some(update.clone())),
            Some(FetchScript::NoChange) | None => Ok(None),
        }
    }

    async fn fetch_metrics(&self, _run: &Run) -> EngineResult<RunMetrics> {
        Ok(RunMetrics {
            memory_peak_bytes: Some(64 * 1024 * 1024),
            cpu_usage_usec: Some(1_500_000),
        })
    }
}
