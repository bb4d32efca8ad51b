// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for orchestrator integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use stevedore_core::definition::Definition;
use stevedore_core::events::EventSink;
use stevedore_core::lock::MemoryLock;
use stevedore_core::queue::{MemoryQueue, Queue, QueueUrl};
use stevedore_core::run::{EnvVar, Run, RunStatus};
use stevedore_core::store::{MemoryStateStore, StateStore};
use stevedore_orchestrator::engine::MockEngine;

/// Deployment token used across the tests.
pub const DEPLOYMENT: &str = "test";

/// Event sink that records everything for assertions.
#[derive(Default)]
pub struct RecordingEventSink {
    /// (run_id, previous, new) per status change.
    pub status_changes: Mutex<Vec<(String, RunStatus, RunStatus)>>,
    /// run_id per submission event.
    pub submissions: Mutex<Vec<String>>,
    /// (name, value) per counter bump.
    pub counters: Mutex<Vec<(&'static str, u64)>>,
}

impl RecordingEventSink {
    pub fn status_change_count(&self) -> usize {
        self.status_changes.lock().unwrap().len()
    }

    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .sum()
    }
}

impl EventSink for RecordingEventSink {
    fn run_submitted(&self, run: &Run, _definition: &Definition) {
        self.submissions.lock().unwrap().push(run.run_id.clone());
    }

    fn run_status_changed(&self, run: &Run, previous: RunStatus) {
        self.status_changes
            .lock()
            .unwrap()
            .push((run.run_id.clone(), previous, run.status));
    }

    fn count(&self, name: &'static str, value: u64) {
        self.counters.lock().unwrap().push((name, value));
    }
}

/// In-memory collaborators plus the mock engine.
pub struct Harness {
    pub store: Arc<MemoryStateStore>,
    pub queue: Arc<MemoryQueue>,
    pub lock: Arc<MemoryLock>,
    pub engine: Arc<MockEngine>,
    pub events: Arc<RecordingEventSink>,
    pub cluster_url: QueueUrl,
    pub status_url: QueueUrl,
}

/// Build a harness with a short visibility timeout.
pub async fn harness() -> Harness {
    let queue = Arc::new(MemoryQueue::new(DEPLOYMENT, Duration::from_millis(50)));
    let cluster_url = queue.url_for("default", true).await.unwrap();
    let status_url = queue.url_for("status", true).await.unwrap();
    Harness {
        store: Arc::new(MemoryStateStore::new()),
        queue,
        lock: Arc::new(MemoryLock::new()),
        engine: Arc::new(MockEngine::new()),
        events: Arc::new(RecordingEventSink::default()),
        cluster_url,
        status_url,
    }
}

/// A definition the mock engine accepts.
pub fn test_definition() -> Definition {
    Definition {
        definition_id: "def-1".to_string(),
        image: "example/sleeper:1".to_string(),
        alias: "sleeper".to_string(),
        group_name: "batch".to_string(),
        command: Some("sleep 1".to_string()),
        env: vec![EnvVar::new("TIER", "batch")],
        memory: Some(256),
        cpu: Some(500),
        gpu: None,
        ports: vec![],
        tags: vec!["nightly".to_string()],
        template_handle: Some("mock-sleeper".to_string()),
    }
}

/// A run of [`test_definition`] in the given status.
pub fn test_run(run_id: &str, status: RunStatus) -> Run {
    Run {
        run_id: run_id.to_string(),
        definition_id: "def-1".to_string(),
        alias: "sleeper".to_string(),
        cluster_name: "default".to_string(),
        group_name: "batch".to_string(),
        engine: Some("mock".to_string()),
        status,
        queued_at: Some(chrono::Utc::now()),
        started_at: None,
        finished_at: None,
        exit_code: None,
        exit_reason: None,
        backend_handle: None,
        instance_id: None,
        instance_dns_name: None,
        env: vec![EnvVar::new("TIER", "batch")],
        command: None,
        cpu: None,
        memory: None,
        gpu: None,
    }
}

/// Seed the store with the test definition and a run, and enqueue the run.
pub async fn seed_queued_run(h: &Harness, run_id: &str) -> Run {
    let run = test_run(run_id, RunStatus::Queued);
    h.store.create_definition(&test_definition()).await.unwrap();
    h.store.create_run(&run).await.unwrap();
    h.queue.enqueue(&h.cluster_url, &run).await.unwrap();
    run
}
