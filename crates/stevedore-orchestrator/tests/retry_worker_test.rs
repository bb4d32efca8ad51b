// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the retry worker: the write-before-enqueue ordering and
//! oldest-first bounded paging.

mod common;

use std::time::Duration;

use common::{Harness, harness, test_run};
use stevedore_core::queue::Queue;
use stevedore_core::run::RunStatus;
use stevedore_core::store::StateStore;
use stevedore_orchestrator::workers::{RetryWorker, RetryWorkerConfig};

fn worker(h: &Harness, batch_size: i64) -> RetryWorker {
    RetryWorker::new(
        h.store.clone(),
        h.queue.clone(),
        h.events.clone(),
        RetryWorkerConfig {
            poll_interval: Duration::from_millis(10),
            batch_size,
        },
    )
}

#[tokio::test]
async fn test_needs_retry_run_is_queued_then_enqueued() {
    let h = harness().await;
    let mut run = test_run("run-1", RunStatus::NeedsRetry);
    run.exit_reason = Some("Process killed by signal".to_string());
    h.store.create_run(&run).await.unwrap();

    worker(&h, 10).run_once().await.unwrap();

    // Store shows QUEUED.
    let stored = h.store.get_run("run-1").await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Queued);

    // Exactly one enqueue, and the enqueued snapshot already carries the
    // flipped status: the write happened strictly before the enqueue.
    assert_eq!(h.queue.depth(&h.cluster_url).await, 1);
    let receipt = h.queue.receive_run(&h.cluster_url).await.unwrap().unwrap();
    assert_eq!(receipt.run.run_id, "run-1");
    assert_eq!(receipt.run.status, RunStatus::Queued);
}

#[tokio::test]
async fn test_runs_in_other_states_are_left_alone() {
    let h = harness().await;
    for (id, status) in [
        ("run-q", RunStatus::Queued),
        ("run-r", RunStatus::Running),
        ("run-s", RunStatus::Stopped),
    ] {
        h.store.create_run(&test_run(id, status)).await.unwrap();
    }

    worker(&h, 10).run_once().await.unwrap();

    assert_eq!(h.queue.depth(&h.cluster_url).await, 0);
    assert_eq!(
        h.store.get_run("run-r").await.unwrap().unwrap().status,
        RunStatus::Running
    );
}

#[tokio::test]
async fn test_page_is_bounded_and_oldest_first() {
    let h = harness().await;
    for (id, minutes_ago) in [("run-new", 1), ("run-mid", 30), ("run-old", 60)] {
        let mut run = test_run(id, RunStatus::NeedsRetry);
        run.queued_at = Some(chrono::Utc::now() - chrono::Duration::minutes(minutes_ago));
        h.store.create_run(&run).await.unwrap();
    }

    worker(&h, 2).run_once().await.unwrap();

    // The two oldest were requeued; the newest waits for the next pass.
    assert_eq!(
        h.store.get_run("run-old").await.unwrap().unwrap().status,
        RunStatus::Queued
    );
    assert_eq!(
        h.store.get_run("run-mid").await.unwrap().unwrap().status,
        RunStatus::Queued
    );
    assert_eq!(
        h.store.get_run("run-new").await.unwrap().unwrap().status,
        RunStatus::NeedsRetry
    );
    assert_eq!(h.queue.depth(&h.cluster_url).await, 2);
}

#[tokio::test]
async fn test_requeued_run_flows_back_through_submit() {
    let h = harness().await;
    h.store
        .create_definition(&common::test_definition())
        .await
        .unwrap();
    h.store
        .create_run(&test_run("run-1", RunStatus::NeedsRetry))
        .await
        .unwrap();

    worker(&h, 10).run_once().await.unwrap();

    // The submit worker picks the requeued trigger up and relaunches.
    let submit = stevedore_orchestrator::workers::SubmitWorker::new(
        h.store.clone(),
        h.queue.clone(),
        h.engine.clone(),
        h.events.clone(),
        stevedore_orchestrator::workers::SubmitWorkerConfig::default(),
    );
    submit.run_once().await.unwrap();

    let run = h.store.get_run("run-1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(h.engine.execute_calls(), 1);
}
