// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process engine: runs jobs as supervised host processes.
//!
//! The development and single-host backend. Each launch spawns the job
//! command under `/bin/sh -c`, and a monitor task reports lifecycle
//! transitions onto the status side channel, where the message-driven
//! status worker reconciles them into the store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use stevedore_core::definition::Definition;
use stevedore_core::queue::{Queue, QueueUrl, RunMetrics, StatusUpdate};
use stevedore_core::run::{Run, RunStatus};

use super::{DEPLOYMENT_ENV, Engine, EngineError, EngineResult, RUN_ID_ENV};

type ChildMap = Arc<Mutex<HashMap<String, Arc<Notify>>>>;

/// Engine that executes runs as local processes.
pub struct ProcessEngine {
    queue: Arc<dyn Queue>,
    status_url: QueueUrl,
    deployment: String,
    templates: Mutex<HashSet<String>>,
    children: ChildMap,
}

impl ProcessEngine {
    /// Create a process engine reporting onto the given status channel.
    pub fn new(queue: Arc<dyn Queue>, status_url: QueueUrl, deployment: String) -> Self {
        Self {
            queue,
            status_url,
            deployment,
            templates: Mutex::new(HashSet::new()),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn update(&self, handle: &str, status: RunStatus) -> StatusUpdate {
        StatusUpdate {
            backend_handle: handle.to_string(),
            status,
            exit_code: None,
            exit_reason: None,
            correlation: Some(self.deployment.clone()),
            metrics: None,
        }
    }
}

async fn push_update(queue: &Arc<dyn Queue>, url: &QueueUrl, update: StatusUpdate) {
    if let Err(e) = queue.enqueue_status(url, &update).await {
        warn!(
            backend_handle = %update.backend_handle,
            error = %e,
            "Failed to enqueue status update"
        );
    }
}

/// Supervise one child until it exits or is terminated, reporting the
/// terminal transition onto the status channel.
async fn monitor_child(
    children: ChildMap,
    queue: Arc<dyn Queue>,
    status_url: QueueUrl,
    deployment: String,
    handle: String,
    mut child: tokio::process::Child,
    terminate: Arc<Notify>,
) {
    let base = |status: RunStatus| StatusUpdate {
        backend_handle: handle.clone(),
        status,
        exit_code: None,
        exit_reason: None,
        correlation: Some(deployment.clone()),
        metrics: None,
    };

    // The shell is alive; report the pending -> running edge.
    push_update(&queue, &status_url, base(RunStatus::Running)).await;

    let update = tokio::select! {
        biased;

        _ = terminate.notified() => {
            if let Err(e) = child.start_kill() {
                warn!(backend_handle = %handle, error = %e, "Failed to kill child process");
            }
            let _ = child.wait().await;
            StatusUpdate {
                exit_reason: Some("Terminated".to_string()),
                ..base(RunStatus::Stopped)
            }
        }

        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(code) => StatusUpdate {
                    exit_code: Some(code as i64),
                    exit_reason: (code != 0).then(|| format!("Process exited with code {code}")),
                    ..base(RunStatus::Stopped)
                },
                // Killed by a signal, no exit code: the abnormal-exit
                // signature believed transient. Park for retry.
                None => StatusUpdate {
                    exit_reason: Some("Process killed by signal".to_string()),
                    ..base(RunStatus::NeedsRetry)
                },
            },
            Err(e) => StatusUpdate {
                exit_reason: Some(format!("Failed to reap process: {e}")),
                ..base(RunStatus::NeedsRetry)
            },
        },
    };

    push_update(&queue, &status_url, update).await;
    children.lock().await.remove(&handle);
    debug!(backend_handle = %handle, "Process monitor finished");
}

#[async_trait]
impl Engine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn define(&self, mut definition: Definition) -> EngineResult<Definition> {
        let handle = format!("process-{}", definition.alias);
        self.templates.lock().await.insert(handle.clone());
        definition.template_handle = Some(handle);
        Ok(definition)
    }

    async fn deregister(&self, definition: &Definition) -> EngineResult<()> {
        let handle = definition
            .template_handle
            .clone()
            .unwrap_or_else(|| format!("process-{}", definition.alias));
        if self.templates.lock().await.remove(&handle) {
            Ok(())
        } else {
            Err(EngineError::NotFound(handle))
        }
    }

    async fn execute(&self, definition: &Definition, mut run: Run) -> EngineResult<Run> {
        let command = run
            .command
            .clone()
            .or_else(|| definition.command.clone())
            .ok_or_else(|| {
                EngineError::Permanent(format!(
                    "Definition '{}' has no command to execute",
                    definition.alias
                ))
            })?;

        let handle = format!("proc-{}", Uuid::new_v4());

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&command);
        for var in definition.env.iter().chain(run.env.iter()) {
            cmd.env(&var.name, &var.value);
        }
        cmd.env(RUN_ID_ENV, &run.run_id);
        cmd.env(DEPLOYMENT_ENV, &self.deployment);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| EngineError::Retryable(format!("Failed to spawn process: {e}")))?;

        let terminate = Arc::new(Notify::new());
        self.children
            .lock()
            .await
            .insert(handle.clone(), terminate.clone());

        tokio::spawn(monitor_child(
            self.children.clone(),
            self.queue.clone(),
            self.status_url.clone(),
            self.deployment.clone(),
            handle.clone(),
            child,
            terminate,
        ));

        run.status = RunStatus::Pending;
        run.backend_handle = Some(handle);
        run.instance_id = std::env::var("HOSTNAME").ok();
        Ok(run)
    }

    async fn terminate(&self, run: &Run) -> EngineResult<()> {
        let handle = run
            .backend_handle
            .as_deref()
            .ok_or_else(|| EngineError::NotFound(run.run_id.clone()))?;
        let children = self.children.lock().await;
        match children.get(handle) {
            Some(terminate) => {
                terminate.notify_one();
                Ok(())
            }
            None => Err(EngineError::NotFound(handle.to_string())),
        }
    }

    async fn enqueue(&self, _run: &Run) -> EngineResult<()> {
        Err(EngineError::Unsupported("process"))
    }

    async fn fetch_status(&self, run: &Run) -> EngineResult<Option<StatusUpdate>> {
        let handle = run
            .backend_handle
            .as_deref()
            .ok_or_else(|| EngineError::NotFound(run.run_id.clone()))?;
        if self.children.lock().await.contains_key(handle) {
            // Still supervised; terminal transitions arrive on the status
            // channel, there is no delta to report here.
            Ok(None)
        } else {
            Err(EngineError::NotFound(handle.to_string()))
        }
    }

    async fn fetch_metrics(&self, _run: &Run) -> EngineResult<RunMetrics> {
        Err(EngineError::Unsupported("process"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stevedore_core::queue::MemoryQueue;

    fn test_definition(command: Option<&str>) -> Definition {
        Definition {
            definition_id: "def-1".to_string(),
            image: "example/sleeper:1".to_string(),
            alias: "sleeper".to_string(),
            group_name: "batch".to_string(),
            command: command.map(str::to_string),
            env: vec![],
            memory: None,
            cpu: None,
            gpu: None,
            ports: vec![],
            tags: vec![],
            template_handle: None,
        }
    }

    fn test_run() -> Run {
        Run {
            run_id: Run::generate_id(),
            definition_id: "def-1".to_string(),
            alias: "sleeper".to_string(),
            cluster_name: "default".to_string(),
            group_name: "batch".to_string(),
            engine: Some("process".to_string()),
            status: RunStatus::Queued,
            queued_at: Some(chrono::Utc::now()),
            started_at: None,
            finished_at: None,
            exit_code: None,
            exit_reason: None,
            backend_handle: None,
            instance_id: None,
            instance_dns_name: None,
            env: vec![],
            command: None,
            cpu: None,
            memory: None,
            gpu: None,
        }
    }

    async fn engine_with_queue() -> (ProcessEngine, Arc<MemoryQueue>, QueueUrl) {
        let queue = Arc::new(MemoryQueue::new("test", Duration::from_secs(30)));
        let url = queue.url_for("status", true).await.unwrap();
        let engine = ProcessEngine::new(queue.clone(), url.clone(), "test".to_string());
        (engine, queue, url)
    }

    async fn next_update(queue: &MemoryQueue, url: &QueueUrl) -> StatusUpdate {
        for _ in 0..100 {
            if let Some(receipt) = queue.receive_status(url).await.unwrap() {
                queue.ack(&receipt.handle).await.unwrap();
                return receipt.update;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no status update arrived");
    }

    #[tokio::test]
    async fn test_define_and_deregister() {
        let (engine, _queue, _url) = engine_with_queue().await;
        let defined = engine.define(test_definition(Some("true"))).await.unwrap();
        assert_eq!(defined.template_handle.as_deref(), Some("process-sleeper"));

        engine.deregister(&defined).await.unwrap();
        let err = engine.deregister(&defined).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_without_command_is_permanent() {
        let (engine, _queue, _url) = engine_with_queue().await;
        let err = engine
            .execute(&test_definition(None), test_run())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Permanent(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_execute_reports_running_then_stopped() {
        let (engine, queue, url) = engine_with_queue().await;
        let launched = engine
            .execute(&test_definition(Some("exit 0")), test_run())
            .await
            .unwrap();
        assert_eq!(launched.status, RunStatus::Pending);
        let handle = launched.backend_handle.clone().unwrap();

        let running = next_update(&queue, &url).await;
        assert_eq!(running.backend_handle, handle);
        assert_eq!(running.status, RunStatus::Running);
        assert_eq!(running.correlation.as_deref(), Some("test"));

        let stopped = next_update(&queue, &url).await;
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert_eq!(stopped.exit_code, Some(0));
        assert!(stopped.exit_reason.is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_reason() {
        let (engine, queue, url) = engine_with_queue().await;
        engine
            .execute(&test_definition(Some("exit 3")), test_run())
            .await
            .unwrap();

        let running = next_update(&queue, &url).await;
        assert_eq!(running.status, RunStatus::Running);
        let stopped = next_update(&queue, &url).await;
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert_eq!(stopped.exit_code, Some(3));
        assert!(stopped.exit_reason.as_deref().unwrap().contains("code 3"));
    }

    #[tokio::test]
    async fn test_terminate_stops_the_child() {
        let (engine, queue, url) = engine_with_queue().await;
        let launched = engine
            .execute(&test_definition(Some("sleep 30")), test_run())
            .await
            .unwrap();

        let running = next_update(&queue, &url).await;
        assert_eq!(running.status, RunStatus::Running);

        engine.terminate(&launched).await.unwrap();
        let stopped = next_update(&queue, &url).await;
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert_eq!(stopped.exit_reason.as_deref(), Some("Terminated"));
    }

    #[tokio::test]
    async fn test_fetch_status_of_unknown_handle_is_not_found() {
        let (engine, _queue, _url) = engine_with_queue().await;
        let mut run = test_run();
        run.backend_handle = Some("proc-gone".to_string());
        let err = engine.fetch_status(&run).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_enqueue_and_metrics_are_unsupported() {
        let (engine, _queue, _url) = engine_with_queue().await;
        assert!(matches!(
            engine.enqueue(&test_run()).await.unwrap_err(),
            EngineError::Unsupported("process")
        ));
        assert!(matches!(
            engine.fetch_metrics(&test_run()).await.unwrap_err(),
            EngineError::Unsupported("process")
        ));
    }
}
