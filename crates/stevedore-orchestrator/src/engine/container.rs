// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine: runs jobs through an OCI CLI (`docker`/`podman`).
//!
//! Launches are detached (`run -d`); the container id is the backend
//! handle. This engine has no push channel, so it is reconciled by the
//! polling status worker through [`fetch_status`](ContainerEngine::fetch_status),
//! which maps `inspect` output onto run status transitions.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use stevedore_core::definition::Definition;
use stevedore_core::queue::{RunMetrics, StatusUpdate};
use stevedore_core::run::{Run, RunStatus};

use super::{DEPLOYMENT_ENV, Engine, EngineError, EngineResult, RUN_ID_ENV};

/// Engine that executes runs as containers via an OCI CLI.
pub struct ContainerEngine {
    runtime: String,
    deployment: String,
}

impl ContainerEngine {
    /// Create a container engine shelling out to `runtime`.
    pub fn new(runtime: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            deployment: deployment.into(),
        }
    }
}

/// Classify a failed launch from the CLI's stderr.
///
/// Unknown failures default to retryable: the redelivery window is bounded
/// by the queue retention, while misclassifying a daemon outage as permanent
/// would stop runs that only needed a second attempt.
fn classify_launch_failure(stderr: &str) -> EngineError {
    let lowered = stderr.to_lowercase();
    let permanent = [
        "invalid reference format",
        "repository does not exist",
        "manifest unknown",
        "executable file not found",
        "unknown flag",
    ];
    if permanent.iter().any(|needle| lowered.contains(needle)) {
        EngineError::Permanent(stderr.trim().to_string())
    } else {
        EngineError::Retryable(stderr.trim().to_string())
    }
}

/// Map one `inspect -f '{{.State.Status}};{{.State.ExitCode}};{{.State.OOMKilled}}'`
/// line onto a status update for `handle`.
fn parse_inspect_line(
    handle: &str,
    deployment: &str,
    line: &str,
) -> EngineResult<Option<(RunStatus, Option<i64>, Option<String>)>> {
    let mut parts = line.trim().split(';');
    let state = parts.next().unwrap_or_default();
    let exit_code: Option<i64> = parts.next().and_then(|c| c.parse().ok());
    let oom_killed = parts.next() == Some("true");

    let mapped = match state {
        "created" | "restarting" => Some((RunStatus::Pending, None, None)),
        "running" | "paused" => Some((RunStatus::Running, None, None)),
        "exited" => {
            let reason = if oom_killed {
                Some("Container killed by the OOM killer".to_string())
            } else {
                exit_code
                    .filter(|code| *code != 0)
                    .map(|code| format!("Container exited with code {code}"))
            };
            Some((RunStatus::Stopped, exit_code, reason))
        }
        // A dead container never produced an exit status; the abnormal-exit
        // signature believed transient.
        "dead" => Some((
            RunStatus::NeedsRetry,
            None,
            Some("Container runtime reports the container dead".to_string()),
        )),
        "" => None,
        other => {
            return Err(EngineError::Other(format!(
                "Unrecognized container state '{other}' for {handle} ({deployment})"
            )));
        }
    };
    Ok(mapped)
}

#[async_trait]
impl Engine for ContainerEngine {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn define(&self, mut definition: Definition) -> EngineResult<Definition> {
        if definition.image.is_empty() {
            return Err(EngineError::Permanent(format!(
                "Definition '{}' has no image",
                definition.alias
            )));
        }
        definition.template_handle = Some(definition.image.clone());
        Ok(definition)
    }

    async fn deregister(&self, _definition: &Definition) -> EngineResult<()> {
        // The CLI has no template store to unregister from.
        Err(EngineError::Unsupported("container"))
    }

    async fn execute(&self, definition: &Definition, mut run: Run) -> EngineResult<Run> {
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            format!("stevedore-{}", run.run_id),
        ];
        for var in definition.env.iter().chain(run.env.iter()) {
            args.push("-e".to_string());
            args.push(format!("{}={}", var.name, var.value));
        }
        args.push("-e".to_string());
        args.push(format!("{}={}", RUN_ID_ENV, run.run_id));
        args.push("-e".to_string());
        args.push(format!("{}={}", DEPLOYMENT_ENV, self.deployment));
        if let Some(memory) = run.memory.or(definition.memory) {
            args.push("--memory".to_string());
            args.push(format!("{memory}m"));
        }
        if let Some(cpu) = run.cpu.or(definition.cpu) {
            args.push("--cpus".to_string());
            args.push(format!("{:.3}", cpu as f64 / 1000.0));
        }
        args.push(definition.image.clone());
        if let Some(command) = run.command.as_ref().or(definition.command.as_ref()) {
            args.push("/bin/sh".to_string());
            args.push("-c".to_string());
            args.push(command.clone());
        }

        let output = Command::new(&self.runtime)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                EngineError::Retryable(format!("Failed to invoke {}: {e}", self.runtime))
            })?;

        if !output.status.success() {
            return Err(classify_launch_failure(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        let handle = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if handle.is_empty() {
            return Err(EngineError::Retryable(format!(
                "{} returned no container id",
                self.runtime
            )));
        }

        debug!(run_id = %run.run_id, backend_handle = %handle, "Container launched");

        run.status = RunStatus::Pending;
        run.backend_handle = Some(handle);
        Ok(run)
    }

    async fn terminate(&self, run: &Run) -> EngineResult<()> {
        let handle = run
            .backend_handle
            .as_deref()
            .ok_or_else(|| EngineError::NotFound(run.run_id.clone()))?;
        let output = Command::new(&self.runtime)
            .args(["rm", "-f", handle])
            .output()
            .await
            .map_err(|e| {
                EngineError::Retryable(format!("Failed to invoke {}: {e}", self.runtime))
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("no such container") {
            Err(EngineError::NotFound(handle.to_string()))
        } else {
            Err(EngineError::Retryable(stderr.trim().to_string()))
        }
    }

    async fn enqueue(&self, _run: &Run) -> EngineResult<()> {
        Err(EngineError::Unsupported("container"))
    }

    async fn fetch_status(&self, run: &Run) -> EngineResult<Option<StatusUpdate>> {
        let handle = run
            .backend_handle
            .as_deref()
            .ok_or_else(|| EngineError::NotFound(run.run_id.clone()))?;
        let output = Command::new(&self.runtime)
            .args([
                "inspect",
                "-f",
                "{{.State.Status}};{{.State.ExitCode}};{{.State.OOMKilled}}",
                handle,
            ])
            .output()
            .await
            .map_err(|e| {
                EngineError::Retryable(format!("Failed to invoke {}: {e}", self.runtime))
            })?;

        if !output.status.success() {
            return Err(EngineError::NotFound(handle.to_string()));
        }

        let line = String::from_utf8_lossy(&output.stdout);
        let Some((status, exit_code, exit_reason)) =
            parse_inspect_line(handle, &self.deployment, &line)?
        else {
            return Ok(None);
        };
        Ok(Some(StatusUpdate {
            backend_handle: handle.to_string(),
            status,
            exit_code,
            exit_reason,
            correlation: Some(self.deployment.clone()),
            metrics: None,
        }))
    }

    async fn fetch_metrics(&self, _run: &Run) -> EngineResult<RunMetrics> {
        Err(EngineError::Unsupported("container"))
    }
}
