// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution engine abstraction.
//!
//! An engine adapts one compute backend. Exactly one engine is active per
//! deployment, selected by name from [`new_engine`]; the set of engines is
//! statically enumerable, no reflection.
//!
//! The critical contract is [`EngineError`]'s retryable classification:
//! `Retryable` marks transient infrastructure trouble that callers must
//! leave untouched (no status mutation, no ack) so queue redelivery or the
//! retry worker can try again; `Permanent` marks failures that will not go
//! away with the current definition.

pub mod container;
pub mod mock;
pub mod process;

pub use self::container::ContainerEngine;
pub use self::mock::{ExecuteOutcome, FetchScript, MockEngine};
pub use self::process::ProcessEngine;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use stevedore_core::definition::Definition;
use stevedore_core::queue::{Queue, QueueUrl, RunMetrics, StatusUpdate};
use stevedore_core::run::Run;

/// Reserved env var carrying the run id into the job.
pub const RUN_ID_ENV: &str = "STEVEDORE_RUN_ID";

/// Reserved env var carrying the deployment token into the job. Status
/// updates echo it back so consumers can discard updates from another
/// deployment sharing the backend.
pub const DEPLOYMENT_ENV: &str = "STEVEDORE_DEPLOYMENT";

/// Errors from engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Transient infrastructure failure. Do not mutate state, do not ack;
    /// the trigger will be redelivered.
    #[error("Retryable engine failure: {0}")]
    Retryable(String),

    /// Failure that is permanent given the current definition.
    #[error("Permanent engine failure: {0}")]
    Permanent(String),

    /// The backend has no trace of the referenced run or template.
    #[error("Backend resource not found: {0}")]
    NotFound(String),

    /// The backend does not support this operation.
    #[error("Operation not supported by the {0} engine")]
    Unsupported(&'static str),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether the failure is attributable to transient infrastructure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Retryable(_))
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Backend-specific adapter that launches and monitors jobs.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name, matching its registry key.
    fn name(&self) -> &'static str;

    /// Register the definition as a backend template, returning it with
    /// `template_handle` stamped.
    async fn define(&self, definition: Definition) -> EngineResult<Definition>;

    /// Remove the backend template. Engines that cannot unregister return
    /// [`EngineError::Unsupported`], never a silent no-op.
    async fn deregister(&self, definition: &Definition) -> EngineResult<()>;

    /// Launch the run. On success the returned run carries the backend
    /// handle and an advanced status.
    async fn execute(&self, definition: &Definition, run: Run) -> EngineResult<Run>;

    /// Stop the run on the backend.
    async fn terminate(&self, run: &Run) -> EngineResult<()>;

    /// Side-channel submission for backends that execute asynchronously via
    /// their own queue. [`EngineError::Unsupported`] elsewhere.
    async fn enqueue(&self, run: &Run) -> EngineResult<()>;

    /// Poll the backend for a state delta on one run. `Ok(None)` means no
    /// change; [`EngineError::NotFound`] means the backend has no trace of
    /// the run.
    async fn fetch_status(&self, run: &Run) -> EngineResult<Option<StatusUpdate>>;

    /// Fetch resource usage for a run. [`EngineError::Unsupported`] where
    /// the backend cannot report it.
    async fn fetch_metrics(&self, run: &Run) -> EngineResult<RunMetrics>;
}

/// Settings shared by engine constructors.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Deployment token injected into every launched job.
    pub deployment: String,
    /// Status side channel the message-driven engines report into.
    pub status_queue_url: QueueUrl,
    /// OCI CLI binary used by the container engine.
    pub container_runtime: String,
}

/// Construct the engine registered under `name`.
///
/// The registry is a plain match: the set of backends is closed and
/// enumerable at compile time.
pub fn new_engine(
    name: &str,
    settings: EngineSettings,
    queue: Arc<dyn Queue>,
) -> crate::error::Result<Arc<dyn Engine>> {
    match name {
        "process" => Ok(Arc::new(ProcessEngine::new(
            queue,
            settings.status_queue_url,
            settings.deployment,
        ))),
        "container" => Ok(Arc::new(ContainerEngine::new(
            settings.container_runtime,
            settings.deployment,
        ))),
        "mock" => Ok(Arc::new(MockEngine::new())),
        other => Err(crate::error::Error::UnknownEngine(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::queue::MemoryQueue;

    fn settings() -> EngineSettings {
        EngineSettings {
            deployment: "test".to_string(),
            status_queue_url: QueueUrl("test-status".to_string()),
            container_runtime: "docker".to_string(),
        }
    }

    #[tokio::test]
    async fn test_registry_resolves_known_engines() {
        let queue = Arc::new(MemoryQueue::new("test", std::time::Duration::from_secs(30)));
        for name in ["process", "container", "mock"] {
            let engine = new_engine(name, settings(), queue.clone()).unwrap();
            assert_eq!(engine.name(), name);
        }
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_engine() {
        let queue = Arc::new(MemoryQueue::new("test", std::time::Duration::from_secs(30)));
        let err = new_engine("warp-drive", settings(), queue).err().unwrap();
        assert!(matches!(err, crate::error::Error::UnknownEngine(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::Retryable("pull timeout".into()).is_retryable());
        assert!(!EngineError::Permanent("bad image".into()).is_retryable());
        assert!(!EngineError::NotFound("gone".into()).is_retryable());
        assert!(!EngineError::Unsupported("container").is_retryable());
    }
}
