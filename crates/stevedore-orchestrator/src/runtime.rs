// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for stevedore-orchestrator.
//!
//! [`OrchestratorRuntime`] wires the worker loops over the injected store,
//! queue, lock, and engine, so the orchestrator can run standalone (see
//! `main.rs`) or embedded in an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stevedore_orchestrator::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = OrchestratorRuntime::builder()
//!         .store(store)
//!         .queue(queue)
//!         .lock(lock)
//!         .engine(engine)
//!         .deployment("prod")
//!         .clusters(vec!["default".to_string()])
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use stevedore_core::events::{EventSink, LogEventSink};
use stevedore_core::lock::DistributedLock;
use stevedore_core::queue::Queue;
use stevedore_core::store::StateStore;

use crate::engine::Engine;
use crate::service::RunService;
use crate::validate::{
    AllowListClusterValidator, BasicImageValidator, ClusterValidator, ImageValidator,
};
use crate::workers::{
    RetryWorker, RetryWorkerConfig, StatusPollWorker, StatusPollWorkerConfig, StatusWorker,
    StatusWorkerConfig, SubmitWorker, SubmitWorkerConfig,
};

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    store: Option<Arc<dyn StateStore>>,
    queue: Option<Arc<dyn Queue>>,
    lock: Option<Arc<dyn DistributedLock>>,
    engine: Option<Arc<dyn Engine>>,
    events: Arc<dyn EventSink>,
    cluster_validator: Arc<dyn ClusterValidator>,
    image_validator: Arc<dyn ImageValidator>,
    deployment: String,
    clusters: Vec<String>,
    status_queue_name: String,
    submit_config: SubmitWorkerConfig,
    status_config: StatusWorkerConfig,
    status_poll_config: StatusPollWorkerConfig,
    retry_config: RetryWorkerConfig,
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            queue: None,
            lock: None,
            engine: None,
            events: Arc::new(LogEventSink),
            cluster_validator: Arc::new(AllowListClusterValidator::default()),
            image_validator: Arc::new(BasicImageValidator),
            deployment: "stevedore".to_string(),
            clusters: vec!["default".to_string()],
            status_queue_name: "status".to_string(),
            submit_config: SubmitWorkerConfig::default(),
            status_config: StatusWorkerConfig::default(),
            status_poll_config: StatusPollWorkerConfig::default(),
            retry_config: RetryWorkerConfig::default(),
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state store (required).
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the queue (required).
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the distributed lock (required).
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Set the execution engine (required).
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the event sink.
    ///
    /// Default: [`LogEventSink`].
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Set the cluster validator consulted at run creation.
    pub fn cluster_validator(mut self, validator: Arc<dyn ClusterValidator>) -> Self {
        self.cluster_validator = validator;
        self
    }

    /// Set the image validator consulted at run creation.
    pub fn image_validator(mut self, validator: Arc<dyn ImageValidator>) -> Self {
        self.image_validator = validator;
        self
    }

    /// Set the deployment token (queue namespace and status correlation).
    ///
    /// Default: `stevedore`
    pub fn deployment(mut self, deployment: impl Into<String>) -> Self {
        let deployment = deployment.into();
        self.status_config.deployment = deployment.clone();
        self.deployment = deployment;
        self
    }

    /// Set the clusters whose submission queues are created at startup.
    ///
    /// Default: `["default"]`
    pub fn clusters(mut self, clusters: Vec<String>) -> Self {
        self.clusters = clusters;
        self
    }

    /// Set the status side channel queue name.
    ///
    /// Default: `status`
    pub fn status_queue_name(mut self, name: impl Into<String>) -> Self {
        self.status_queue_name = name.into();
        self
    }

    /// Set the submit worker configuration.
    pub fn submit_config(mut self, config: SubmitWorkerConfig) -> Self {
        self.submit_config = config;
        self
    }

    /// Set the message-driven status worker configuration. Its deployment
    /// field is overwritten by [`deployment`](Self::deployment).
    pub fn status_config(mut self, config: StatusWorkerConfig) -> Self {
        self.status_config = StatusWorkerConfig {
            deployment: self.deployment.clone(),
            ..config
        };
        self
    }

    /// Set the polling status worker configuration.
    pub fn status_poll_config(mut self, config: StatusPollWorkerConfig) -> Self {
        self.status_poll_config = config;
        self
    }

    /// Set the retry worker configuration.
    pub fn retry_config(mut self, config: RetryWorkerConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required collaborators are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        let lock = self
            .lock
            .ok_or_else(|| anyhow::anyhow!("lock is required"))?;
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine is required"))?;

        Ok(OrchestratorRuntimeConfig {
            store,
            queue,
            lock,
            engine,
            events: self.events,
            cluster_validator: self.cluster_validator,
            image_validator: self.image_validator,
            deployment: self.deployment,
            clusters: self.clusters,
            status_queue_name: self.status_queue_name,
            submit_config: self.submit_config,
            status_config: self.status_config,
            status_poll_config: self.status_poll_config,
            retry_config: self.retry_config,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    lock: Arc<dyn DistributedLock>,
    engine: Arc<dyn Engine>,
    events: Arc<dyn EventSink>,
    cluster_validator: Arc<dyn ClusterValidator>,
    image_validator: Arc<dyn ImageValidator>,
    deployment: String,
    clusters: Vec<String>,
    status_queue_name: String,
    submit_config: SubmitWorkerConfig,
    status_config: StatusWorkerConfig,
    status_poll_config: StatusPollWorkerConfig,
    retry_config: RetryWorkerConfig,
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime, creating the queues and spawning the worker tasks.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        // Get-or-create every queue this deployment uses.
        for cluster in &self.clusters {
            self.queue.url_for(cluster, true).await?;
        }
        let status_url = self.queue.url_for(&self.status_queue_name, true).await?;

        let service = Arc::new(RunService::new(
            self.store.clone(),
            self.queue.clone(),
            self.engine.clone(),
            self.events.clone(),
            self.cluster_validator,
            self.image_validator,
        ));

        let submit_worker = SubmitWorker::new(
            self.store.clone(),
            self.queue.clone(),
            self.engine.clone(),
            self.events.clone(),
            self.submit_config,
        );
        let submit_shutdown = submit_worker.shutdown_handle();
        let submit_handle = tokio::spawn(async move {
            submit_worker.run().await;
        });

        let status_worker = StatusWorker::new(
            self.store.clone(),
            self.queue.clone(),
            self.events.clone(),
            status_url,
            self.status_config,
        );
        let status_shutdown = status_worker.shutdown_handle();
        let status_handle = tokio::spawn(async move {
            status_worker.run().await;
        });

        let status_poll_worker = StatusPollWorker::new(
            self.store.clone(),
            self.engine.clone(),
            self.lock.clone(),
            self.events.clone(),
            self.status_poll_config,
        );
        let status_poll_shutdown = status_poll_worker.shutdown_handle();
        let status_poll_handle = tokio::spawn(async move {
            status_poll_worker.run().await;
        });

        let retry_worker = RetryWorker::new(
            self.store.clone(),
            self.queue.clone(),
            self.events.clone(),
            self.retry_config,
        );
        let retry_shutdown = retry_worker.shutdown_handle();
        let retry_handle = tokio::spawn(async move {
            retry_worker.run().await;
        });

        info!(
            deployment = %self.deployment,
            engine = self.engine.name(),
            clusters = ?self.clusters,
            "OrchestratorRuntime started"
        );

        Ok(OrchestratorRuntime {
            service,
            submit_handle,
            status_handle,
            status_poll_handle,
            retry_handle,
            submit_shutdown,
            status_shutdown,
            status_poll_shutdown,
            retry_shutdown,
        })
    }
}

/// A running orchestrator that can be embedded in an application.
///
/// The runtime manages the four worker loops:
/// - Submit worker draining the cluster queues
/// - Message-driven status worker consuming the status side channel
/// - Polling status worker reconciling through the engine under the lock
/// - Retry worker requeueing `NEEDS_RETRY` runs
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    service: Arc<RunService>,
    submit_handle: JoinHandle<()>,
    status_handle: JoinHandle<()>,
    status_poll_handle: JoinHandle<()>,
    retry_handle: JoinHandle<()>,
    submit_shutdown: Arc<Notify>,
    status_shutdown: Arc<Notify>,
    status_poll_shutdown: Arc<Notify>,
    retry_shutdown: Arc<Notify>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// The upward-facing run service wired over the same collaborators.
    pub fn service(&self) -> Arc<RunService> {
        self.service.clone()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every worker to stop and waits for them to finish their
    /// current iteration. Stopping one worker never affects the others.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        self.submit_shutdown.notify_one();
        self.status_shutdown.notify_one();
        self.status_poll_shutdown.notify_one();
        self.retry_shutdown.notify_one();

        for (name, handle) in [
            ("submit", self.submit_handle),
            ("status", self.status_handle),
            ("status_poll", self.status_poll_handle),
            ("retry", self.retry_handle),
        ] {
            if let Err(e) = handle.await {
                error!(worker = name, "Worker task panicked: {e}");
            }
        }

        info!("OrchestratorRuntime shutdown complete");
        Ok(())
    }

    /// Check if all worker loops are still running.
    pub fn is_running(&self) -> bool {
        !self.submit_handle.is_finished()
            && !self.status_handle.is_finished()
            && !self.status_poll_handle.is_finished()
            && !self.retry_handle.is_finished()
    }
}
