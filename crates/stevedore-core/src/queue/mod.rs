// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue abstraction: durable, at-least-once delivery of run triggers and
//! status updates.
//!
//! Receives are non-blocking; `Ok(None)` is the normal no-work outcome, not
//! an error. A received message stays invisible for the configured
//! visibility window and becomes redeliverable if it is not acknowledged in
//! time — duplicate delivery is possible and consumers must process
//! idempotently.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryQueue;
pub use self::postgres::PostgresQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::run::{Run, RunStatus};

/// Opaque handle for a known queue, returned by [`Queue::url_for`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueUrl(
    /// Fully-qualified queue name.
    pub String,
);

impl std::fmt::Display for QueueUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which message channel a receipt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Run submission trigger.
    Run,
    /// Backend status update.
    Status,
}

impl MessageKind {
    /// Stable string form used in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Run => "run",
            MessageKind::Status => "status",
        }
    }
}

/// Acknowledgement capability for a leased message.
///
/// Passing the handle to [`Queue::ack`] deletes the underlying message.
/// Dropping the handle without acking leaves the message to reappear after
/// the visibility window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    /// Queue the message was received from.
    pub queue: QueueUrl,
    /// Message identity within the queue backend.
    pub message_id: i64,
    /// Channel the message belongs to.
    pub kind: MessageKind,
}

/// A leased, not-yet-acknowledged run trigger.
#[derive(Debug, Clone)]
pub struct RunReceipt {
    /// Snapshot of the run as it was enqueued. A trigger, not truth: the
    /// consumer reloads the authoritative run from the store.
    pub run: Run,
    /// Acknowledgement capability.
    pub handle: ReceiptHandle,
}

/// A leased, not-yet-acknowledged status update.
#[derive(Debug, Clone)]
pub struct StatusReceipt {
    /// The raw backend state delta.
    pub update: StatusUpdate,
    /// Acknowledgement capability.
    pub handle: ReceiptHandle,
}

/// Resource usage reported by a backend for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Peak memory usage in bytes.
    pub memory_peak_bytes: Option<u64>,
    /// Total CPU time in microseconds.
    pub cpu_usage_usec: Option<u64>,
}

/// A backend-observed state delta for one run.
///
/// Correlated back to the owning run by `backend_handle`; `correlation`
/// carries the deployment token the run was launched with so that consumers
/// can discard updates belonging to another deployment sharing the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Backend correlation token of the run this update describes.
    pub backend_handle: String,
    /// Observed status.
    pub status: RunStatus,
    /// Exit code, when the backend reports one.
    pub exit_code: Option<i64>,
    /// Human-readable reason, when the backend reports one.
    pub exit_reason: Option<String>,
    /// Deployment token the run was launched with.
    pub correlation: Option<String>,
    /// Resource usage snapshot, when available.
    #[serde(default)]
    pub metrics: Option<RunMetrics>,
}

/// Durable at-least-once message channel per target cluster.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Idempotent get-or-create of a queue.
    ///
    /// `prefixed` namespaces the queue under the active deployment so that
    /// deployments sharing a backend do not consume each other's work.
    async fn url_for(&self, name: &str, prefixed: bool) -> Result<QueueUrl>;

    /// Enqueue a run submission trigger.
    async fn enqueue(&self, url: &QueueUrl, run: &Run) -> Result<()>;

    /// Receive one run trigger, or `None` when no work is available.
    async fn receive_run(&self, url: &QueueUrl) -> Result<Option<RunReceipt>>;

    /// Enqueue a status update onto the side channel.
    async fn enqueue_status(&self, url: &QueueUrl, update: &StatusUpdate) -> Result<()>;

    /// Receive one status update, or `None` when no work is available.
    async fn receive_status(&self, url: &QueueUrl) -> Result<Option<StatusReceipt>>;

    /// Acknowledge (delete) a received message.
    async fn ack(&self, handle: &ReceiptHandle) -> Result<()>;

    /// List all known queues.
    async fn list(&self) -> Result<Vec<QueueUrl>>;
}
