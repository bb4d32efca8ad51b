// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory queue for tests and embedded single-process deployments.
//!
//! Reproduces the leasing semantics of the PostgreSQL queue: received
//! messages stay invisible for the visibility window and reappear when not
//! acknowledged in time.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::run::Run;

use super::{
    MessageKind, Queue, QueueUrl, ReceiptHandle, RunReceipt, StatusReceipt, StatusUpdate,
};

#[derive(Debug, Clone)]
struct Message {
    id: i64,
    kind: MessageKind,
    payload: serde_json::Value,
    visible_at: Instant,
    enqueued_at: Instant,
}

#[derive(Default)]
struct Inner {
    queues: BTreeMap<String, Vec<Message>>,
    next_id: i64,
}

/// In-memory [`Queue`] implementation.
pub struct MemoryQueue {
    prefix: String,
    visibility_timeout: Duration,
    retention: Option<Duration>,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    /// Create a queue namespace with the given deployment prefix and
    /// visibility timeout.
    pub fn new(prefix: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            visibility_timeout,
            retention: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Drop messages older than `retention` instead of redelivering them.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Number of messages currently stored on a queue, visible or not.
    /// Test observability helper.
    pub async fn depth(&self, url: &QueueUrl) -> usize {
        let inner = self.inner.lock().await;
        inner.queues.get(&url.0).map(|q| q.len()).unwrap_or(0)
    }

    async fn receive(
        &self,
        url: &QueueUrl,
        kind: MessageKind,
    ) -> Result<Option<(i64, serde_json::Value)>> {
        let mut inner = self.inner.lock().await;
        let queue = inner
            .queues
            .get_mut(&url.0)
            .ok_or_else(|| CoreError::QueueNotFound(url.0.clone()))?;

        let now = Instant::now();
        if let Some(retention) = self.retention {
            queue.retain(|m| now.duration_since(m.enqueued_at) < retention);
        }

        let visibility = self.visibility_timeout;
        let Some(message) = queue
            .iter_mut()
            .find(|m| m.kind == kind && m.visible_at <= now)
        else {
            return Ok(None);
        };
        message.visible_at = now + visibility;
        Ok(Some((message.id, message.payload.clone())))
    }

    async fn push(&self, url: &QueueUrl, kind: MessageKind, payload: serde_json::Value) {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        let now = Instant::now();
        inner.queues.entry(url.0.clone()).or_default().push(Message {
            id,
            kind,
            payload,
            visible_at: now,
            enqueued_at: now,
        });
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn url_for(&self, name: &str, prefixed: bool) -> Result<QueueUrl> {
        let full = if prefixed {
            format!("{}-{}", self.prefix, name)
        } else {
            name.to_string()
        };
        let mut inner = self.inner.lock().await;
        inner.queues.entry(full.clone()).or_default();
        Ok(QueueUrl(full))
    }

    async fn enqueue(&self, url: &QueueUrl, run: &Run) -> Result<()> {
        self.push(url, MessageKind::Run, serde_json::to_value(run)?)
            .await;
        Ok(())
    }

    async fn receive_run(&self, url: &QueueUrl) -> Result<Option<RunReceipt>> {
        let Some((id, payload)) = self.receive(url, MessageKind::Run).await? else {
            return Ok(None);
        };
        Ok(Some(RunReceipt {
            run: serde_json::from_value(payload)?,
            handle: ReceiptHandle {
                queue: url.clone(),
                message_id: id,
                kind: MessageKind::Run,
            },
        }))
    }

    async fn enqueue_status(&self, url: &QueueUrl, update: &StatusUpdate) -> Result<()> {
        self.push(url, MessageKind::Status, serde_json::to_value(update)?)
            .await;
        Ok(())
    }

    async fn receive_status(&self, url: &QueueUrl) -> Result<Option<StatusReceipt>> {
        let Some((id, payload)) = self.receive(url, MessageKind::Status).await? else {
            return Ok(None);
        };
        Ok(Some(StatusReceipt {
            update: serde_json::from_value(payload)?,
            handle: ReceiptHandle {
                queue: url.clone(),
                message_id: id,
                kind: MessageKind::Status,
            },
        }))
    }

    async fn ack(&self, handle: &ReceiptHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(queue) = inner.queues.get_mut(&handle.queue.0) {
            queue.retain(|m| m.id != handle.message_id);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QueueUrl>> {
        let inner = self.inner.lock().await;
        Ok(inner.queues.keys().cloned().map(QueueUrl).collect())
    }
}
