// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed queue.
//!
//! Messages live in the `queue_messages` table. Receiving a message claims
//! it with `FOR UPDATE SKIP LOCKED` and pushes its `visible_at` past the
//! visibility window, so concurrent consumers never lease the same message
//! twice within the window; an unacknowledged message reappears once the
//! window elapses. Acknowledgement deletes the row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::types::Json;

use crate::error::Result;
use crate::run::Run;

use super::{
    MessageKind, Queue, QueueUrl, ReceiptHandle, RunReceipt, StatusReceipt, StatusUpdate,
};

/// PostgreSQL [`Queue`] implementation.
pub struct PostgresQueue {
    pool: PgPool,
    prefix: String,
    visibility_timeout: Duration,
    retention: Option<Duration>,
}

impl PostgresQueue {
    /// Create a queue namespace over the given pool.
    pub fn new(pool: PgPool, prefix: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            visibility_timeout,
            retention: None,
        }
    }

    /// Drop messages older than `retention` instead of redelivering them.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    async fn prune_expired(&self, url: &QueueUrl) -> Result<()> {
        let Some(retention) = self.retention else {
            return Ok(());
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| crate::error::CoreError::Other(format!("Invalid retention: {e}")))?;
        sqlx::query("DELETE FROM queue_messages WHERE queue_name = $1 AND enqueued_at < $2")
            .bind(&url.0)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn receive(
        &self,
        url: &QueueUrl,
        kind: MessageKind,
    ) -> Result<Option<(i64, serde_json::Value)>> {
        self.prune_expired(url).await?;

        let visible_until = Utc::now()
            + chrono::Duration::from_std(self.visibility_timeout).map_err(|e| {
                crate::error::CoreError::Other(format!("Invalid visibility timeout: {e}"))
            })?;

        let row: Option<(i64, Json<serde_json::Value>)> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET visible_at = $3,
                receive_count = receive_count + 1
            WHERE message_id = (
                SELECT message_id FROM queue_messages
                WHERE queue_name = $1 AND kind = $2 AND visible_at <= NOW()
                ORDER BY message_id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING message_id, payload
            "#,
        )
        .bind(&url.0)
        .bind(kind.as_str())
        .bind(visible_until)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, Json(payload))| (id, payload)))
    }

    async fn push(
        &self,
        url: &QueueUrl,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages (queue_name, kind, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&url.0)
        .bind(kind.as_str())
        .bind(Json(payload))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn url_for(&self, name: &str, prefixed: bool) -> Result<QueueUrl> {
        let full = if prefixed {
            format!("{}-{}", self.prefix, name)
        } else {
            name.to_string()
        };
        sqlx::query(
            r#"
            INSERT INTO queues (queue_name)
            VALUES ($1)
            ON CONFLICT (queue_name) DO NOTHING
            "#,
        )
        .bind(&full)
        .execute(&self.pool)
        .await?;
        Ok(QueueUrl(full))
    }

    async fn enqueue(&self, url: &QueueUrl, run: &Run) -> Result<()> {
        self.push(url, MessageKind::Run, serde_json::to_value(run)?)
            .await
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
            .await
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
        sqlx::query("DELETE FROM queue_messages WHERE message_id = $1")
            .bind(handle.message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QueueUrl>> {
        let names: Vec<(String,)> =
            sqlx::query_as("SELECT queue_name FROM queues ORDER BY queue_name")
                .fetch_all(&self.pool)
                .await?;
        Ok(names.into_iter().map(|(n,)| QueueUrl(n)).collect())
    }
}
