// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL lock backed by the `locks` table.
//!
//! Acquisition is a single upsert: insert wins an absent key, the
//! conditional `DO UPDATE` wins an expired or self-owned key, and
//! `rows_affected = 0` means another live owner holds it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::error::Result;

use super::DistributedLock;

/// PostgreSQL [`DistributedLock`] implementation.
pub struct PostgresLock {
    pool: PgPool,
}

impl PostgresLock {
    /// Create a lock table handle over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for PostgresLock {
    async fn try_acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| crate::error::CoreError::Other(format!("Invalid lock TTL: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO locks (lock_key, owner_token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE SET
                owner_token = $2,
                expires_at = $3
            WHERE locks.expires_at <= NOW() OR locks.owner_token = $2
            "#,
        )
        .bind(key)
        .bind(owner_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
