// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Short-TTL distributed lock.
//!
//! Set-if-not-exists with expiry; there is no unlock. A crashed holder
//! blocks other workers for at most one TTL window. Used exclusively to
//! serialize concurrent status reconciliation per run, never for leader
//! election or long-held locks.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryLock;
pub use self::postgres::PostgresLock;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Mutual-exclusion primitive keyed by an arbitrary string.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to acquire `key` for `ttl`.
    ///
    /// Returns `true` when this owner holds the lock (including re-acquiring
    /// a key it already holds), `false` when another live owner holds it.
    /// Expired locks are claimable by any owner.
    async fn try_acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool>;
}

/// Conventional lock key for status reconciliation of one run.
pub fn status_lock_key(run_id: &str) -> String {
    format!("{run_id}:status")
}
