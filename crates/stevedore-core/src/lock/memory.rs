// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory lock for tests and embedded single-process deployments.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

use super::DistributedLock;

struct Holder {
    owner_token: String,
    expires_at: Instant,
}

/// In-memory [`DistributedLock`] implementation.
#[derive(Default)]
pub struct MemoryLock {
    locks: Mutex<HashMap<String, Holder>>,
}

impl MemoryLock {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        match locks.get(key) {
            Some(holder) if holder.expires_at > now && holder.owner_token != owner_token => {
                Ok(false)
            }
            _ => {
                locks.insert(
                    key.to_string(),
                    Holder {
                        owner_token: owner_token.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_owner_is_rejected_within_ttl() {
        let lock = MemoryLock::new();
        let ttl = Duration::from_secs(30);
        assert!(lock.try_acquire("run-1:status", "a", ttl).await.unwrap());
        assert!(!lock.try_acquire("run-1:status", "b", ttl).await.unwrap());
        // Distinct keys do not contend.
        assert!(lock.try_acquire("run-2:status", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_holder_may_reacquire() {
        let lock = MemoryLock::new();
        let ttl = Duration::from_secs(30);
        assert!(lock.try_acquire("run-1:status", "a", ttl).await.unwrap());
        assert!(lock.try_acquire("run-1:status", "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_claimable() {
        let lock = MemoryLock::new();
        assert!(
            lock.try_acquire("run-1:status", "a", Duration::from_millis(10))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            lock.try_acquire("run-1:status", "b", Duration::from_secs(30))
                .await
                .unwrap()
        );
    }
}
