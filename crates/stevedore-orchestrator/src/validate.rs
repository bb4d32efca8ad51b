// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement and image validation.
//!
//! Consulted once at run creation, never inside the worker loops. Both
//! traits are seams for deployments to plug in registry checks or
//! capacity-aware placement.

use async_trait::async_trait;

use stevedore_core::definition::Definition;

use crate::error::Result;

/// Decides whether a definition may run on a cluster.
#[async_trait]
pub trait ClusterValidator: Send + Sync {
    /// Whether `definition` can be placed on `cluster_name`.
    async fn can_be_run(&self, cluster_name: &str, definition: &Definition) -> Result<bool>;
}

/// Decides whether an image reference is acceptable.
#[async_trait]
pub trait ImageValidator: Send + Sync {
    /// Whether `image` is a valid, launchable reference.
    async fn is_image_valid(&self, image: &str) -> Result<bool>;
}

/// Cluster validator backed by a static allowlist. An empty allowlist
/// accepts every cluster.
#[derive(Debug, Default)]
pub struct AllowListClusterValidator {
    allowed: Vec<String>,
}

impl AllowListClusterValidator {
    /// Create a validator accepting only the listed clusters (or all, when
    /// the list is empty).
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }
}

#[async_trait]
impl ClusterValidator for AllowListClusterValidator {
    async fn can_be_run(&self, cluster_name: &str, _definition: &Definition) -> Result<bool> {
        Ok(self.allowed.is_empty() || self.allowed.iter().any(|c| c == cluster_name))
    }
}

/// Image validator that accepts any syntactically plausible reference.
#[derive(Debug, Default)]
pub struct BasicImageValidator;

#[async_trait]
impl ImageValidator for BasicImageValidator {
    async fn is_image_valid(&self, image: &str) -> Result<bool> {
        Ok(!image.is_empty() && !image.chars().any(char::is_whitespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> Definition {
        Definition {
            definition_id: "def-1".to_string(),
            image: "example/sleeper:1".to_string(),
            alias: "sleeper".to_string(),
            group_name: "batch".to_string(),
            command: None,
            env: vec![],
            memory: None,
            cpu: None,
            gpu: None,
            ports: vec![],
            tags: vec![],
            template_handle: None,
        }
    }

    #[tokio::test]
    async fn test_empty_allowlist_accepts_everything() {
        let validator = AllowListClusterValidator::default();
        assert!(validator.can_be_run("anything", &definition()).await.unwrap());
    }

    #[tokio::test]
    async fn test_allowlist_restricts_clusters() {
        let validator = AllowListClusterValidator::new(vec!["prod".to_string()]);
        assert!(validator.can_be_run("prod", &definition()).await.unwrap());
        assert!(!validator.can_be_run("dev", &definition()).await.unwrap());
    }

    #[tokio::test]
    async fn test_basic_image_validator() {
        let validator = BasicImageValidator;
        assert!(validator.is_image_valid("example/sleeper:1").await.unwrap());
        assert!(!validator.is_image_valid("").await.unwrap());
        assert!(!validator.is_image_valid("bad image ref").await.unwrap());
    }
}
