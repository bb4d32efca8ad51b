// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job definition model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::EnvVar;

/// A reusable job template.
///
/// Definitions are immutable once referenced by a run, except through the
/// explicit update path in the management layer. The engine stamps
/// `template_handle` when the definition is registered with a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    /// Unique identifier.
    pub definition_id: String,
    /// Container image reference.
    pub image: String,
    /// Unique secondary key for human-friendly lookup.
    pub alias: String,
    /// Owning group.
    pub group_name: String,
    /// Command executed inside the image.
    pub command: Option<String>,
    /// Default environment for runs of this definition.
    pub env: Vec<EnvVar>,
    /// Memory request (MiB).
    pub memory: Option<i64>,
    /// CPU request (millicores).
    pub cpu: Option<i64>,
    /// GPU count.
    pub gpu: Option<i64>,
    /// Exposed ports.
    pub ports: Vec<i32>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Backend template registration handle, set by `Engine::define`.
    pub template_handle: Option<String>,
}

impl Definition {
    /// Generate a fresh definition id token.
    pub fn generate_id() -> String {
        format!("def-{}", Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_definition_ids_are_unique() {
        let a = Definition::generate_id();
        let b = Definition::generate_id();
        assert!(a.starts_with("def-"));
        assert_ne!(a, b);
    }
}
