// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stevedore-orchestrator.

use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core substrate operation failed.
    #[error("Core error: {0}")]
    Core(#[from] stevedore_core::CoreError),

    /// Engine operation failed.
    #[error("Engine error: {0}")]
    Engine(#[from] crate::engine::EngineError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Run was not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Definition was not found.
    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),

    /// Image validation rejected the definition's image.
    #[error("Image rejected: {0}")]
    ImageRejected(String),

    /// Cluster validation rejected the placement.
    #[error("Definition '{definition}' cannot run on cluster '{cluster}'")]
    ClusterRejected {
        /// Target cluster.
        cluster: String,
        /// Definition that was rejected.
        definition: String,
    },

    /// No engine is registered under the configured name.
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using orchestrator [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
