// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stevedore-core.

use thiserror::Error;

/// Core substrate errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Definition was not found.
    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),

    /// Queue was not found.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Stored status string is not a known run status.
    #[error("Invalid run status: {0}")]
    InvalidStatus(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;
