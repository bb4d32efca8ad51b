// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fire-and-forget event and metrics sink.
//!
//! The sink is constructed once and injected into every component that emits
//! events; there is no process-wide registry. Emission is infallible by
//! construction so a sink can never abort a worker loop.

use crate::definition::Definition;
use crate::run::{Run, RunStatus};

/// Structured event and counter emission.
pub trait EventSink: Send + Sync {
    /// A run was handed to an engine. Carries the full definition for audit.
    fn run_submitted(&self, run: &Run, definition: &Definition);

    /// A run's persisted status changed.
    fn run_status_changed(&self, run: &Run, previous: RunStatus);

    /// Increment a named counter.
    fn count(&self, name: &'static str, value: u64);
}

/// Sink that emits structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn run_submitted(&self, run: &Run, definition: &Definition) {
        tracing::info!(
            run_id = %run.run_id,
            definition_id = %definition.definition_id,
            alias = %definition.alias,
            image = %definition.image,
            group_name = %definition.group_name,
            cluster_name = %run.cluster_name,
            command = ?definition.command,
            cpu = ?definition.cpu,
            memory = ?definition.memory,
            gpu = ?definition.gpu,
            "Run submitted"
        );
    }

    fn run_status_changed(&self, run: &Run, previous: RunStatus) {
        tracing::info!(
            run_id = %run.run_id,
            previous = %previous,
            status = %run.status,
            exit_code = ?run.exit_code,
            exit_reason = ?run.exit_reason,
            "Run status changed"
        );
    }

    fn count(&self, name: &'static str, value: u64) {
        tracing::debug!(counter = name, value = value, "Counter");
    }
}

/// Sink that drops everything. Test double.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn run_submitted(&self, _run: &Run, _definition: &Definition) {}

    fn run_status_changed(&self, _run: &Run, _previous: RunStatus) {}

    fn count(&self, _name: &'static str, _value: u64) {}
}
