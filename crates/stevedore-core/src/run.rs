// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run model and lifecycle state machine.
//!
//! A [`Run`] is one execution attempt of a [`Definition`](crate::definition::Definition).
//! Its status only moves forward along `Queued < Pending < Running < Stopped`;
//! the two sanctioned exceptions are the retry reset (`NeedsRetry -> Queued`,
//! performed only by the retry worker) and explicit termination (any state
//! forced to `Stopped`). Every writer goes through [`RunStatus::can_advance_to`]
//! so that duplicate or out-of-order status messages degrade to no-ops.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created and enqueued, not yet submitted to a backend.
    Queued,
    /// Accepted by the backend, not yet running.
    Pending,
    /// Executing on the backend.
    Running,
    /// Terminal. `exit_code`/`exit_reason` describe the outcome.
    Stopped,
    /// Backend exited abnormally for reasons believed transient; the retry
    /// worker resets this back to `Queued`.
    NeedsRetry,
}

impl RunStatus {
    /// Position in the forward-only chain. `NeedsRetry` sits outside the
    /// chain and is handled explicitly by [`can_advance_to`](Self::can_advance_to).
    fn ordinal(self) -> u8 {
        match self {
            RunStatus::Queued => 0,
            RunStatus::Pending => 1,
            RunStatus::Running => 2,
            RunStatus::Stopped => 3,
            // Outside the chain; callers never compare its ordinal.
            RunStatus::NeedsRetry => 0,
        }
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Stopped)
    }

    /// Forward-only transition predicate.
    ///
    /// Returns `true` iff a writer observing the run in `self` may persist
    /// `next`. The retry reset (`NeedsRetry -> Queued`) and explicit
    /// termination are intentionally *not* covered here; those two paths
    /// bypass the rule by design and are confined to the retry worker and
    /// the terminate operation respectively.
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Stopped, _) => false,
            (a, b) if a == b => false,
            // Any in-flight state may park for retry.
            (_, NeedsRetry) => true,
            // Leaving NeedsRetry is reserved for the retry reset / terminate.
            (NeedsRetry, _) => false,
            (a, b) => b.ordinal() > a.ordinal(),
        }
    }

    /// Stable string form used in the database and queue payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Stopped => "STOPPED",
            RunStatus::NeedsRetry => "NEEDS_RETRY",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(RunStatus::Queued),
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "STOPPED" => Ok(RunStatus::Stopped),
            "NEEDS_RETRY" => Ok(RunStatus::NeedsRetry),
            other => Err(crate::error::CoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// A single environment variable. Order is preserved; names are unique
/// within a run or definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl EnvVar {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Look up a variable by name in an ordered env list.
pub fn env_value<'a>(env: &'a [EnvVar], name: &str) -> Option<&'a str> {
    env.iter().find(|e| e.name == name).map(|e| e.value.as_str())
}

/// One execution attempt of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Opaque unique token, generated at creation, never reused.
    pub run_id: String,
    /// Definition this run executes.
    pub definition_id: String,
    /// Definition alias at creation time, for display and filtering.
    pub alias: String,
    /// Target cluster; also selects the submission queue.
    pub cluster_name: String,
    /// Owning group, inherited from the definition.
    pub group_name: String,
    /// Name of the execution engine that owns this run.
    pub engine: Option<String>,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// When the run was created and enqueued.
    pub queued_at: Option<DateTime<Utc>>,
    /// When the backend started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached `Stopped`.
    pub finished_at: Option<DateTime<Utc>>,
    /// Process exit code, set only on `Stopped`.
    pub exit_code: Option<i64>,
    /// Human-readable description of how the run ended.
    pub exit_reason: Option<String>,
    /// Backend correlation token (container id, task handle) used to match
    /// inbound status events to this run.
    pub backend_handle: Option<String>,
    /// Compute instance the run landed on, when the backend reports it.
    pub instance_id: Option<String>,
    /// DNS name of that instance.
    pub instance_dns_name: Option<String>,
    /// Environment passed to the job, overrides layered over the definition.
    pub env: Vec<EnvVar>,
    /// Command override; falls back to the definition's command.
    pub command: Option<String>,
    /// CPU request override (millicores).
    pub cpu: Option<i64>,
    /// Memory request override (MiB).
    pub memory: Option<i64>,
    /// GPU count override.
    pub gpu: Option<i64>,
}

impl Run {
    /// Generate a fresh run id token.
    pub fn generate_id() -> String {
        format!("run-{}", Uuid::new_v4())
    }

    /// Look up an env var on this run.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        env_value(&self.env, name)
    }
}

/// Partial update applied to a stored run.
///
/// `None` fields leave the stored value untouched. Timestamps are
/// first-writer-wins: once `started_at`/`finished_at` are set they are never
/// overwritten, which keeps them monotonically non-decreasing under
/// duplicate delivery.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    /// New status, validated by the caller against the transition rule.
    pub status: Option<RunStatus>,
    /// Stamp for the first transition past `Pending`.
    pub started_at: Option<DateTime<Utc>>,
    /// Stamp for the terminal transition.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code reported by the backend.
    pub exit_code: Option<i64>,
    /// Exit reason reported by the backend or a worker.
    pub exit_reason: Option<String>,
    /// Backend correlation token assigned at submission.
    pub backend_handle: Option<String>,
    /// Placement fact, set after a successful launch.
    pub instance_id: Option<String>,
    /// Placement fact, set after a successful launch.
    pub instance_dns_name: Option<String>,
}

impl RunPatch {
    /// Patch that only moves the status.
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that stops the run with a reason, stamping `finished_at`.
    pub fn stopped(exit_reason: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Stopped),
            finished_at: Some(Utc::now()),
            exit_reason: Some(exit_reason.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> [RunStatus; 4] {
        [
            RunStatus::Queued,
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Stopped,
        ]
    }

    #[test]
    fn test_forward_transitions_allowed() {
        let c = chain();
        for (i, from) in c.iter().enumerate() {
            for to in &c[i + 1..] {
                assert!(from.can_advance_to(*to), "{from} -> {to} should advance");
            }
        }
    }

    #[test]
    fn test_backward_and_self_transitions_rejected() {
        let c = chain();
        for (i, from) in c.iter().enumerate() {
            for to in &c[..=i] {
                assert!(!from.can_advance_to(*to), "{from} -> {to} should be rejected");
            }
        }
    }

    #[test]
    fn test_needs_retry_reachable_from_in_flight() {
        assert!(RunStatus::Queued.can_advance_to(RunStatus::NeedsRetry));
        assert!(RunStatus::Pending.can_advance_to(RunStatus::NeedsRetry));
        assert!(RunStatus::Running.can_advance_to(RunStatus::NeedsRetry));
        assert!(!RunStatus::Stopped.can_advance_to(RunStatus::NeedsRetry));
        assert!(!RunStatus::NeedsRetry.can_advance_to(RunStatus::NeedsRetry));
    }

    #[test]
    fn test_needs_retry_exits_only_explicitly() {
        // The retry reset and terminate bypass can_advance_to entirely.
        assert!(!RunStatus::NeedsRetry.can_advance_to(RunStatus::Queued));
        assert!(!RunStatus::NeedsRetry.can_advance_to(RunStatus::Running));
        assert!(!RunStatus::NeedsRetry.can_advance_to(RunStatus::Stopped));
    }

    #[test]
    fn test_replay_in_any_order_converges_to_highest() {
        // Applying a set of chain updates in any order must land on the
        // highest-ordinal status seen, regardless of delivery order.
        let updates = [RunStatus::Running, RunStatus::Pending, RunStatus::Stopped];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut status = RunStatus::Queued;
            for i in order {
                let next = updates[i];
                if status.can_advance_to(next) {
                    status = next;
                }
            }
            assert_eq!(status, RunStatus::Stopped, "order {order:?}");
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for s in [
            RunStatus::Queued,
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Stopped,
            RunStatus::NeedsRetry,
        ] {
            assert_eq!(s.as_str().parse::<RunStatus>().unwrap(), s);
        }
        assert!("BOGUS".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_env_value_lookup() {
        let env = vec![
            EnvVar::new("A", "1"),
            EnvVar::new("B", "2"),
        ];
        assert_eq!(env_value(&env, "B"), Some("2"));
        assert_eq!(env_value(&env, "C"), None);
    }

    #[test]
    fn test_generated_run_ids_are_unique() {
        let a = Run::generate_id();
        let b = Run::generate_id();
        assert!(a.starts_with("run-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_stopped_patch_stamps_finished_at() {
        let patch = RunPatch::stopped("cancelled by operator");
        assert_eq!(patch.status, Some(RunStatus::Stopped));
        assert!(patch.finished_at.is_some());
        assert_eq!(patch.exit_reason.as_deref(), Some("cancelled by operator"));
    }
}
