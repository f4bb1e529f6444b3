//! Persisted record of one fuzz iteration.

#![allow(missing_docs)]

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{FuzzRunId, ScenarioId};
use crate::fuzz::generator::FuzzBounds;
use crate::fuzz::invariants::Violation;
use crate::isolation::guard::{SandboxId, Scope};

/// Outcome of one generate-run-check iteration. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzRun {
    pub id: FuzzRunId,
    pub scope: Scope,
    /// Per-iteration seed; with `bounds` it regenerates the exact event list.
    pub seed: u64,
    pub event_count: usize,
    pub bounds: FuzzBounds,
    pub scenario_id: ScenarioId,
    pub passed: bool,
    /// Names of violated invariants; empty iff `passed`.
    pub violated_invariants: BTreeSet<String>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FuzzRun {
    #[must_use]
    pub fn sandbox_id(&self) -> Option<&SandboxId> {
        self.scope.sandbox_id()
    }

    /// Milliseconds between start and finish, clamped at zero.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0)
    }
}
