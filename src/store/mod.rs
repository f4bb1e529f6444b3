//! Persistence for scenarios, their snapshot timelines, and fuzz runs.
//!
//! Both backends share one contract: snapshots are append-only with
//! contiguous indices, listings are scoped, and deleting a scenario is the
//! only way its snapshots disappear.

#![allow(missing_docs)]

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::core::errors::{Result, TsimError};
use crate::core::ids::{FuzzRunId, ScenarioId};
use crate::fuzz::run::FuzzRun;
use crate::isolation::guard::Scope;
use crate::scenario::model::{RunFailure, Scenario, ScenarioState, ScenarioSummary, Snapshot};

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Storage seam used by the engine and the fuzz harness.
///
/// Implementations do no access control; callers authorize first and pass
/// the caller's scope to listing methods.
pub trait SimulationStore: Send + Sync {
    /// Insert a new scenario. Fails with `Duplicate` if the id exists.
    fn insert_scenario(&self, scenario: &Scenario) -> Result<()>;

    fn scenario(&self, id: &ScenarioId) -> Result<Option<Scenario>>;

    /// Atomically move a draft scenario to `running` and return it.
    ///
    /// This is the only cross-process run lock: `RunInProgress` if another
    /// caller holds the claim, `InvalidState` for any other non-draft state.
    fn claim_run(&self, id: &ScenarioId) -> Result<Scenario>;

    /// Overwrite lifecycle state and failure point. `NotFound` if absent.
    fn set_state(
        &self,
        id: &ScenarioId,
        state: ScenarioState,
        failure: Option<&RunFailure>,
    ) -> Result<()>;

    /// Append one snapshot. `snapshot.index` must equal the current count.
    fn append_snapshot(&self, id: &ScenarioId, snapshot: &Snapshot) -> Result<()>;

    /// Full timeline in index order.
    fn snapshots(&self, id: &ScenarioId) -> Result<Vec<Snapshot>>;

    fn snapshot_count(&self, id: &ScenarioId) -> Result<usize>;

    /// Scenarios in `scope`, oldest first.
    fn list_scenarios(&self, scope: &Scope) -> Result<Vec<ScenarioSummary>>;

    /// Remove a scenario and its snapshots. Returns whether it existed.
    /// `RunInProgress` while the scenario is claimed.
    fn delete_scenario(&self, id: &ScenarioId) -> Result<bool>;

    fn insert_fuzz_run(&self, run: &FuzzRun) -> Result<()>;

    fn fuzz_run(&self, id: &FuzzRunId) -> Result<Option<FuzzRun>>;

    /// Fuzz runs in `scope`, most recently persisted first, at most `limit`.
    fn list_fuzz_runs(&self, scope: &Scope, limit: usize) -> Result<Vec<FuzzRun>>;
}

/// Why `scenario` cannot be claimed for a run, if it cannot.
pub(crate) fn claim_error(scenario: &Scenario) -> Option<TsimError> {
    match scenario.state {
        ScenarioState::Draft => None,
        ScenarioState::Running => Some(TsimError::RunInProgress {
            scenario_id: scenario.id.to_string(),
        }),
        state => Some(TsimError::InvalidState {
            scenario_id: scenario.id.to_string(),
            state: state.to_string(),
        }),
    }
}

/// Stable string form of a scope for indexed storage columns.
#[must_use]
pub fn scope_key(scope: &Scope) -> String {
    scope.to_string()
}
