//! In-process store guarded by a single `RwLock`.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::core::errors::{Result, TsimError};
use crate::core::ids::{FuzzRunId, ScenarioId};
use crate::fuzz::run::FuzzRun;
use crate::isolation::guard::Scope;
use crate::scenario::model::{RunFailure, Scenario, ScenarioState, ScenarioSummary, Snapshot};
use crate::store::{SimulationStore, claim_error};

#[derive(Debug)]
struct Entry {
    seq: u64,
    scenario: Scenario,
    snapshots: Vec<Snapshot>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    scenarios: HashMap<ScenarioId, Entry>,
    /// Insertion order; newest last.
    fuzz_runs: Vec<FuzzRun>,
}

/// Volatile [`SimulationStore`]; the default for tests and one-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: &ScenarioId) -> TsimError {
    TsimError::NotFound {
        kind: "scenario",
        id: id.to_string(),
    }
}

impl SimulationStore for MemoryStore {
    fn insert_scenario(&self, scenario: &Scenario) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.scenarios.contains_key(&scenario.id) {
            return Err(TsimError::Duplicate {
                kind: "scenario",
                id: scenario.id.to_string(),
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.scenarios.insert(
            scenario.id.clone(),
            Entry {
                seq,
                scenario: scenario.clone(),
                snapshots: Vec::new(),
            },
        );
        Ok(())
    }

    fn scenario(&self, id: &ScenarioId) -> Result<Option<Scenario>> {
        Ok(self
            .inner
            .read()
            .scenarios
            .get(id)
            .map(|entry| entry.scenario.clone()))
    }

    fn claim_run(&self, id: &ScenarioId) -> Result<Scenario> {
        let mut inner = self.inner.write();
        let entry = inner.scenarios.get_mut(id).ok_or_else(|| not_found(id))?;
        if let Some(err) = claim_error(&entry.scenario) {
            return Err(err);
        }
        entry.scenario.state = ScenarioState::Running;
        entry.scenario.failure = None;
        Ok(entry.scenario.clone())
    }

    fn set_state(
        &self,
        id: &ScenarioId,
        state: ScenarioState,
        failure: Option<&RunFailure>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.scenarios.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.scenario.state = state;
        entry.scenario.failure = failure.cloned();
        Ok(())
    }

    fn append_snapshot(&self, id: &ScenarioId, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.scenarios.get_mut(id).ok_or_else(|| not_found(id))?;
        let expected = entry.snapshots.len();
        if snapshot.index != expected {
            return Err(TsimError::AppendOutOfOrder {
                scenario_id: id.to_string(),
                expected,
                got: snapshot.index,
            });
        }
        entry.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn snapshots(&self, id: &ScenarioId) -> Result<Vec<Snapshot>> {
        Ok(self
            .inner
            .read()
            .scenarios
            .get(id)
            .map(|entry| entry.snapshots.clone())
            .unwrap_or_default())
    }

    fn snapshot_count(&self, id: &ScenarioId) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .scenarios
            .get(id)
            .map_or(0, |entry| entry.snapshots.len()))
    }

    fn list_scenarios(&self, scope: &Scope) -> Result<Vec<ScenarioSummary>> {
        let inner = self.inner.read();
        let mut rows: Vec<(u64, ScenarioSummary)> = inner
            .scenarios
            .values()
            .filter(|entry| entry.scenario.scope == *scope)
            .map(|entry| (entry.seq, entry.scenario.summary()))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, summary)| summary).collect())
    }

    fn delete_scenario(&self, id: &ScenarioId) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.scenarios.get(id) {
            None => Ok(false),
            Some(entry) if entry.scenario.state == ScenarioState::Running => {
                Err(TsimError::RunInProgress {
                    scenario_id: id.to_string(),
                })
            }
            Some(_) => Ok(inner.scenarios.remove(id).is_some()),
        }
    }

    fn insert_fuzz_run(&self, run: &FuzzRun) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.fuzz_runs.iter().any(|existing| existing.id == run.id) {
            return Err(TsimError::Duplicate {
                kind: "fuzz run",
                id: run.id.to_string(),
            });
        }
        inner.fuzz_runs.push(run.clone());
        Ok(())
    }

    fn fuzz_run(&self, id: &FuzzRunId) -> Result<Option<FuzzRun>> {
        Ok(self
            .inner
            .read()
            .fuzz_runs
            .iter()
            .find(|run| run.id == *id)
            .cloned())
    }

    fn list_fuzz_runs(&self, scope: &Scope, limit: usize) -> Result<Vec<FuzzRun>> {
        Ok(self
            .inner
            .read()
            .fuzz_runs
            .iter()
            .rev()
            .filter(|run| run.scope == *scope)
            .take(limit)
            .cloned()
            .collect())
    }
}
