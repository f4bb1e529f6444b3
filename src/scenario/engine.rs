//! Scenario engine: validation, lifecycle, guarded access, audited mutation.
//!
//! Every public operation authorizes through the isolation guard before it
//! reads or mutates anything. Event application itself lives in
//! [`Replay`]; `run` persists what the replay yields.

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::audit::{AuditAction, AuditEntry, AuditHandle};
use crate::core::config::EngineConfig;
use crate::core::errors::{Result, TsimError};
use crate::core::ids::{IdGenerator, ScenarioId};
use crate::isolation::context::EnvironmentContext;
use crate::isolation::guard::{Operation, OperationKind, enforce};
use crate::scenario::delta;
use crate::scenario::event::{ApplyError, Event, ExtensionRegistry};
use crate::scenario::model::{
    Divergence, ReplayVerification, RunFailure, RunReport, Scenario, ScenarioMeta, ScenarioState,
    ScenarioSummary, Snapshot, timeline_digest,
};
use crate::scenario::replay::Replay;
use crate::signal::calculator::TrustCalculator;
use crate::store::SimulationStore;

/// Applies events, owns scenario lifecycle, and records audit entries.
pub struct ScenarioEngine {
    store: Arc<dyn SimulationStore>,
    calculator: TrustCalculator,
    config: EngineConfig,
    audit: AuditHandle,
    extensions: ExtensionRegistry,
    ids: IdGenerator,
}

impl ScenarioEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn SimulationStore>,
        calculator: TrustCalculator,
        config: EngineConfig,
        audit: AuditHandle,
    ) -> Self {
        Self {
            store,
            calculator,
            config,
            audit,
            extensions: ExtensionRegistry::new(),
            ids: IdGenerator::new(),
        }
    }

    #[must_use]
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    #[must_use]
    pub const fn calculator(&self) -> &TrustCalculator {
        &self.calculator
    }

    #[must_use]
    pub const fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SimulationStore> {
        &self.store
    }

    #[must_use]
    pub const fn audit(&self) -> &AuditHandle {
        &self.audit
    }

    // ──────────────────── creation ────────────────────

    /// Validate and store a new draft scenario in the caller's scope.
    pub fn create_scenario(
        &self,
        ctx: &EnvironmentContext,
        meta: ScenarioMeta,
        events: Vec<Event>,
    ) -> Result<Scenario> {
        self.create(ctx, meta, events, "direct")
    }

    /// Normalize a legacy delta blob and create a scenario from it.
    pub fn load_from_delta(
        &self,
        ctx: &EnvironmentContext,
        raw: &serde_json::Value,
    ) -> Result<Scenario> {
        enforce(ctx, Operation::new(OperationKind::CreateScenario))?;
        let normalized = delta::normalize(raw, Utc::now())?;
        self.create(ctx, normalized.meta, normalized.events, "delta")
    }

    fn create(
        &self,
        ctx: &EnvironmentContext,
        meta: ScenarioMeta,
        events: Vec<Event>,
        ingest: &str,
    ) -> Result<Scenario> {
        enforce(ctx, Operation::new(OperationKind::CreateScenario))?;
        self.validate(&meta, &events)?;

        let scenario = Scenario {
            id: self.ids.scenario_id(),
            scope: ctx.scope(),
            meta,
            created_at: Utc::now(),
            events,
            state: ScenarioState::Draft,
            failure: None,
        };
        self.store.insert_scenario(&scenario)?;

        self.audit.record(AuditEntry::new(
            ctx,
            AuditAction::ScenarioCreated,
            scenario.id.as_str(),
            json!({
                "name": scenario.meta.name,
                "origin": scenario.meta.origin.as_str(),
                "event_count": scenario.events.len(),
                "ingest": ingest,
            }),
        ));
        Ok(scenario)
    }

    fn validate(&self, meta: &ScenarioMeta, events: &[Event]) -> Result<()> {
        if meta.name.trim().is_empty() {
            return Err(TsimError::validation("name", "must not be empty"));
        }
        if meta.tags.len() > self.config.max_tags {
            return Err(TsimError::validation(
                "tags",
                format!("at most {} tags allowed, got {}", self.config.max_tags, meta.tags.len()),
            ));
        }
        if meta.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(TsimError::validation("tags", "tags must not be empty"));
        }
        if events.is_empty() && !(meta.allow_empty || self.config.allow_empty_scenarios) {
            return Err(TsimError::validation(
                "events",
                "scenario has no events (set allow_empty to accept)",
            ));
        }
        if events.len() > self.config.max_events_per_scenario {
            return Err(TsimError::validation(
                "events",
                format!(
                    "{} events exceed the limit of {}",
                    events.len(),
                    self.config.max_events_per_scenario
                ),
            ));
        }
        for (i, event) in events.iter().enumerate() {
            event.validate(i)?;
        }
        for (i, pair) in events.windows(2).enumerate() {
            if pair[1].at() < pair[0].at() {
                return Err(TsimError::validation(
                    format!("events[{}].at", i + 1),
                    format!(
                        "instant {} precedes the previous event's {}",
                        pair[1].at(),
                        pair[0].at()
                    ),
                ));
            }
        }
        Ok(())
    }

    // ──────────────────── run / replay ────────────────────

    /// Apply every event in order, persisting a snapshot after each.
    ///
    /// A structural error is not an `Err`: the scenario ends `failed` with the
    /// failure point recorded and the snapshots before it kept. `Err` means the
    /// run could not be attempted (denied, unknown, already running, not a
    /// draft) or the store failed underneath it.
    pub fn run(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<RunReport> {
        self.load_authorized(ctx, id, OperationKind::RunScenario)?;
        let scenario = self.store.claim_run(id)?;
        let outcome = self.apply_and_persist(id, scenario.events);

        let (state, failure, result) = match outcome {
            Ok((count, None)) => (ScenarioState::Completed, None, Ok(count)),
            Ok((count, Some(failure))) => (ScenarioState::Failed, Some(failure), Ok(count)),
            Err(err) => {
                let failure = RunFailure {
                    event_index: self.store.snapshot_count(id).unwrap_or(0),
                    error: ApplyError::Interrupted {
                        code: err.code().to_string(),
                        details: err.to_string(),
                    },
                };
                (ScenarioState::Failed, Some(failure), Err(err))
            }
        };

        let state_update = self.store.set_state(id, state, failure.as_ref());
        self.audit.record(AuditEntry::new(
            ctx,
            AuditAction::ScenarioRun,
            id.as_str(),
            json!({
                "status": state.as_str(),
                "snapshot_count": result.as_ref().ok(),
                "failure": failure.as_ref().map(ToString::to_string),
            }),
        ));

        let snapshot_count = result?;
        state_update?;
        let scenario = self.store.scenario(id)?.ok_or_else(|| TsimError::NotFound {
            kind: "scenario",
            id: id.to_string(),
        })?;
        Ok(RunReport {
            scenario,
            snapshot_count,
        })
    }

    fn apply_and_persist(
        &self,
        id: &ScenarioId,
        events: Vec<Event>,
    ) -> Result<(usize, Option<RunFailure>)> {
        let mut count = 0;
        for item in self.replay_events(events) {
            match item {
                Ok(snapshot) => {
                    self.store.append_snapshot(id, &snapshot)?;
                    count += 1;
                }
                Err(failure) => return Ok((count, Some(failure))),
            }
        }
        Ok((count, None))
    }

    fn replay_events(&self, events: Vec<Event>) -> Replay {
        Replay::new(events, self.calculator.clone(), self.extensions.clone())
    }

    /// Lazy re-evaluation of a scenario's events. Touches no stored state.
    pub fn replay(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<Replay> {
        let scenario = self.load_authorized(ctx, id, OperationKind::ReplayScenario)?;
        Ok(self.replay_events(scenario.events))
    }

    /// Replay and compare against the stored timeline, snapshot by snapshot.
    pub fn verify_replay(
        &self,
        ctx: &EnvironmentContext,
        id: &ScenarioId,
    ) -> Result<ReplayVerification> {
        let scenario = self.load_authorized(ctx, id, OperationKind::ReplayScenario)?;
        let stored = self.store.snapshots(id)?;
        let (replayed, _) = self.replay_events(scenario.events).snapshots();

        let mut divergence = None;
        for index in 0..stored.len().max(replayed.len()) {
            let stored_digest = stored.get(index).map(Snapshot::digest).transpose()?;
            let replayed_digest = replayed.get(index).map(Snapshot::digest).transpose()?;
            if stored_digest != replayed_digest {
                divergence = Some(Divergence {
                    index,
                    stored: stored_digest,
                    replayed: replayed_digest,
                });
                break;
            }
        }

        Ok(ReplayVerification {
            scenario_id: id.clone(),
            snapshots_compared: stored.len().min(replayed.len()),
            timeline_digest: timeline_digest(&replayed)?,
            divergence,
        })
    }

    // ──────────────────── reads / delete ────────────────────

    pub fn scenario(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<Scenario> {
        self.load_authorized(ctx, id, OperationKind::ReadScenario)
    }

    pub fn snapshots(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<Vec<Snapshot>> {
        self.load_authorized(ctx, id, OperationKind::ReadScenario)?;
        self.store.snapshots(id)
    }

    /// Scenarios in the caller's own scope, oldest first.
    pub fn list_scenarios(&self, ctx: &EnvironmentContext) -> Result<Vec<ScenarioSummary>> {
        enforce(ctx, Operation::new(OperationKind::ListScenarios))?;
        self.store.list_scenarios(&ctx.scope())
    }

    /// Remove a scenario and its timeline. Rejected while a run is active.
    pub fn delete_scenario(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<()> {
        let scenario = self.load_authorized(ctx, id, OperationKind::DeleteScenario)?;
        let snapshot_count = self.store.snapshot_count(id)?;
        self.store.delete_scenario(id)?;
        self.audit.record(AuditEntry::new(
            ctx,
            AuditAction::ScenarioDeleted,
            id.as_str(),
            json!({
                "name": scenario.meta.name,
                "state": scenario.state.as_str(),
                "snapshot_count": snapshot_count,
            }),
        ));
        Ok(())
    }

    fn load_authorized(
        &self,
        ctx: &EnvironmentContext,
        id: &ScenarioId,
        kind: OperationKind,
    ) -> Result<Scenario> {
        let scenario = self.store.scenario(id)?.ok_or_else(|| TsimError::NotFound {
            kind: "scenario",
            id: id.to_string(),
        })?;
        enforce(ctx, Operation::on(kind, &scenario.scope))?;
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRecorder, MemoryAuditSink, RecorderConfig};
    use crate::isolation::guard::SandboxId;
    use crate::signal::model::{Review, ReviewSource};
    use crate::store::MemoryStore;
    use chrono::{DateTime, Duration};

    struct Harness {
        engine: ScenarioEngine,
        sink: MemoryAuditSink,
        _recorder: AuditRecorder,
    }

    fn harness() -> Harness {
        let sink = MemoryAuditSink::new();
        let recorder =
            AuditRecorder::spawn(Box::new(sink.clone()), &RecorderConfig::default()).unwrap();
        let engine = ScenarioEngine::new(
            Arc::new(MemoryStore::new()),
            TrustCalculator::default(),
            EngineConfig::default(),
            recorder.handle(),
        );
        Harness {
            engine,
            sink,
            _recorder: recorder,
        }
    }

    fn sandbox(id: &str) -> EnvironmentContext {
        EnvironmentContext::sandbox("tester", SandboxId::parse(id).unwrap())
    }

    fn t(sec: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(sec)
    }

    fn add(id: &str, source: ReviewSource, weight: f64, sec: i64) -> Event {
        Event::add(Review::new(id, source, weight, t(sec)), t(sec))
    }

    #[test]
    fn create_run_and_replay_agree() {
        let h = harness();
        let ctx = sandbox("team-a");
        let scenario = h
            .engine
            .create_scenario(
                &ctx,
                ScenarioMeta::named("two sources"),
                vec![
                    add("a", ReviewSource::Peer, 1.0, 1),
                    add("b", ReviewSource::Employer, 0.5, 2),
                ],
            )
            .unwrap();
        assert_eq!(scenario.state, ScenarioState::Draft);

        let report = h.engine.run(&ctx, &scenario.id).unwrap();
        assert_eq!(report.status(), ScenarioState::Completed);
        assert_eq!(report.snapshot_count, 2);

        let stored = h.engine.snapshots(&ctx, &scenario.id).unwrap();
        let replayed: Vec<Snapshot> = h
            .engine
            .replay(&ctx, &scenario.id)
            .unwrap()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(stored, replayed);
        assert!(h.engine.verify_replay(&ctx, &scenario.id).unwrap().is_identical());
    }

    #[test]
    fn structural_error_fails_scenario_but_keeps_prefix() {
        let h = harness();
        let ctx = sandbox("team-a");
        let scenario = h
            .engine
            .create_scenario(
                &ctx,
                ScenarioMeta::named("bad remove"),
                vec![
                    add("a", ReviewSource::Peer, 1.0, 1),
                    Event::remove("ghost", t(2)),
                    add("b", ReviewSource::Peer, 1.0, 3),
                ],
            )
            .unwrap();
        let report = h.engine.run(&ctx, &scenario.id).unwrap();
        assert_eq!(report.status(), ScenarioState::Failed);
        assert_eq!(report.snapshot_count, 1);
        let failure = report.failure().unwrap();
        assert_eq!(failure.event_index, 1);
        assert!(matches!(failure.error, ApplyError::UnknownReview { .. }));
        assert_eq!(h.engine.snapshots(&ctx, &scenario.id).unwrap().len(), 1);
    }

    #[test]
    fn rerun_is_rejected() {
        let h = harness();
        let ctx = sandbox("team-a");
        let s = h
            .engine
            .create_scenario(&ctx, ScenarioMeta::named("once"), vec![add("a", ReviewSource::Peer, 0.5, 1)])
            .unwrap();
        h.engine.run(&ctx, &s.id).unwrap();
        let err = h.engine.run(&ctx, &s.id).unwrap_err();
        assert_eq!(err.code(), "TSIM-4003");
    }

    #[test]
    fn concurrent_run_is_rejected() {
        let h = harness();
        let ctx = sandbox("team-a");
        let s = h
            .engine
            .create_scenario(&ctx, ScenarioMeta::named("busy"), vec![add("a", ReviewSource::Peer, 0.5, 1)])
            .unwrap();
        h.engine.store().claim_run(&s.id).unwrap();
        assert_eq!(h.engine.run(&ctx, &s.id).unwrap_err().code(), "TSIM-4002");
        assert_eq!(
            h.engine.delete_scenario(&ctx, &s.id).unwrap_err().code(),
            "TSIM-4002"
        );
        assert_eq!(h.engine.scenario(&ctx, &s.id).unwrap().state, ScenarioState::Running);
    }

    #[test]
    fn validation_rejects_bad_input_before_storage() {
        let h = harness();
        let ctx = sandbox("team-a");
        let cases: Vec<(ScenarioMeta, Vec<Event>)> = vec![
            (ScenarioMeta::named(" "), vec![add("a", ReviewSource::Peer, 1.0, 1)]),
            (ScenarioMeta::named("empty"), vec![]),
            (ScenarioMeta::named("neg"), vec![add("a", ReviewSource::Peer, -1.0, 1)]),
            (
                ScenarioMeta::named("backwards"),
                vec![add("a", ReviewSource::Peer, 1.0, 5), add("b", ReviewSource::Peer, 1.0, 4)],
            ),
            (
                ScenarioMeta::named("future review"),
                vec![Event::add(Review::new("a", ReviewSource::Peer, 1.0, t(9)), t(1))],
            ),
        ];
        for (meta, events) in cases {
            let err = h.engine.create_scenario(&ctx, meta, events).unwrap_err();
            assert_eq!(err.code(), "TSIM-2001", "{err}");
        }
        assert!(h.engine.list_scenarios(&ctx).unwrap().is_empty());

        let mut meta = ScenarioMeta::named("explicitly empty");
        meta.allow_empty = true;
        let s = h.engine.create_scenario(&ctx, meta, vec![]).unwrap();
        let report = h.engine.run(&ctx, &s.id).unwrap();
        assert_eq!(report.status(), ScenarioState::Completed);
        assert_eq!(report.snapshot_count, 0);
    }

    #[test]
    fn event_limit_enforced() {
        let engine = ScenarioEngine::new(
            Arc::new(MemoryStore::new()),
            TrustCalculator::default(),
            EngineConfig {
                max_events_per_scenario: 2,
                ..EngineConfig::default()
            },
            AuditHandle::disabled(),
        );
        let ctx = sandbox("team-a");
        let events: Vec<Event> = (0..3)
            .map(|i| add(&format!("r{i}"), ReviewSource::Peer, 0.1, i))
            .collect();
        assert!(engine.create_scenario(&ctx, ScenarioMeta::named("big"), events).is_err());
    }

    #[test]
    fn cross_scope_access_is_denied_and_listing_is_scoped() {
        let h = harness();
        let a = sandbox("team-a");
        let b = sandbox("team-b");
        let prod = EnvironmentContext::production("ops");
        let s = h
            .engine
            .create_scenario(&a, ScenarioMeta::named("mine"), vec![add("a", ReviewSource::Peer, 1.0, 1)])
            .unwrap();

        for ctx in [&b, &prod] {
            assert!(h.engine.scenario(ctx, &s.id).unwrap_err().is_denial());
            assert!(h.engine.run(ctx, &s.id).unwrap_err().is_denial());
            assert!(h.engine.replay(ctx, &s.id).unwrap_err().is_denial());
            assert!(h.engine.delete_scenario(ctx, &s.id).unwrap_err().is_denial());
            assert!(h.engine.list_scenarios(ctx).unwrap().is_empty());
        }
        assert_eq!(h.engine.list_scenarios(&a).unwrap().len(), 1);
    }

    #[test]
    fn each_mutation_emits_one_audit_entry() {
        let h = harness();
        let ctx = sandbox("team-a");
        let s = h
            .engine
            .create_scenario(&ctx, ScenarioMeta::named("audited"), vec![add("a", ReviewSource::Peer, 1.0, 1)])
            .unwrap();
        h.engine.run(&ctx, &s.id).unwrap();
        let _ = h.engine.replay(&ctx, &s.id).unwrap().count();
        let _ = h.engine.list_scenarios(&ctx).unwrap();
        h.engine.delete_scenario(&ctx, &s.id).unwrap();
        assert!(h.engine.audit().flush());

        let actions: Vec<AuditAction> = h.sink.entries().iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::ScenarioCreated,
                AuditAction::ScenarioRun,
                AuditAction::ScenarioDeleted
            ]
        );
        assert!(h.sink.entries().iter().all(|e| e.actor_id == "tester"));
    }

    #[test]
    fn delete_removes_timeline() {
        let h = harness();
        let ctx = sandbox("team-a");
        let s = h
            .engine
            .create_scenario(&ctx, ScenarioMeta::named("gone"), vec![add("a", ReviewSource::Peer, 1.0, 1)])
            .unwrap();
        h.engine.run(&ctx, &s.id).unwrap();
        h.engine.delete_scenario(&ctx, &s.id).unwrap();
        assert_eq!(h.engine.scenario(&ctx, &s.id).unwrap_err().code(), "TSIM-4001");
        assert!(h.engine.store().snapshots(&s.id).unwrap().is_empty());
    }

    #[test]
    fn load_from_delta_creates_typed_scenario() {
        let h = harness();
        let ctx = sandbox("team-a");
        let raw = json!({
            "name": "legacy",
            "steps": [
                {"type": "addReview", "id": "x", "source": "peer", "w": 0.9,
                 "ts": "2026-07-01T00:00:00Z"},
                {"type": "remove", "id": "x", "ts": "2026-07-01T00:00:10Z"}
            ]
        });
        let s = h.engine.load_from_delta(&ctx, &raw).unwrap();
        assert_eq!(s.meta.name, "legacy");
        assert_eq!(s.events.len(), 2);
        let report = h.engine.run(&ctx, &s.id).unwrap();
        assert_eq!(report.snapshot_count, 2);
        let snaps = h.engine.snapshots(&ctx, &s.id).unwrap();
        assert!(snaps[1].metrics.trust_score.abs() < f64::EPSILON);
    }

    /// Store that fails every append after the first.
    struct FlakyStore {
        inner: MemoryStore,
        appends: std::sync::atomic::AtomicUsize,
    }

    impl SimulationStore for FlakyStore {
        fn insert_scenario(&self, s: &Scenario) -> Result<()> {
            self.inner.insert_scenario(s)
        }
        fn scenario(&self, id: &ScenarioId) -> Result<Option<Scenario>> {
            self.inner.scenario(id)
        }
        fn claim_run(&self, id: &ScenarioId) -> Result<Scenario> {
            self.inner.claim_run(id)
        }
        fn set_state(
            &self,
            id: &ScenarioId,
            state: ScenarioState,
            failure: Option<&RunFailure>,
        ) -> Result<()> {
            self.inner.set_state(id, state, failure)
        }
        fn append_snapshot(&self, id: &ScenarioId, snapshot: &Snapshot) -> Result<()> {
            if self.appends.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 1 {
                return Err(TsimError::Runtime {
                    details: "disk full".to_string(),
                });
            }
            self.inner.append_snapshot(id, snapshot)
        }
        fn snapshots(&self, id: &ScenarioId) -> Result<Vec<Snapshot>> {
            self.inner.snapshots(id)
        }
        fn snapshot_count(&self, id: &ScenarioId) -> Result<usize> {
            self.inner.snapshot_count(id)
        }
        fn list_scenarios(
            &self,
            scope: &crate::isolation::guard::Scope,
        ) -> Result<Vec<ScenarioSummary>> {
            self.inner.list_scenarios(scope)
        }
        fn delete_scenario(&self, id: &ScenarioId) -> Result<bool> {
            self.inner.delete_scenario(id)
        }
        fn insert_fuzz_run(&self, run: &crate::fuzz::run::FuzzRun) -> Result<()> {
            self.inner.insert_fuzz_run(run)
        }
        fn fuzz_run(
            &self,
            id: &crate::core::ids::FuzzRunId,
        ) -> Result<Option<crate::fuzz::run::FuzzRun>> {
            self.inner.fuzz_run(id)
        }
        fn list_fuzz_runs(
            &self,
            scope: &crate::isolation::guard::Scope,
            limit: usize,
        ) -> Result<Vec<crate::fuzz::run::FuzzRun>> {
            self.inner.list_fuzz_runs(scope, limit)
        }
    }

    #[test]
    fn store_failure_mid_run_marks_interrupted() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            appends: std::sync::atomic::AtomicUsize::new(0),
        });
        let engine = ScenarioEngine::new(
            store,
            TrustCalculator::default(),
            EngineConfig::default(),
            AuditHandle::disabled(),
        );
        let ctx = sandbox("team-a");
        let s = engine
            .create_scenario(
                &ctx,
                ScenarioMeta::named("flaky"),
                vec![add("a", ReviewSource::Peer, 1.0, 1), add("b", ReviewSource::Peer, 1.0, 2)],
            )
            .unwrap();
        let err = engine.run(&ctx, &s.id).unwrap_err();
        assert_eq!(err.code(), "TSIM-3900");
        let stored = engine.scenario(&ctx, &s.id).unwrap();
        assert_eq!(stored.state, ScenarioState::Failed);
        let failure = stored.failure.unwrap();
        assert_eq!(failure.event_index, 1);
        assert!(matches!(failure.error, ApplyError::Interrupted { .. }));
    }
}
