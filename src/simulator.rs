//! `Simulator`: one entry point over the engine, the fuzz harness, the store,
//! and the audit recorder.
//!
//! Every operation takes the caller's [`EnvironmentContext`] explicitly; the
//! facade holds no notion of a "current" environment.

#![allow(missing_docs)]

use std::sync::Arc;

use serde::Serialize;

use crate::audit::{self, AuditRecorder, AuditSink, AuditStats, RecorderConfig};
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::core::ids::{FuzzRunId, ScenarioId};
use crate::fuzz::{
    CancelToken, FuzzBatchReport, FuzzBounds, FuzzHarness, FuzzRequest, FuzzRun, Invariant,
};
use crate::isolation::context::EnvironmentContext;
use crate::isolation::guard::SandboxId;
use crate::scenario::engine::ScenarioEngine;
use crate::scenario::event::{Event, ExtensionRegistry};
use crate::scenario::model::{
    ReplayVerification, RunFailure, Scenario, ScenarioMeta, ScenarioState, ScenarioSummary,
    Snapshot,
};
use crate::scenario::replay::Replay;
use crate::signal::calculator::{ScoreBreakdown, TrustCalculator};
use crate::signal::model::{Review, TrustMetrics};
use crate::store::{MemoryStore, SimulationStore};

/// Result of `run_scenario`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub scenario_id: ScenarioId,
    pub status: ScenarioState,
    pub snapshot_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

/// Facade owning the engine, harness, and audit recorder thread.
pub struct Simulator {
    config: Config,
    engine: Arc<ScenarioEngine>,
    fuzz: FuzzHarness,
    recorder: AuditRecorder,
}

impl Simulator {
    /// Durable simulator: SQLite store at `paths.sqlite_db` and the configured
    /// audit sink.
    #[cfg(feature = "sqlite")]
    pub fn open(config: Config) -> Result<Self> {
        let store = Arc::new(crate::store::SqliteStore::open(&config.paths.sqlite_db)?);
        let sink = audit::open_sink(&config)?;
        Self::with_parts(config, store, sink, ExtensionRegistry::new())
    }

    /// Volatile simulator: in-memory store, audit entries kept in memory.
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(MemoryStore::new()),
            Box::new(audit::MemoryAuditSink::new()),
            ExtensionRegistry::new(),
        )
    }

    /// Assemble from explicit parts.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn SimulationStore>,
        sink: Box<dyn AuditSink>,
        extensions: ExtensionRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let recorder = AuditRecorder::spawn(sink, &RecorderConfig::from(&config.audit))?;
        let engine = Arc::new(
            ScenarioEngine::new(
                store,
                TrustCalculator::from_config(&config.calculator),
                config.engine.clone(),
                recorder.handle(),
            )
            .with_extensions(extensions),
        );
        let fuzz = FuzzHarness::new(Arc::clone(&engine), config.fuzz.clone());
        Ok(Self {
            config,
            engine,
            fuzz,
            recorder,
        })
    }

    /// Add an invariant checked by every later fuzz batch.
    #[must_use]
    pub fn with_invariant(mut self, invariant: Arc<dyn Invariant>) -> Self {
        self.fuzz = self.fuzz.with_invariant(invariant);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &ScenarioEngine {
        &self.engine
    }

    #[must_use]
    pub const fn harness(&self) -> &FuzzHarness {
        &self.fuzz
    }

    // ──────────────────── scoring ────────────────────

    /// Score a review set with the configured coefficients. Unguarded: pure.
    #[must_use]
    pub fn score(&self, reviews: &[Review]) -> TrustMetrics {
        self.engine.calculator().compute(reviews)
    }

    #[must_use]
    pub fn explain(&self, reviews: &[Review]) -> ScoreBreakdown {
        self.engine.calculator().breakdown(reviews)
    }

    // ──────────────────── scenarios ────────────────────

    pub fn create_scenario(
        &self,
        ctx: &EnvironmentContext,
        meta: ScenarioMeta,
        events: Vec<Event>,
    ) -> Result<ScenarioId> {
        Ok(self.engine.create_scenario(ctx, meta, events)?.id)
    }

    /// Create a scenario from a legacy delta blob.
    pub fn import_delta(
        &self,
        ctx: &EnvironmentContext,
        raw: &serde_json::Value,
    ) -> Result<ScenarioId> {
        Ok(self.engine.load_from_delta(ctx, raw)?.id)
    }

    pub fn run_scenario(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<RunSummary> {
        let report = self.engine.run(ctx, id)?;
        Ok(RunSummary {
            scenario_id: id.clone(),
            status: report.status(),
            snapshot_count: report.snapshot_count,
            failure: report.scenario.failure,
        })
    }

    /// Recomputed timeline, stopping before the first failing event.
    pub fn replay_scenario(
        &self,
        ctx: &EnvironmentContext,
        id: &ScenarioId,
    ) -> Result<Vec<Snapshot>> {
        Ok(self.engine.replay(ctx, id)?.snapshots().0)
    }

    /// Lazy form of [`replay_scenario`](Self::replay_scenario).
    pub fn replay_iter(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<Replay> {
        self.engine.replay(ctx, id)
    }

    pub fn verify_replay(
        &self,
        ctx: &EnvironmentContext,
        id: &ScenarioId,
    ) -> Result<ReplayVerification> {
        self.engine.verify_replay(ctx, id)
    }

    pub fn scenario(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<Scenario> {
        self.engine.scenario(ctx, id)
    }

    /// Stored timeline of a scenario that has run.
    pub fn snapshots(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<Vec<Snapshot>> {
        self.engine.snapshots(ctx, id)
    }

    pub fn list_scenarios(&self, ctx: &EnvironmentContext) -> Result<Vec<ScenarioSummary>> {
        self.engine.list_scenarios(ctx)
    }

    pub fn delete_scenario(&self, ctx: &EnvironmentContext, id: &ScenarioId) -> Result<()> {
        self.engine.delete_scenario(ctx, id)
    }

    // ──────────────────── fuzzing ────────────────────

    /// Run `count` iterations and return the ids of the persisted runs.
    pub fn run_fuzz_batch(
        &self,
        ctx: &EnvironmentContext,
        count: usize,
        bounds: FuzzBounds,
    ) -> Result<Vec<FuzzRunId>> {
        let request = FuzzRequest::new(count).with_bounds(bounds);
        Ok(self.fuzz.run_batch(ctx, &request, &CancelToken::new())?.run_ids())
    }

    /// Full-control batch: explicit seed, workers, and cancellation.
    pub fn run_fuzz(
        &self,
        ctx: &EnvironmentContext,
        request: &FuzzRequest,
        cancel: &CancelToken,
    ) -> Result<FuzzBatchReport> {
        self.fuzz.run_batch(ctx, request, cancel)
    }

    /// Batch checked against `invariants` instead of the configured set.
    pub fn run_fuzz_with(
        &self,
        ctx: &EnvironmentContext,
        request: &FuzzRequest,
        invariants: &[Arc<dyn Invariant>],
        cancel: &CancelToken,
    ) -> Result<FuzzBatchReport> {
        self.fuzz.run_batch_with(ctx, request, invariants, cancel)
    }

    pub fn list_fuzz_runs(
        &self,
        ctx: &EnvironmentContext,
        sandbox: Option<&SandboxId>,
        limit: Option<usize>,
    ) -> Result<Vec<FuzzRun>> {
        self.fuzz.list_runs(ctx, sandbox, limit)
    }

    pub fn fuzz_run(&self, ctx: &EnvironmentContext, id: &FuzzRunId) -> Result<FuzzRun> {
        self.fuzz.fuzz_run(ctx, id)
    }

    pub fn reproduce(&self, ctx: &EnvironmentContext, id: &FuzzRunId) -> Result<Vec<Event>> {
        self.fuzz.reproduce(ctx, id)
    }

    // ──────────────────── audit ────────────────────

    /// Block until queued audit entries reach the sink. `false` on timeout.
    pub fn flush_audit(&self) -> bool {
        self.recorder.handle().flush()
    }

    #[must_use]
    pub fn audit_stats(&self) -> AuditStats {
        self.recorder.handle().stats()
    }

    /// Drain the audit channel and stop the recorder thread.
    pub fn shutdown(self) -> AuditStats {
        let Self { recorder, .. } = self;
        recorder.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, MemoryAuditSink};
    use crate::signal::model::ReviewSource;
    use chrono::{DateTime, Utc};

    fn at(sec: u32) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2026-09-01T00:00:{sec:02}Z"))
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sandbox() -> EnvironmentContext {
        EnvironmentContext::sandbox("sim", SandboxId::parse("sim").unwrap())
    }

    #[test]
    fn end_to_end_in_memory() {
        let sim = Simulator::in_memory(Config::default()).unwrap();
        let ctx = sandbox();
        let id = sim
            .create_scenario(
                &ctx,
                ScenarioMeta::named("facade"),
                vec![
                    Event::add(Review::new("a", ReviewSource::Peer, 1.0, at(1)), at(1)),
                    Event::add(Review::new("b", ReviewSource::Employer, 0.5, at(2)), at(2)),
                ],
            )
            .unwrap();
        let summary = sim.run_scenario(&ctx, &id).unwrap();
        assert_eq!(summary.status, ScenarioState::Completed);
        assert_eq!(summary.snapshot_count, 2);
        assert!(summary.failure.is_none());

        let replayed = sim.replay_scenario(&ctx, &id).unwrap();
        assert_eq!(replayed, sim.snapshots(&ctx, &id).unwrap());
        assert_eq!(replayed[1].metrics.network_strength, 2);
        assert_eq!(sim.list_scenarios(&ctx).unwrap()[0].name, "facade");
    }

    #[test]
    fn fuzz_ids_resolve_and_audit_is_recorded() {
        let sink = MemoryAuditSink::new();
        let sim = Simulator::with_parts(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Box::new(sink.clone()),
            ExtensionRegistry::new(),
        )
        .unwrap();
        let ctx = sandbox();
        let ids = sim
            .run_fuzz_batch(&ctx, 5, FuzzBounds::with_max_events(6))
            .unwrap();
        assert_eq!(ids.len(), 5);
        for id in &ids {
            assert!(sim.fuzz_run(&ctx, id).unwrap().passed);
        }
        assert!(sim.flush_audit());
        let entries = sink.entries();
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.action == AuditAction::FuzzBatch)
                .count(),
            1
        );
        let stats = sim.shutdown();
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn score_matches_calculator() {
        let sim = Simulator::in_memory(Config::default()).unwrap();
        assert_eq!(sim.score(&[]), TrustMetrics::EMPTY);
        let reviews = [Review::new("a", ReviewSource::System, 0.4, at(0))];
        assert_eq!(sim.score(&reviews).trust_score, sim.explain(&reviews).trust_score);
    }
}
