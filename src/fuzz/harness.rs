//! Fuzz batches: generate, run, check invariants, persist, across a worker pool.
//!
//! Each iteration is independent. Invariant violations are recorded on the
//! [`FuzzRun`]; anything that keeps an iteration from completing (generator
//! exhaustion, a store error) aborts that iteration only and is reported in
//! the [`FuzzBatchReport`].

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use crossbeam_channel as channel;
use serde::Serialize;
use serde_json::json;

use crate::audit::{AuditAction, AuditEntry};
use crate::core::config::FuzzConfig;
use crate::core::errors::{Result, TsimError};
use crate::core::ids::{FuzzRunId, IdGenerator};
use crate::fuzz::cancel::CancelToken;
use crate::fuzz::generator::{self, EventGenerator, FuzzBounds, derive_seed};
use crate::fuzz::invariants::{Invariant, InvariantInput, default_invariants, evaluate};
use crate::fuzz::run::FuzzRun;
use crate::isolation::context::EnvironmentContext;
use crate::isolation::guard::{Operation, OperationKind, SandboxId, Scope, enforce};
use crate::scenario::engine::ScenarioEngine;
use crate::scenario::event::Event;
use crate::scenario::model::{ScenarioMeta, ScenarioOrigin};

/// Parameters for one batch. `None` fields fall back to configuration.
#[derive(Debug, Clone, Default)]
pub struct FuzzRequest {
    pub count: usize,
    pub bounds: Option<FuzzBounds>,
    /// Batch seed; random when absent. Per-iteration seeds derive from it.
    pub seed: Option<u64>,
    pub workers: Option<usize>,
}

impl FuzzRequest {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_bounds(mut self, bounds: FuzzBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// An iteration that never produced a [`FuzzRun`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbortedIteration {
    pub index: usize,
    pub seed: u64,
    pub code: String,
    pub details: String,
}

/// Everything a batch produced, in iteration order.
#[derive(Debug, Clone, Serialize)]
pub struct FuzzBatchReport {
    pub batch_seed: u64,
    pub requested: usize,
    pub runs: Vec<FuzzRun>,
    pub aborted: Vec<AbortedIteration>,
    /// Set when cancellation stopped the batch before every iteration started.
    pub cancelled: bool,
}

impl FuzzBatchReport {
    #[must_use]
    pub fn run_ids(&self) -> Vec<FuzzRunId> {
        self.runs.iter().map(|r| r.id.clone()).collect()
    }

    #[must_use]
    pub fn passed(&self) -> usize {
        self.runs.iter().filter(|r| r.passed).count()
    }

    pub fn failed_runs(&self) -> impl Iterator<Item = &FuzzRun> {
        self.runs.iter().filter(|r| !r.passed)
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.aborted.is_empty() && self.runs.iter().all(|r| r.passed)
    }
}

enum Outcome {
    Run(Box<FuzzRun>),
    Aborted(AbortedIteration),
}

/// Drives fuzz batches against a shared engine.
pub struct FuzzHarness {
    engine: Arc<ScenarioEngine>,
    config: FuzzConfig,
    invariants: Vec<Arc<dyn Invariant>>,
    ids: IdGenerator,
}

impl FuzzHarness {
    /// Harness with the built-in invariant set.
    #[must_use]
    pub fn new(engine: Arc<ScenarioEngine>, config: FuzzConfig) -> Self {
        Self {
            engine,
            config,
            invariants: default_invariants(),
            ids: IdGenerator::new(),
        }
    }

    /// Add a predicate checked on every subsequent iteration.
    #[must_use]
    pub fn with_invariant(mut self, invariant: Arc<dyn Invariant>) -> Self {
        self.invariants.push(invariant);
        self
    }

    #[must_use]
    pub fn invariant_names(&self) -> Vec<String> {
        self.invariants.iter().map(|i| i.name().to_string()).collect()
    }

    #[must_use]
    pub const fn config(&self) -> &FuzzConfig {
        &self.config
    }

    // ──────────────────── batches ────────────────────

    /// Run `request.count` iterations using the harness's invariants.
    pub fn run_batch(
        &self,
        ctx: &EnvironmentContext,
        request: &FuzzRequest,
        cancel: &CancelToken,
    ) -> Result<FuzzBatchReport> {
        self.run_batch_with(ctx, request, &self.invariants, cancel)
    }

    /// Run a batch against an explicit invariant set.
    pub fn run_batch_with(
        &self,
        ctx: &EnvironmentContext,
        request: &FuzzRequest,
        invariants: &[Arc<dyn Invariant>],
        cancel: &CancelToken,
    ) -> Result<FuzzBatchReport> {
        enforce(ctx, Operation::new(OperationKind::RunFuzzBatch))?;
        if request.count > self.config.max_batch_size {
            return Err(TsimError::validation(
                "count",
                format!(
                    "{} iterations exceed fuzz.max_batch_size {}",
                    request.count, self.config.max_batch_size
                ),
            ));
        }
        let bounds = request
            .bounds
            .clone()
            .unwrap_or_else(|| self.config.bounds.clone());
        let generator = EventGenerator::new(bounds)?;
        let batch_seed = request.seed.unwrap_or_else(rand::random);
        let workers = request
            .workers
            .unwrap_or(self.config.workers)
            .clamp(1, request.count.max(1));

        let (work_tx, work_rx) = channel::bounded::<usize>(request.count.max(1));
        for index in 0..request.count {
            // Capacity covers every index, so this never blocks.
            let _ = work_tx.send(index);
        }
        drop(work_tx);
        let (result_tx, result_rx) = channel::unbounded::<(usize, Outcome)>();

        thread::scope(|s| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let generator = &generator;
                s.spawn(move || {
                    while !cancel.is_cancelled() {
                        let Ok(index) = work_rx.recv() else {
                            break;
                        };
                        let seed = derive_seed(batch_seed, index as u64);
                        let outcome =
                            match self.iteration(ctx, generator, seed, invariants) {
                                Ok(run) => Outcome::Run(Box::new(run)),
                                Err(err) => {
                                    eprintln!(
                                        "[TSIM-FUZZ] iteration {index} (seed {seed:#018x}) aborted: {err}"
                                    );
                                    Outcome::Aborted(AbortedIteration {
                                        index,
                                        seed,
                                        code: err.code().to_string(),
                                        details: err.to_string(),
                                    })
                                }
                            };
                        if result_tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut outcomes: Vec<(usize, Outcome)> = result_rx.try_iter().collect();
        outcomes.sort_by_key(|(index, _)| *index);
        let started = outcomes.len();

        let mut report = FuzzBatchReport {
            batch_seed,
            requested: request.count,
            runs: Vec::new(),
            aborted: Vec::new(),
            cancelled: started < request.count,
        };
        for (_, outcome) in outcomes {
            match outcome {
                Outcome::Run(run) => report.runs.push(*run),
                Outcome::Aborted(aborted) => report.aborted.push(aborted),
            }
        }
        if report.cancelled {
            eprintln!(
                "[TSIM-FUZZ] batch {batch_seed:#018x} cancelled after {started} of {} iterations",
                request.count
            );
        }

        self.engine.audit().record(AuditEntry::new(
            ctx,
            AuditAction::FuzzBatch,
            format!("batch-{batch_seed:016x}"),
            json!({
                "requested": request.count,
                "completed": report.runs.len(),
                "passed": report.passed(),
                "aborted": report.aborted.len(),
                "cancelled": report.cancelled,
                "max_events": generator.bounds().max_events,
                "workers": workers,
            }),
        ));
        Ok(report)
    }

    fn iteration(
        &self,
        ctx: &EnvironmentContext,
        generator: &EventGenerator,
        seed: u64,
        invariants: &[Arc<dyn Invariant>],
    ) -> Result<FuzzRun> {
        let started_at = Utc::now();
        let events = generator.generate(seed)?;
        let event_count = events.len();

        let meta = ScenarioMeta::named(format!("fuzz {seed:016x}")).with_origin(ScenarioOrigin::Fuzz);
        let scenario = self.engine.create_scenario(ctx, meta, events)?;
        let report = self.engine.run(ctx, &scenario.id)?;
        let stored = self.engine.snapshots(ctx, &scenario.id)?;
        let (replayed, _) = self.engine.replay(ctx, &scenario.id)?.snapshots();

        let violations = evaluate(
            invariants,
            &InvariantInput {
                events: &report.scenario.events,
                snapshots: &stored,
                replayed: &replayed,
                failure: report.failure(),
                calculator: self.engine.calculator(),
            },
        );
        let violated_invariants: BTreeSet<String> =
            violations.iter().map(|v| v.invariant.clone()).collect();

        let run = FuzzRun {
            id: self.ids.fuzz_run_id(),
            scope: ctx.scope(),
            seed,
            event_count,
            bounds: generator.bounds().clone(),
            scenario_id: scenario.id,
            passed: violations.is_empty(),
            violated_invariants,
            violations,
            started_at,
            finished_at: Utc::now(),
        };
        self.engine.store().insert_fuzz_run(&run)?;
        Ok(run)
    }

    // ──────────────────── reads ────────────────────

    /// Newest-first fuzz runs in the caller's sandbox.
    ///
    /// Naming a sandbox other than the caller's is a denial, not an empty
    /// list. `limit` is clamped to the configured maximum; zero is rejected.
    pub fn list_runs(
        &self,
        ctx: &EnvironmentContext,
        sandbox: Option<&SandboxId>,
        limit: Option<usize>,
    ) -> Result<Vec<FuzzRun>> {
        let requested = sandbox.map(|id| Scope::Sandbox(id.clone()));
        match &requested {
            Some(scope) => enforce(ctx, Operation::on(OperationKind::ListFuzzRuns, scope))?,
            None => enforce(ctx, Operation::new(OperationKind::ListFuzzRuns))?,
        }
        let limit = self.config.effective_list_limit(limit)?;
        self.engine.store().list_fuzz_runs(&ctx.scope(), limit)
    }

    pub fn fuzz_run(&self, ctx: &EnvironmentContext, id: &FuzzRunId) -> Result<FuzzRun> {
        enforce(ctx, Operation::new(OperationKind::ReadFuzzRun))?;
        let run = self
            .engine
            .store()
            .fuzz_run(id)?
            .ok_or_else(|| TsimError::NotFound {
                kind: "fuzz_run",
                id: id.to_string(),
            })?;
        enforce(ctx, Operation::on(OperationKind::ReadFuzzRun, &run.scope))?;
        Ok(run)
    }

    /// Regenerate the exact event list a stored run executed.
    pub fn reproduce(&self, ctx: &EnvironmentContext, id: &FuzzRunId) -> Result<Vec<Event>> {
        let run = self.fuzz_run(ctx, id)?;
        generator::reproduce(run.seed, &run.bounds)
    }
}
