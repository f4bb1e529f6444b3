//! End-to-end tests: library facade over both stores, plus CLI smoke tests
//! against the built `tsim` binary.

mod common;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use trustsim::audit::MemoryAuditSink;
use trustsim::core::errors::TsimError;
use trustsim::fuzz::invariants::{Invariant, InvariantInput, Violation};
use trustsim::isolation::context::{EnvironmentResolver, FixedEnvironment};
use trustsim::isolation::guard::DenialReason;
use trustsim::prelude::*;
use trustsim::scenario::event::ReviewSet;
use trustsim::store::MemoryStore;

fn t(sec: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::seconds(sec)
}

fn add(id: &str, source: ReviewSource, weight: f64, sec: i64) -> Event {
    Event::add(Review::new(id, source, weight, t(sec)), t(sec))
}

fn sandbox(id: &str) -> EnvironmentContext {
    EnvironmentContext::sandbox("itest", SandboxId::parse(id).unwrap())
}

fn sim() -> Simulator {
    Simulator::in_memory(Config::default()).unwrap()
}

fn durable_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.paths.sqlite_db = dir.join("sim.sqlite3");
    config.paths.audit_jsonl = dir.join("audit.jsonl");
    config
}

// ──────────────────── concrete scenarios ────────────────────

#[test]
fn empty_review_set_scores_zero() {
    assert_eq!(sim().score(&[]), TrustMetrics::EMPTY);
    assert_eq!(TrustMetrics::EMPTY.trust_score, 0.0);
    assert_eq!(TrustMetrics::EMPTY.network_strength, 0);
}

#[test]
fn two_sources_yield_two_snapshots_with_growing_trust() {
    let sim = sim();
    let ctx = sandbox("s2");
    let id = sim
        .create_scenario(
            &ctx,
            ScenarioMeta::named("peer then employer"),
            vec![
                add("a", ReviewSource::Peer, 1.0, 0),
                add("b", ReviewSource::Employer, 0.5, 1),
            ],
        )
        .unwrap();
    let summary = sim.run_scenario(&ctx, &id).unwrap();
    assert_eq!(summary.status, ScenarioState::Completed);
    assert_eq!(summary.snapshot_count, 2);

    let snaps = sim.snapshots(&ctx, &id).unwrap();
    assert_eq!(snaps[1].metrics.network_strength, 2);
    assert!(snaps[1].metrics.trust_score >= snaps[0].metrics.trust_score);
}

#[test]
fn add_then_remove_returns_to_zero() {
    let sim = sim();
    let ctx = sandbox("s3");
    let id = sim
        .create_scenario(
            &ctx,
            ScenarioMeta::named("add remove"),
            vec![
                add("a", ReviewSource::Peer, 1.0, 0),
                Event::remove("a", t(5)),
            ],
        )
        .unwrap();
    sim.run_scenario(&ctx, &id).unwrap();
    let snaps = sim.replay_scenario(&ctx, &id).unwrap();
    assert_eq!(snaps.len(), 2);
    assert!(snaps[1].reviews.is_empty());
    assert_eq!(snaps[1].metrics.trust_score, 0.0);
}

#[test]
fn fuzz_batch_of_one_hundred_passes() {
    let sim = sim();
    let ctx = sandbox("s4");
    let ids = sim
        .run_fuzz_batch(&ctx, 100, FuzzBounds::with_max_events(10))
        .unwrap();
    assert_eq!(ids.len(), 100);
    for id in ids {
        let run = sim.fuzz_run(&ctx, &id).unwrap();
        assert!(run.passed, "{:?}", run.violations);
        assert!(run.event_count <= 10);
    }
}

#[test]
fn production_cannot_fuzz() {
    let sim = sim();
    let prod = EnvironmentContext::production("ops");
    let err = sim
        .run_fuzz_batch(&prod, 1, FuzzBounds::default())
        .unwrap_err();
    assert!(matches!(
        err,
        TsimError::IsolationDenied {
            reason: DenialReason::FuzzRequiresSandbox
        }
    ));
    assert!(err.to_string().contains("fuzz_requires_sandbox"));
    assert!(sim.list_fuzz_runs(&prod, None, None).unwrap_err().is_denial());

    let sandboxed = sim
        .run_fuzz_batch(&sandbox("s5"), 2, FuzzBounds::default())
        .unwrap();
    assert_eq!(sandboxed.len(), 2);
}

#[test]
fn fuzz_listing_is_capped_at_one_hundred() {
    let sim = sim();
    let ctx = sandbox("s6");
    sim.run_fuzz_batch(&ctx, 130, FuzzBounds::with_max_events(3))
        .unwrap();
    assert_eq!(sim.list_fuzz_runs(&ctx, None, Some(1000)).unwrap().len(), 100);
    assert_eq!(sim.list_fuzz_runs(&ctx, None, None).unwrap().len(), 50);
}

// ──────────────────── isolation ────────────────────

#[test]
fn environments_never_see_each_other() {
    let sim = sim();
    let a = sandbox("team-a");
    let b = sandbox("team-b");
    let prod = EnvironmentContext::production("ops");

    let in_a = sim
        .create_scenario(&a, ScenarioMeta::named("a"), vec![add("x", ReviewSource::Peer, 1.0, 0)])
        .unwrap();
    let in_prod = sim
        .create_scenario(&prod, ScenarioMeta::named("p"), vec![add("y", ReviewSource::System, 1.0, 0)])
        .unwrap();

    assert_eq!(sim.list_scenarios(&a).unwrap().len(), 1);
    assert_eq!(sim.list_scenarios(&prod).unwrap().len(), 1);
    assert!(sim.list_scenarios(&b).unwrap().is_empty());

    let err = sim.run_scenario(&b, &in_a).unwrap_err();
    assert!(matches!(
        err,
        TsimError::IsolationDenied {
            reason: DenialReason::CrossEnvironment { .. }
        }
    ));
    assert!(sim.scenario(&a, &in_prod).unwrap_err().is_denial());
    assert!(sim.scenario(&prod, &in_a).unwrap_err().is_denial());
    assert_eq!(
        sim.scenario(&a, &ScenarioId::new("scn-missing")).unwrap_err().code(),
        "TSIM-4001"
    );

    sim.run_fuzz_batch(&a, 3, FuzzBounds::default()).unwrap();
    assert!(sim.list_fuzz_runs(&b, None, None).unwrap().is_empty());
    let team_a = SandboxId::parse("team-a").unwrap();
    assert!(sim.list_fuzz_runs(&b, Some(&team_a), None).unwrap_err().is_denial());
    assert_eq!(sim.list_fuzz_runs(&a, Some(&team_a), None).unwrap().len(), 3);
}

#[test]
fn resolver_supplies_context() {
    let resolver = FixedEnvironment(sandbox("fixed"));
    let ctx = resolver.resolve().unwrap();
    assert_eq!(ctx.scope(), Scope::Sandbox(SandboxId::parse("fixed").unwrap()));
}

// ──────────────────── persistence ────────────────────

#[test]
fn sqlite_timeline_survives_reopen_and_replays_identically() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = sandbox("durable");

    let (scenario_id, run_ids) = {
        let sim = Simulator::open(durable_config(dir.path())).unwrap();
        let id = sim
            .create_scenario(
                &ctx,
                ScenarioMeta::named("durable"),
                vec![
                    add("a", ReviewSource::Peer, 0.3333, 0),
                    add("b", ReviewSource::Employer, 0.1, 1),
                    Event::set_weight("a", 2.7183, t(2)),
                    add("c", ReviewSource::System, 0.05, 3),
                    Event::remove("b", t(4)),
                ],
            )
            .unwrap();
        sim.run_scenario(&ctx, &id).unwrap();
        let runs = sim
            .run_fuzz_batch(&ctx, 5, FuzzBounds::with_max_events(8))
            .unwrap();
        sim.shutdown();
        (id, runs)
    };

    let sim = Simulator::open(durable_config(dir.path())).unwrap();
    let scenario = sim.scenario(&ctx, &scenario_id).unwrap();
    assert_eq!(scenario.state, ScenarioState::Completed);
    assert_eq!(sim.snapshots(&ctx, &scenario_id).unwrap().len(), 5);
    assert!(sim.verify_replay(&ctx, &scenario_id).unwrap().is_identical());

    let listed = sim.list_fuzz_runs(&ctx, None, None).unwrap();
    assert_eq!(listed.len(), run_ids.len());
    for id in &run_ids {
        let run = sim.fuzz_run(&ctx, id).unwrap();
        let events = sim.reproduce(&ctx, id).unwrap();
        assert_eq!(sim.scenario(&ctx, &run.scenario_id).unwrap().events, events);
    }
    sim.shutdown();

    assert!(common::count_audit_actions(&dir.path().join("audit.jsonl"), "scenario_created") >= 1);
    assert_eq!(
        common::count_audit_actions(&dir.path().join("audit.jsonl"), "fuzz_batch"),
        1
    );
}

#[test]
fn deleted_scenario_is_gone_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = sandbox("durable");
    let sim = Simulator::open(durable_config(dir.path())).unwrap();
    let id = sim
        .create_scenario(&ctx, ScenarioMeta::named("temp"), vec![add("a", ReviewSource::Peer, 1.0, 0)])
        .unwrap();
    sim.run_scenario(&ctx, &id).unwrap();
    sim.delete_scenario(&ctx, &id).unwrap();
    assert_eq!(sim.scenario(&ctx, &id).unwrap_err().code(), "TSIM-4001");
    assert!(sim.list_scenarios(&ctx).unwrap().is_empty());
}

// ──────────────────── failures, deltas, extensions ────────────────────

#[test]
fn structural_failure_is_a_state_not_an_error() {
    let sim = sim();
    let ctx = sandbox("fail");
    let id = sim
        .create_scenario(
            &ctx,
            ScenarioMeta::named("dangling weight"),
            vec![
                add("a", ReviewSource::Peer, 1.0, 0),
                Event::set_weight("ghost", 0.5, t(1)),
            ],
        )
        .unwrap();
    let summary = sim.run_scenario(&ctx, &id).unwrap();
    assert_eq!(summary.status, ScenarioState::Failed);
    assert_eq!(summary.snapshot_count, 1);
    assert_eq!(summary.failure.unwrap().event_index, 1);
    assert_eq!(sim.replay_scenario(&ctx, &id).unwrap().len(), 1);
}

#[test]
fn legacy_delta_imports_and_runs() {
    let sim = sim();
    let ctx = sandbox("legacy");
    let raw = json!({
        "title": "imported",
        "changes": [
            {"op": "add", "review": {"reviewId": "r1", "from": "employer", "score": 0.8},
             "createdAt": 1_767_225_600_000_i64},
            {"action": "set-weight", "id": "r1", "weight": 0.2},
            {"type": "delete", "id": "r1", "time": "2026-01-01T00:10:00Z"}
        ]
    });
    let id = sim.import_delta(&ctx, &raw).unwrap();
    let scenario = sim.scenario(&ctx, &id).unwrap();
    assert_eq!(scenario.meta.name, "imported");
    assert_eq!(scenario.events.len(), 3);
    assert_eq!(scenario.events[1].at(), scenario.events[0].at());

    let summary = sim.run_scenario(&ctx, &id).unwrap();
    assert_eq!(summary.status, ScenarioState::Completed);

    let bad = json!([{"kind": "teleport", "id": "x"}]);
    assert_eq!(sim.import_delta(&ctx, &bad).unwrap_err().code(), "TSIM-2002");
}

/// Removes every review from the source named in the payload.
struct PurgeSource;

impl EventExtension for PurgeSource {
    fn apply(
        &self,
        set: &mut ReviewSet,
        payload: &serde_json::Value,
        _at: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let source = payload["source"]
            .as_str()
            .ok_or_else(|| "payload.source missing".to_string())?;
        let source = ReviewSource::parse(source).map_err(|e| e.to_string())?;
        let doomed: Vec<String> = set
            .to_vec()
            .into_iter()
            .filter(|r| r.source == source)
            .map(|r| r.id)
            .collect();
        for id in doomed {
            set.remove(&id).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

#[test]
fn registered_extension_participates_in_run_and_replay() {
    let mut extensions = ExtensionRegistry::new();
    extensions.register("purge_source", Arc::new(PurgeSource));
    let sim = Simulator::with_parts(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Box::new(MemoryAuditSink::new()),
        extensions,
    )
    .unwrap();
    let ctx = sandbox("ext");
    let id = sim
        .create_scenario(
            &ctx,
            ScenarioMeta::named("purge"),
            vec![
                add("a", ReviewSource::Peer, 1.0, 0),
                add("b", ReviewSource::System, 1.0, 1),
                Event::Extension {
                    name: "purge_source".to_string(),
                    payload: json!({"source": "peer"}),
                    at: t(2),
                },
                Event::Extension {
                    name: "unregistered".to_string(),
                    payload: json!({}),
                    at: t(3),
                },
            ],
        )
        .unwrap();
    let summary = sim.run_scenario(&ctx, &id).unwrap();
    assert_eq!(summary.status, ScenarioState::Failed);
    assert_eq!(summary.snapshot_count, 3);
    let snaps = sim.snapshots(&ctx, &id).unwrap();
    assert_eq!(snaps[2].review_ids(), vec!["b"]);
    assert_eq!(snaps[2].metrics.network_strength, 1);
    assert!(sim.verify_replay(&ctx, &id).unwrap().is_identical());
}

struct NeverAboveFifty;

impl Invariant for NeverAboveFifty {
    fn name(&self) -> &str {
        "never_above_fifty"
    }

    fn check(&self, input: &InvariantInput<'_>) -> Vec<Violation> {
        input
            .snapshots
            .iter()
            .filter(|s| s.metrics.trust_score > 50.0)
            .map(|s| Violation {
                invariant: self.name().to_string(),
                snapshot_index: Some(s.index),
                details: format!("trust {}", s.metrics.trust_score),
            })
            .collect()
    }
}

#[test]
fn added_invariant_flags_runs_without_touching_generator() {
    let sim = sim().with_invariant(Arc::new(NeverAboveFifty));
    let ctx = sandbox("strict");
    let bounds = FuzzBounds {
        min_events: 10,
        max_events: 10,
        allowed_kinds: vec![EventKind::AddReview],
        weight_min: 1.0,
        weight_max: 1.0,
        ..FuzzBounds::default()
    };
    let report = sim
        .run_fuzz(
            &ctx,
            &FuzzRequest::new(3).with_bounds(bounds).with_seed(11),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(report.passed(), 0);
    for run in &report.runs {
        assert!(run.violated_invariants.contains("never_above_fifty"));
        assert_eq!(run.violated_invariants.len(), 1);
    }
}

// ──────────────────── CLI smoke tests ────────────────────

#[test]
fn cli_config_validate_reports_hash() {
    let env = common::CliEnv::production();
    let out = env.run("config_validate", &["config", "validate", "--json"]);
    assert!(out.status.success(), "{}", out.stderr);
    let json = out.json();
    assert_eq!(json["valid"], true);
    assert_eq!(json["hash"].as_str().map(str::len), Some(16));
}

#[test]
fn cli_score_reads_reviews() {
    let env = common::CliEnv::production();
    let file = env.write(
        "reviews.json",
        r#"[{"id":"a","source":"peer","weight":1.0,"timestamp":"2026-01-01T00:00:00Z"},
            {"id":"b","source":"employer","weight":0.5,"timestamp":"2026-01-01T00:00:00Z"}]"#,
    );
    let out = env.run("score", &["score", file.to_str().unwrap(), "--json", "--explain"]);
    assert!(out.status.success(), "{}", out.stderr);
    let json = out.json();
    assert_eq!(json["metrics"]["network_strength"], 2);
    assert!(json["breakdown"]["trust_score"].as_f64().unwrap() > 0.0);
}

#[test]
fn cli_scenario_lifecycle() {
    let env = common::CliEnv::sandbox("cli");
    let file = env.write(
        "scenario.json",
        r#"{"name":"cli scenario","events":[
            {"kind":"add_review","review":{"id":"a","source":"peer","weight":1.0,
             "timestamp":"2026-01-01T00:00:00Z"},"at":"2026-01-01T00:00:00Z"},
            {"kind":"remove_review","review_id":"a","at":"2026-01-01T00:01:00Z"}]}"#,
    );
    let created = env.run("scenario_create", &["scenario", "create", file.to_str().unwrap(), "--json"]);
    assert!(created.status.success(), "{}", created.stderr);
    let id = created.json()["id"].as_str().unwrap().to_string();

    let ran = env.run("scenario_run", &["scenario", "run", &id, "--json"]);
    assert!(ran.status.success(), "{}", ran.stderr);
    assert_eq!(ran.json()["result"]["status"], "completed");
    assert_eq!(ran.json()["result"]["snapshot_count"], 2);

    let verified = env.run("scenario_verify", &["scenario", "replay", &id, "--verify", "--json"]);
    assert!(verified.status.success(), "{}", verified.stderr);

    let listed = env.run("scenario_list", &["scenario", "list", "--json"]);
    assert_eq!(listed.json()["scenarios"].as_array().map(Vec::len), Some(1));

    let other = common::CliEnv::sharing_with(&env, "sandbox", Some("someone-else"));
    let denied = other.run("scenario_show_denied", &["scenario", "show", &id, "--json"]);
    assert_eq!(denied.status.code(), Some(1));
    assert!(denied.stderr.contains("cross_environment"), "{}", denied.stderr);

    let deleted = env.run("scenario_delete", &["scenario", "delete", &id, "--json"]);
    assert!(deleted.status.success(), "{}", deleted.stderr);
    let missing = env.run("scenario_show_missing", &["scenario", "show", &id]);
    assert_eq!(missing.status.code(), Some(1));

    assert!(common::count_audit_actions(&env.audit_path(), "scenario_deleted") == 1);
}

#[test]
fn cli_fuzz_requires_sandbox() {
    let prod = common::CliEnv::production();
    let out = prod.run("fuzz_prod", &["fuzz", "run", "--count", "2", "--json"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stderr.contains("fuzz_requires_sandbox"), "{}", out.stderr);

    let sb = common::CliEnv::sandbox("fuzzers");
    let out = sb.run(
        "fuzz_sandbox",
        &["fuzz", "run", "--count", "20", "--max-events", "6", "--seed", "5", "--json"],
    );
    assert!(out.status.success(), "{}", out.stderr);
    assert_eq!(out.json()["passed"], 20);

    let listed = sb.run("fuzz_list", &["fuzz", "list", "--limit", "1000", "--json"]);
    assert!(listed.status.success(), "{}", listed.stderr);
    assert_eq!(listed.json()["count"], 20);
}
