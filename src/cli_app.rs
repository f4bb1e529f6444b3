//! Top-level CLI definition and dispatch.

use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Args, Parser, Subcommand};
use colored::{Colorize, control};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use signal_hook::consts::SIGINT;
use thiserror::Error;

use trustsim::core::config::Config;
use trustsim::core::errors::TsimError;
use trustsim::core::ids::{FuzzRunId, ScenarioId};
use trustsim::fuzz::{CancelToken, FuzzBatchReport, FuzzRequest, FuzzRun};
use trustsim::isolation::context::{EnvVarEnvironment, EnvironmentContext, EnvironmentResolver};
use trustsim::isolation::guard::SandboxId;
use trustsim::scenario::event::Event;
use trustsim::scenario::model::{ScenarioMeta, ScenarioState, Snapshot};
use trustsim::signal::model::Review;
use trustsim::simulator::Simulator;

/// Trust simulation and fuzzing engine.
#[derive(Debug, Parser)]
#[command(
    name = "tsim",
    author,
    version,
    about = "Trust Simulation & Fuzzing Engine",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Score a review set read from a JSON file ("-" for stdin).
    Score(ScoreArgs),
    /// Create, run, replay, and inspect scenarios.
    Scenario(ScenarioArgs),
    /// Run fuzz batches and inspect fuzz runs (sandbox only).
    Fuzz(FuzzArgs),
    /// View and validate configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
struct ScoreArgs {
    /// JSON array of reviews.
    #[arg(value_name = "FILE")]
    file: PathBuf,
    /// Include every intermediate term.
    #[arg(long)]
    explain: bool,
}

#[derive(Debug, Clone, Args)]
struct ScenarioArgs {
    #[command(subcommand)]
    command: ScenarioCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum ScenarioCommand {
    /// Create a draft scenario from a JSON file with metadata and typed events.
    Create {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Create a scenario from a legacy delta blob.
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Run a draft scenario, persisting one snapshot per event.
    Run { id: String },
    /// Recompute a scenario's timeline from its events.
    Replay {
        id: String,
        /// Compare the replay against the stored timeline.
        #[arg(long)]
        verify: bool,
    },
    /// List scenarios in the current environment.
    List,
    /// Show a scenario and optionally its stored snapshots.
    Show {
        id: String,
        #[arg(long)]
        snapshots: bool,
    },
    /// Delete a scenario and its timeline.
    Delete { id: String },
}

#[derive(Debug, Clone, Args)]
struct FuzzArgs {
    #[command(subcommand)]
    command: FuzzCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum FuzzCommand {
    /// Generate, run, and check a batch of random scenarios.
    Run(FuzzRunArgs),
    /// List recent fuzz runs, newest first.
    List {
        /// Sandbox to list; must match the current environment.
        #[arg(long, value_name = "ID")]
        sandbox: Option<String>,
        /// Maximum runs to return (clamped to the configured ceiling).
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Show one fuzz run with its violations.
    Show { id: String },
    /// Print the exact event list a fuzz run executed.
    Reproduce { id: String },
}

#[derive(Debug, Clone, Args, Serialize)]
struct FuzzRunArgs {
    /// Iterations in the batch.
    #[arg(long, default_value_t = 100, value_name = "N")]
    count: usize,
    /// Upper bound on generated events per scenario.
    #[arg(long, value_name = "N")]
    max_events: Option<usize>,
    /// Batch seed for a reproducible batch.
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,
    /// Worker threads.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration and print its hash.
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or a refused operation.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Operation completed but reported failures (violated invariants).
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<TsimError> for CliError {
    fn from(err: TsimError) -> Self {
        match err {
            TsimError::Validation { .. }
            | TsimError::DeltaImport { .. }
            | TsimError::IsolationDenied { .. }
            | TsimError::NotFound { .. }
            | TsimError::RunInProgress { .. }
            | TsimError::InvalidState { .. }
            | TsimError::InvalidConfig { .. }
            | TsimError::MissingConfig { .. }
            | TsimError::ConfigParse { .. } => Self::User(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Scenario file accepted by `scenario create`.
#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(flatten)]
    meta: ScenarioMeta,
    #[serde(default)]
    events: Vec<Event>,
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Config(args) => run_config(cli, args),
        Command::Score(args) => {
            let config = Config::load(cli.config.as_deref())?;
            let sim = Simulator::in_memory(config)?;
            let result = run_score(cli, &sim, args);
            sim.shutdown();
            result
        }
        Command::Scenario(args) => with_simulator(cli, |sim, ctx| run_scenario(cli, sim, ctx, args)),
        Command::Fuzz(args) => with_simulator(cli, |sim, ctx| run_fuzz(cli, sim, ctx, args)),
    }
}

fn with_simulator<F>(cli: &Cli, body: F) -> Result<(), CliError>
where
    F: FnOnce(&Simulator, &EnvironmentContext) -> Result<(), CliError>,
{
    let config = Config::load(cli.config.as_deref())?;
    let ctx = EnvVarEnvironment.resolve()?;
    let sim = Simulator::open(config)?;
    let result = body(&sim, &ctx);
    let stats = sim.shutdown();
    if stats.dropped > 0 {
        eprintln!("[TSIM-AUDIT] {} audit entries dropped", stats.dropped);
    }
    result
}

// ──────────────────── score ────────────────────

fn run_score(cli: &Cli, sim: &Simulator, args: &ScoreArgs) -> Result<(), CliError> {
    let reviews: Vec<Review> = serde_json::from_str(&read_input(&args.file)?)
        .map_err(|e| CliError::User(format!("invalid reviews in {}: {e}", args.file.display())))?;
    for review in &reviews {
        review.validate()?;
    }
    let metrics = sim.score(&reviews);

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Trust score:      {:.2}", metrics.trust_score);
            println!("Confidence score: {:.2}", metrics.confidence_score);
            println!("Network strength: {}", metrics.network_strength);
            if args.explain {
                let b = sim.explain(&reviews);
                println!("  weighted signal: {:.4}", b.weighted_signal);
                println!("  signal score:    {:.4}", b.signal_score);
                println!("  review bonus:    {:.4}", b.review_bonus);
            }
        }
        OutputMode::Json => {
            let mut payload = json!({
                "command": "score",
                "reviews": reviews.len(),
                "metrics": metrics,
            });
            if args.explain {
                payload["breakdown"] = serde_json::to_value(sim.explain(&reviews))?;
            }
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── scenario ────────────────────

fn run_scenario(
    cli: &Cli,
    sim: &Simulator,
    ctx: &EnvironmentContext,
    args: &ScenarioArgs,
) -> Result<(), CliError> {
    let mode = output_mode(cli);
    match &args.command {
        ScenarioCommand::Create { file } => {
            let parsed: ScenarioFile = serde_json::from_str(&read_input(file)?)
                .map_err(|e| CliError::User(format!("invalid scenario in {}: {e}", file.display())))?;
            let id = sim.create_scenario(ctx, parsed.meta, parsed.events)?;
            emit_created(mode, "scenario create", &id)
        }
        ScenarioCommand::Import { file } => {
            let raw: Value = serde_json::from_str(&read_input(file)?)
                .map_err(|e| CliError::User(format!("invalid JSON in {}: {e}", file.display())))?;
            let id = sim.import_delta(ctx, &raw)?;
            emit_created(mode, "scenario import", &id)
        }
        ScenarioCommand::Run { id } => {
            let summary = sim.run_scenario(ctx, &ScenarioId::new(id.as_str()))?;
            match mode {
                OutputMode::Human => {
                    println!(
                        "{} {} ({} snapshots)",
                        summary.scenario_id,
                        paint_state(summary.status),
                        summary.snapshot_count
                    );
                    if let Some(failure) = &summary.failure {
                        println!("  failure at {failure}");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "scenario run",
                        "result": serde_json::to_value(&summary)?,
                    }))?;
                }
            }
            Ok(())
        }
        ScenarioCommand::Replay { id, verify } => {
            let id = ScenarioId::new(id.as_str());
            if *verify {
                let verification = sim.verify_replay(ctx, &id)?;
                match mode {
                    OutputMode::Human => {
                        if verification.is_identical() {
                            println!(
                                "{} replay matches {} stored snapshots",
                                "OK".green().bold(),
                                verification.snapshots_compared
                            );
                        } else if let Some(d) = &verification.divergence {
                            println!("{} replay diverges at snapshot {}", "DIVERGED".red().bold(), d.index);
                        }
                        println!("  timeline digest: {}", verification.timeline_digest);
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "scenario replay",
                            "verification": serde_json::to_value(&verification)?,
                        }))?;
                    }
                }
                return if verification.is_identical() {
                    Ok(())
                } else {
                    Err(CliError::Partial(format!("replay of {id} diverged")))
                };
            }
            let snapshots = sim.replay_scenario(ctx, &id)?;
            match mode {
                OutputMode::Human => print_snapshots(&snapshots),
                OutputMode::Json => write_json_line(&json!({
                    "command": "scenario replay",
                    "snapshots": serde_json::to_value(&snapshots)?,
                }))?,
            }
            Ok(())
        }
        ScenarioCommand::List => {
            let scenarios = sim.list_scenarios(ctx)?;
            match mode {
                OutputMode::Human => {
                    if scenarios.is_empty() {
                        println!("No scenarios in {}.", ctx.scope());
                    }
                    for s in &scenarios {
                        println!(
                            "{}  {:<10} {:>5} events  {}",
                            s.id,
                            paint_state(s.state),
                            s.event_count,
                            s.name
                        );
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "scenario list",
                    "scope": ctx.scope().to_string(),
                    "scenarios": serde_json::to_value(&scenarios)?,
                }))?,
            }
            Ok(())
        }
        ScenarioCommand::Show { id, snapshots } => {
            let id = ScenarioId::new(id.as_str());
            let scenario = sim.scenario(ctx, &id)?;
            let timeline = if *snapshots {
                Some(sim.snapshots(ctx, &id)?)
            } else {
                None
            };
            match mode {
                OutputMode::Human => {
                    println!("{}  {}", scenario.id, scenario.meta.name.bold());
                    println!("  state:   {}", paint_state(scenario.state));
                    println!("  origin:  {}", scenario.meta.origin.as_str());
                    println!("  events:  {}", scenario.events.len());
                    println!("  created: {}", scenario.created_at.to_rfc3339());
                    if let Some(failure) = &scenario.failure {
                        println!("  failure: {failure}");
                    }
                    if let Some(timeline) = &timeline {
                        print_snapshots(timeline);
                    }
                }
                OutputMode::Json => {
                    let mut payload = json!({
                        "command": "scenario show",
                        "scenario": serde_json::to_value(&scenario)?,
                    });
                    if let Some(timeline) = &timeline {
                        payload["snapshots"] = serde_json::to_value(timeline)?;
                    }
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        ScenarioCommand::Delete { id } => {
            let id = ScenarioId::new(id.as_str());
            sim.delete_scenario(ctx, &id)?;
            match mode {
                OutputMode::Human => println!("Deleted {id}."),
                OutputMode::Json => write_json_line(&json!({
                    "command": "scenario delete",
                    "id": id.as_str(),
                    "deleted": true,
                }))?,
            }
            Ok(())
        }
    }
}

fn emit_created(mode: OutputMode, command: &str, id: &ScenarioId) -> Result<(), CliError> {
    match mode {
        OutputMode::Human => println!("Created {id}"),
        OutputMode::Json => write_json_line(&json!({ "command": command, "id": id.as_str() }))?,
    }
    Ok(())
}

fn print_snapshots(snapshots: &[Snapshot]) {
    for s in snapshots {
        println!(
            "  #{:<4} trust {:>6.2}  confidence {:>6.2}  network {}  reviews {}",
            s.index,
            s.metrics.trust_score,
            s.metrics.confidence_score,
            s.metrics.network_strength,
            s.reviews.len()
        );
    }
}

fn paint_state(state: ScenarioState) -> colored::ColoredString {
    match state {
        ScenarioState::Completed => state.as_str().green(),
        ScenarioState::Failed => state.as_str().red(),
        ScenarioState::Running => state.as_str().yellow(),
        ScenarioState::Draft => state.as_str().normal(),
    }
}

// ──────────────────── fuzz ────────────────────

fn run_fuzz(
    cli: &Cli,
    sim: &Simulator,
    ctx: &EnvironmentContext,
    args: &FuzzArgs,
) -> Result<(), CliError> {
    let mode = output_mode(cli);
    match &args.command {
        FuzzCommand::Run(run_args) => {
            let mut bounds = sim.config().fuzz.bounds.clone();
            if let Some(max) = run_args.max_events {
                bounds.max_events = max;
                bounds.min_events = bounds.min_events.min(max);
            }
            let mut request = FuzzRequest::new(run_args.count).with_bounds(bounds);
            request.seed = run_args.seed;
            request.workers = run_args.workers;

            let cancel = cancel_on_sigint();
            let report = sim.run_fuzz(ctx, &request, &cancel)?;
            match mode {
                OutputMode::Human => print_batch(&report),
                OutputMode::Json => write_json_line(&json!({
                    "command": "fuzz run",
                    "batch_seed": report.batch_seed,
                    "requested": report.requested,
                    "passed": report.passed(),
                    "failed": report.failed_runs().count(),
                    "aborted": serde_json::to_value(&report.aborted)?,
                    "cancelled": report.cancelled,
                    "run_ids": serde_json::to_value(report.run_ids())?,
                }))?,
            }
            let failed = report.failed_runs().count();
            if failed > 0 || !report.aborted.is_empty() {
                return Err(CliError::Partial(format!(
                    "{failed} runs violated invariants, {} iterations aborted",
                    report.aborted.len()
                )));
            }
            Ok(())
        }
        FuzzCommand::List { sandbox, limit } => {
            let sandbox = sandbox.as_deref().map(SandboxId::parse).transpose()?;
            let runs = sim.list_fuzz_runs(ctx, sandbox.as_ref(), *limit)?;
            match mode {
                OutputMode::Human => {
                    if runs.is_empty() {
                        println!("No fuzz runs in {}.", ctx.scope());
                    }
                    for run in &runs {
                        print_run_line(run);
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "fuzz list",
                    "count": runs.len(),
                    "runs": serde_json::to_value(&runs)?,
                }))?,
            }
            Ok(())
        }
        FuzzCommand::Show { id } => {
            let run = sim.fuzz_run(ctx, &FuzzRunId::new(id.as_str()))?;
            match mode {
                OutputMode::Human => {
                    print_run_line(&run);
                    println!("  scenario: {}", run.scenario_id);
                    println!("  duration: {} ms", run.duration_ms());
                    for v in &run.violations {
                        let at = v
                            .snapshot_index
                            .map_or_else(String::new, |i| format!(" @ snapshot {i}"));
                        println!("  {} {}{at}: {}", "!".red(), v.invariant, v.details);
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "fuzz show",
                    "run": serde_json::to_value(&run)?,
                }))?,
            }
            Ok(())
        }
        FuzzCommand::Reproduce { id } => {
            let events = sim.reproduce(ctx, &FuzzRunId::new(id.as_str()))?;
            // Always JSON: the output is meant to be fed back to `scenario create`.
            let payload = json!({ "name": format!("reproduce {id}"), "events": events });
            match mode {
                OutputMode::Human => println!("{}", serde_json::to_string_pretty(&payload)?),
                OutputMode::Json => write_json_line(&payload)?,
            }
            Ok(())
        }
    }
}

fn cancel_on_sigint() -> CancelToken {
    let flag = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&flag)) {
        eprintln!("[TSIM-FUZZ] failed to register SIGINT: {e}");
    }
    CancelToken::from_flag(flag)
}

fn print_batch(report: &FuzzBatchReport) {
    let failed = report.failed_runs().count();
    let verdict = if failed == 0 && report.aborted.is_empty() {
        "PASS".green().bold()
    } else {
        "FAIL".red().bold()
    };
    println!(
        "{verdict} batch {:#018x}: {} passed, {failed} failed, {} aborted of {} requested",
        report.batch_seed,
        report.passed(),
        report.aborted.len(),
        report.requested
    );
    if report.cancelled {
        println!("  {}", "cancelled before completion".yellow());
    }
    for run in report.failed_runs() {
        print_run_line(run);
    }
    for aborted in &report.aborted {
        println!(
            "  aborted #{} seed {:#018x}: {}",
            aborted.index, aborted.seed, aborted.details
        );
    }
}

fn print_run_line(run: &FuzzRun) {
    let verdict = if run.passed {
        "pass".green()
    } else {
        "fail".red()
    };
    let violated: Vec<&str> = run.violated_invariants.iter().map(String::as_str).collect();
    println!(
        "{}  {verdict}  seed {:#018x}  {:>3} events  {}",
        run.id,
        run.seed,
        run.event_count,
        violated.join(",")
    );
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": false,
                            "code": e.code(),
                            "error": e.to_string(),
                        }))?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output helpers ────────────────────

fn read_input(path: &Path) -> Result<String, CliError> {
    if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    fs::read_to_string(path)
        .map_err(|e| CliError::User(format!("cannot read {}: {e}", path.display())))
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("TSIM_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
