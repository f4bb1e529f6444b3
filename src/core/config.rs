//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TsimError};
use crate::fuzz::generator::FuzzBounds;

/// Hard ceiling on any fuzz-run listing, regardless of configuration.
pub const FUZZ_LIST_HARD_CEILING: usize = 100;

/// Full trustsim configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub calculator: CalculatorConfig,
    pub engine: EngineConfig,
    pub fuzz: FuzzConfig,
    pub audit: AuditConfig,
    pub paths: PathsConfig,
}

/// Trust score coefficients. None of these are load-bearing for correctness;
/// only monotonicity and boundedness are.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalculatorConfig {
    pub signal_weight: f64,
    pub confidence_weight: f64,
    pub review_bonus: f64,
    pub review_bonus_cap: f64,
    pub signal_saturation: f64,
    pub confidence_saturation: f64,
    pub peer_multiplier: f64,
    pub employer_multiplier: f64,
    pub system_multiplier: f64,
}

/// Scenario validation limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_events_per_scenario: usize,
    /// Accept scenarios with no events without an explicit per-scenario opt-in.
    pub allow_empty_scenarios: bool,
    pub max_tags: usize,
}

/// Fuzz harness worker pool and listing limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FuzzConfig {
    pub workers: usize,
    pub max_batch_size: usize,
    pub default_list_limit: usize,
    pub max_list_limit: usize,
    /// Bounds used when a caller does not supply its own.
    pub bounds: FuzzBounds,
}

/// Which backend receives audit entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditSinkKind {
    Jsonl,
    Sqlite,
}

/// Audit recorder channel and fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
    pub channel_capacity: usize,
    /// Where entries go when the primary sink fails (stderr when unset).
    pub fallback_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

/// Filesystem paths used by tsim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
    pub audit_jsonl: PathBuf,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            signal_weight: 0.5,
            confidence_weight: 0.3,
            review_bonus: 5.0,
            review_bonus_cap: 20.0,
            signal_saturation: 3.0,
            confidence_saturation: 5.0,
            peer_multiplier: 1.0,
            employer_multiplier: 1.5,
            system_multiplier: 0.5,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events_per_scenario: 10_000,
            allow_empty_scenarios: false,
            max_tags: 32,
        }
    }
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map_or(2, |n| n.get().saturating_div(2).max(1)),
            max_batch_size: 10_000,
            default_list_limit: 50,
            max_list_limit: FUZZ_LIST_HARD_CEILING,
            bounds: FuzzBounds::default(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::Jsonl,
            channel_capacity: 1024,
            fallback_path: None,
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[TSIM-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("tsim").join("config.toml");
        let data = home_dir.join(".local").join("share").join("tsim");
        Self {
            config_file: cfg,
            sqlite_db: data.join("simulations.sqlite3"),
            audit_jsonl: data.join("audit.jsonl"),
        }
    }
}

impl FuzzConfig {
    /// Resolve a caller-supplied listing limit: default when absent, clamped
    /// to the configured maximum and the hard ceiling. An explicit zero is
    /// rejected rather than widened.
    pub fn effective_list_limit(&self, requested: Option<usize>) -> Result<usize> {
        if requested == Some(0) {
            return Err(TsimError::validation("limit", "must be >= 1"));
        }
        let ceiling = self.max_list_limit.min(FUZZ_LIST_HARD_CEILING).max(1);
        Ok(requested
            .unwrap_or(self.default_list_limit)
            .clamp(1, ceiling))
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| TsimError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(TsimError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging/telemetry.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // calculator
        let calc = &mut self.calculator;
        for (name, slot) in [
            ("TSIM_CALCULATOR_SIGNAL_WEIGHT", &mut calc.signal_weight),
            ("TSIM_CALCULATOR_CONFIDENCE_WEIGHT", &mut calc.confidence_weight),
            ("TSIM_CALCULATOR_REVIEW_BONUS", &mut calc.review_bonus),
            ("TSIM_CALCULATOR_REVIEW_BONUS_CAP", &mut calc.review_bonus_cap),
            ("TSIM_CALCULATOR_SIGNAL_SATURATION", &mut calc.signal_saturation),
            (
                "TSIM_CALCULATOR_CONFIDENCE_SATURATION",
                &mut calc.confidence_saturation,
            ),
            ("TSIM_CALCULATOR_PEER_MULTIPLIER", &mut calc.peer_multiplier),
            (
                "TSIM_CALCULATOR_EMPLOYER_MULTIPLIER",
                &mut calc.employer_multiplier,
            ),
            ("TSIM_CALCULATOR_SYSTEM_MULTIPLIER", &mut calc.system_multiplier),
        ] {
            if let Some(raw) = lookup(name) {
                *slot = parse_env(name, &raw)?;
            }
        }

        // engine
        if let Some(raw) = lookup("TSIM_ENGINE_MAX_EVENTS_PER_SCENARIO") {
            self.engine.max_events_per_scenario =
                parse_env("TSIM_ENGINE_MAX_EVENTS_PER_SCENARIO", &raw)?;
        }
        if let Some(raw) = lookup("TSIM_ENGINE_ALLOW_EMPTY_SCENARIOS") {
            self.engine.allow_empty_scenarios =
                parse_env("TSIM_ENGINE_ALLOW_EMPTY_SCENARIOS", &raw)?;
        }

        // fuzz
        if let Some(raw) = lookup("TSIM_FUZZ_WORKERS") {
            self.fuzz.workers = parse_env("TSIM_FUZZ_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("TSIM_FUZZ_MAX_BATCH_SIZE") {
            self.fuzz.max_batch_size = parse_env("TSIM_FUZZ_MAX_BATCH_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("TSIM_FUZZ_DEFAULT_LIST_LIMIT") {
            self.fuzz.default_list_limit = parse_env("TSIM_FUZZ_DEFAULT_LIST_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("TSIM_FUZZ_MAX_EVENTS") {
            self.fuzz.bounds.max_events = parse_env("TSIM_FUZZ_MAX_EVENTS", &raw)?;
        }

        // audit
        if let Some(raw) = lookup("TSIM_AUDIT_SINK") {
            self.audit.sink = match raw.trim().to_ascii_lowercase().as_str() {
                "jsonl" => AuditSinkKind::Jsonl,
                "sqlite" => AuditSinkKind::Sqlite,
                other => {
                    return Err(TsimError::ConfigParse {
                        context: "env",
                        details: format!("TSIM_AUDIT_SINK={other:?}: expected jsonl or sqlite"),
                    });
                }
            };
        }
        if let Some(raw) = lookup("TSIM_AUDIT_CHANNEL_CAPACITY") {
            self.audit.channel_capacity = parse_env("TSIM_AUDIT_CHANNEL_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("TSIM_AUDIT_FALLBACK_PATH") {
            self.audit.fallback_path = Some(PathBuf::from(raw));
        }

        // paths
        if let Some(raw) = lookup("TSIM_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("TSIM_AUDIT_JSONL") {
            self.paths.audit_jsonl = PathBuf::from(raw);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let calc = &self.calculator;
        for (name, val) in [
            ("signal_weight", calc.signal_weight),
            ("confidence_weight", calc.confidence_weight),
            ("review_bonus", calc.review_bonus),
            ("review_bonus_cap", calc.review_bonus_cap),
            ("peer_multiplier", calc.peer_multiplier),
            ("employer_multiplier", calc.employer_multiplier),
            ("system_multiplier", calc.system_multiplier),
        ] {
            if !val.is_finite() || val < 0.0 {
                return Err(TsimError::InvalidConfig {
                    details: format!("calculator.{name} must be finite and >= 0.0, got {val}"),
                });
            }
        }
        for (name, val) in [
            ("signal_saturation", calc.signal_saturation),
            ("confidence_saturation", calc.confidence_saturation),
        ] {
            if !val.is_finite() || val <= 0.0 {
                return Err(TsimError::InvalidConfig {
                    details: format!("calculator.{name} must be finite and > 0.0, got {val}"),
                });
            }
        }

        if self.engine.max_events_per_scenario == 0 {
            return Err(TsimError::InvalidConfig {
                details: "engine.max_events_per_scenario must be >= 1".to_string(),
            });
        }

        if self.fuzz.workers == 0 {
            return Err(TsimError::InvalidConfig {
                details: "fuzz.workers must be >= 1".to_string(),
            });
        }
        if self.fuzz.max_batch_size == 0 {
            return Err(TsimError::InvalidConfig {
                details: "fuzz.max_batch_size must be >= 1".to_string(),
            });
        }
        if !(1..=FUZZ_LIST_HARD_CEILING).contains(&self.fuzz.max_list_limit) {
            return Err(TsimError::InvalidConfig {
                details: format!(
                    "fuzz.max_list_limit must be in [1, {FUZZ_LIST_HARD_CEILING}], got {}",
                    self.fuzz.max_list_limit
                ),
            });
        }
        if self.fuzz.default_list_limit == 0
            || self.fuzz.default_list_limit > self.fuzz.max_list_limit
        {
            return Err(TsimError::InvalidConfig {
                details: format!(
                    "fuzz.default_list_limit ({}) must be in [1, max_list_limit ({})]",
                    self.fuzz.default_list_limit, self.fuzz.max_list_limit
                ),
            });
        }
        self.fuzz.bounds.validate().map_err(|err| TsimError::InvalidConfig {
            details: format!("fuzz.bounds: {err}"),
        })?;
        if self.fuzz.bounds.max_events > self.engine.max_events_per_scenario {
            return Err(TsimError::InvalidConfig {
                details: "fuzz.bounds.max_events must be <= engine.max_events_per_scenario"
                    .to_string(),
            });
        }

        if self.audit.channel_capacity == 0 {
            return Err(TsimError::InvalidConfig {
                details: "audit.channel_capacity must be >= 1".to_string(),
            });
        }
        if self.audit.max_rotated_files == 0 {
            return Err(TsimError::InvalidConfig {
                details: "audit.max_rotated_files must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| TsimError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
