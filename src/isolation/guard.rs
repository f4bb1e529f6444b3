//! Environment-scoped access control between sandbox and production state.
//!
//! Every engine and harness operation builds an [`Operation`] describing what
//! it is about to do and which resource scope it touches, then asks
//! [`authorize`] for a [`Decision`]. Denials are values, never panics or
//! silent no-ops, so callers can tell "denied" apart from "empty result".
//!
//! Rules:
//! - a sandbox context may only touch resources tagged with its own sandbox id
//! - a production context may only touch untagged (production) resources
//! - fuzz operations require a sandbox context, with no override

#![allow(missing_docs)]

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TsimError};
use crate::isolation::context::EnvironmentContext;

const SANDBOX_ID_PATTERN: &str = "^[a-z0-9][a-z0-9_-]{0,62}$";

fn sandbox_id_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(SANDBOX_ID_PATTERN).expect("sandbox id pattern compiles"))
}

// ──────────────────── scope ────────────────────

/// Validated sandbox identifier (lowercase, `[a-z0-9_-]`, at most 63 chars).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SandboxId(String);

impl SandboxId {
    pub fn parse(raw: &str) -> Result<Self> {
        if sandbox_id_regex().is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(TsimError::validation(
                "sandbox_id",
                format!("{raw:?} does not match {SANDBOX_ID_PATTERN}"),
            ))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SandboxId {
    type Error = TsimError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SandboxId> for String {
    fn from(value: SandboxId) -> Self {
        value.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Environment tag carried by every scenario, snapshot timeline, and fuzz run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "sandbox_id")]
pub enum Scope {
    /// Explicit production marker: the resource carries no sandbox tag.
    Production,
    Sandbox(SandboxId),
}

impl Scope {
    /// Build a scope from an optional sandbox tag (`None` means production).
    #[must_use]
    pub fn from_sandbox_id(sandbox_id: Option<SandboxId>) -> Self {
        sandbox_id.map_or(Self::Production, Self::Sandbox)
    }

    #[must_use]
    pub fn sandbox_id(&self) -> Option<&SandboxId> {
        match self {
            Self::Production => None,
            Self::Sandbox(id) => Some(id),
        }
    }

    #[must_use]
    pub const fn is_sandbox(&self) -> bool {
        matches!(self, Self::Sandbox(_))
    }

    /// Test helper that panics on malformed ids.
    #[cfg(test)]
    pub(crate) fn sandbox_unchecked(raw: &str) -> Self {
        Self::Sandbox(SandboxId::parse(raw).expect("valid sandbox id"))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => f.write_str("production"),
            Self::Sandbox(id) => write!(f, "sandbox:{id}"),
        }
    }
}

// ──────────────────── operations ────────────────────

/// Every guarded operation the engine and fuzz harness expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateScenario,
    RunScenario,
    ReplayScenario,
    ReadScenario,
    ListScenarios,
    DeleteScenario,
    RunFuzzBatch,
    ListFuzzRuns,
    ReadFuzzRun,
}

impl OperationKind {
    /// Fuzz operations are sandbox-only, unconditionally.
    #[must_use]
    pub const fn is_fuzz(self) -> bool {
        matches!(self, Self::RunFuzzBatch | Self::ListFuzzRuns | Self::ReadFuzzRun)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateScenario => "create_scenario",
            Self::RunScenario => "run_scenario",
            Self::ReplayScenario => "replay_scenario",
            Self::ReadScenario => "read_scenario",
            Self::ListScenarios => "list_scenarios",
            Self::DeleteScenario => "delete_scenario",
            Self::RunFuzzBatch => "run_fuzz_batch",
            Self::ListFuzzRuns => "list_fuzz_runs",
            Self::ReadFuzzRun => "read_fuzz_run",
        }
    }
}

/// An operation about to execute, optionally against an existing resource.
///
/// `resource` is `None` for operations that create new resources (they are
/// tagged with the caller's scope) or that list within the caller's scope.
#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    pub kind: OperationKind,
    pub resource: Option<&'a Scope>,
}

impl<'a> Operation<'a> {
    #[must_use]
    pub const fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            resource: None,
        }
    }

    #[must_use]
    pub const fn on(kind: OperationKind, resource: &'a Scope) -> Self {
        Self {
            kind,
            resource: Some(resource),
        }
    }
}

// ──────────────────── decisions ────────────────────

/// Why the guard refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum DenialReason {
    /// The resource belongs to a different environment than the caller.
    CrossEnvironment { caller: Scope, resource: Scope },
    /// Fuzzing was attempted from a production context.
    FuzzRequiresSandbox,
}

impl DenialReason {
    /// Stable reason code surfaced to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CrossEnvironment { .. } => "cross_environment",
            Self::FuzzRequiresSandbox => "fuzz_requires_sandbox",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrossEnvironment { caller, resource } => {
                write!(f, "{caller} context cannot access {resource} resource")
            }
            Self::FuzzRequiresSandbox => {
                f.write_str("fuzz operations are only permitted in sandbox contexts")
            }
        }
    }
}

/// Terminal result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenialReason),
}

impl Decision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Convert into the crate error type for `?` propagation.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(reason) => Err(TsimError::IsolationDenied { reason }),
        }
    }
}

/// Decide whether `context` may perform `operation`.
///
/// Pure and side-effect free; safe to call from any number of threads.
#[must_use]
pub fn authorize(context: &EnvironmentContext, operation: Operation<'_>) -> Decision {
    let caller = context.scope();

    if operation.kind.is_fuzz() && !caller.is_sandbox() {
        return Decision::Denied(DenialReason::FuzzRequiresSandbox);
    }

    match operation.resource {
        Some(resource) if *resource != caller => Decision::Denied(DenialReason::CrossEnvironment {
            caller,
            resource: resource.clone(),
        }),
        _ => Decision::Allowed,
    }
}

/// [`authorize`] followed by conversion into `Result`.
pub fn enforce(context: &EnvironmentContext, operation: Operation<'_>) -> Result<()> {
    authorize(context, operation).into_result()
}
