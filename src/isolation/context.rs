//! Per-call environment context and its resolution from the session layer.
//!
//! The context is always an explicit value passed into every engine call; there
//! is no process-wide "current environment".

#![allow(missing_docs)]

use std::env;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TsimError};
use crate::isolation::guard::{SandboxId, Scope};

/// Execution mode of the calling request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    Sandbox,
    Production,
}

impl EnvMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "production" | "prod" => Ok(Self::Production),
            other => Err(TsimError::validation(
                "mode",
                format!("unknown environment mode {other:?}"),
            )),
        }
    }
}

/// Resolved environment of one request. `sandbox_id` is present iff
/// `mode == Sandbox`; the constructors make any other shape unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawContext")]
pub struct EnvironmentContext {
    actor_id: String,
    mode: EnvMode,
    sandbox_id: Option<SandboxId>,
}

#[derive(Deserialize)]
struct RawContext {
    actor_id: String,
    mode: EnvMode,
    #[serde(default)]
    sandbox_id: Option<String>,
}

impl TryFrom<RawContext> for EnvironmentContext {
    type Error = TsimError;

    fn try_from(raw: RawContext) -> Result<Self> {
        Self::new(raw.actor_id, raw.mode, raw.sandbox_id.as_deref())
    }
}

impl EnvironmentContext {
    /// Build and validate a context from its loose parts.
    pub fn new(
        actor_id: impl Into<String>,
        mode: EnvMode,
        sandbox_id: Option<&str>,
    ) -> Result<Self> {
        let actor_id = actor_id.into();
        if actor_id.trim().is_empty() {
            return Err(TsimError::validation("actor_id", "must not be empty"));
        }
        match (mode, sandbox_id) {
            (EnvMode::Sandbox, Some(raw)) => Ok(Self::sandbox(actor_id, SandboxId::parse(raw)?)),
            (EnvMode::Sandbox, None) => Err(TsimError::validation(
                "sandbox_id",
                "sandbox mode requires a sandbox id",
            )),
            (EnvMode::Production, None) => Ok(Self::production(actor_id)),
            (EnvMode::Production, Some(_)) => Err(TsimError::validation(
                "sandbox_id",
                "production mode must not carry a sandbox id",
            )),
        }
    }

    #[must_use]
    pub fn production(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            mode: EnvMode::Production,
            sandbox_id: None,
        }
    }

    #[must_use]
    pub fn sandbox(actor_id: impl Into<String>, sandbox_id: SandboxId) -> Self {
        Self {
            actor_id: actor_id.into(),
            mode: EnvMode::Sandbox,
            sandbox_id: Some(sandbox_id),
        }
    }

    #[must_use]
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    #[must_use]
    pub const fn mode(&self) -> EnvMode {
        self.mode
    }

    #[must_use]
    pub fn sandbox_id(&self) -> Option<&SandboxId> {
        self.sandbox_id.as_ref()
    }

    /// Scope that resources created by this context are tagged with.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope::from_sandbox_id(self.sandbox_id.clone())
    }
}

// ──────────────────── resolution ────────────────────

/// Source of the per-request environment, owned by the session subsystem.
pub trait EnvironmentResolver: Send + Sync {
    fn resolve(&self) -> Result<EnvironmentContext>;
}

/// Resolver that always returns the same context.
#[derive(Debug, Clone)]
pub struct FixedEnvironment(pub EnvironmentContext);

impl EnvironmentResolver for FixedEnvironment {
    fn resolve(&self) -> Result<EnvironmentContext> {
        Ok(self.0.clone())
    }
}

/// Resolver reading `TSIM_MODE`, `TSIM_SANDBOX_ID`, and `TSIM_ACTOR`.
///
/// `TSIM_MODE` defaults to `production` when unset, so a missing variable can
/// never silently grant sandbox (fuzz) privileges.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvVarEnvironment;

impl EnvironmentResolver for EnvVarEnvironment {
    fn resolve(&self) -> Result<EnvironmentContext> {
        resolve_from(|name| env::var(name).ok().filter(|raw| !raw.trim().is_empty()))
    }
}

/// Resolve a context from an arbitrary variable lookup.
pub fn resolve_from<F>(mut lookup: F) -> Result<EnvironmentContext>
where
    F: FnMut(&str) -> Option<String>,
{
    let mode = lookup("TSIM_MODE")
        .map(|raw| EnvMode::parse(&raw))
        .transpose()?
        .unwrap_or(EnvMode::Production);
    let actor = lookup("TSIM_ACTOR")
        .or_else(|| lookup("USER"))
        .unwrap_or_else(|| "cli".to_string());
    let sandbox_id = lookup("TSIM_SANDBOX_ID");
    EnvironmentContext::new(actor, mode, sandbox_id.as_deref())
}
