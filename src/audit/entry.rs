//! Audit entries: who did what to which resource, and when.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::isolation::context::EnvironmentContext;
use crate::isolation::guard::Scope;

/// Mutating operations that produce an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ScenarioCreated,
    ScenarioRun,
    ScenarioDeleted,
    FuzzBatch,
    /// Emitted by the recorder itself after channel back-pressure.
    EntriesDropped,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScenarioCreated => "scenario_created",
            Self::ScenarioRun => "scenario_run",
            Self::ScenarioDeleted => "scenario_deleted",
            Self::FuzzBatch => "fuzz_batch",
            Self::EntriesDropped => "entries_dropped",
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor_id: String,
    pub action: AuditAction,
    /// Identifier of the affected resource (scenario id, batch seed, ...).
    pub resource: String,
    pub scope: Scope,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry attributed to `context`'s actor and scope, stamped now.
    #[must_use]
    pub fn new(
        context: &EnvironmentContext,
        action: AuditAction,
        resource: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            actor_id: context.actor_id().to_string(),
            action,
            resource: resource.into(),
            scope: context.scope(),
            metadata,
            timestamp: Utc::now(),
        }
    }

    /// Recorder-generated entry reporting `count` dropped entries.
    #[must_use]
    pub fn dropped(count: u64) -> Self {
        Self {
            actor_id: "tsim-audit".to_string(),
            action: AuditAction::EntriesDropped,
            resource: "audit".to_string(),
            scope: Scope::Production,
            metadata: serde_json::json!({ "dropped": count }),
            timestamp: Utc::now(),
        }
    }

    /// RFC 3339 timestamp with millisecond precision.
    #[must_use]
    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}
