//! Scenario, snapshot, and run-report records.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::Result;
use crate::core::ids::ScenarioId;
use crate::isolation::guard::Scope;
use crate::scenario::event::{ApplyError, Event};
use crate::signal::model::{Review, TrustMetrics};

/// How a scenario came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioOrigin {
    #[default]
    Manual,
    AiGenerated,
    Fuzz,
}

impl ScenarioOrigin {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AiGenerated => "ai_generated",
            Self::Fuzz => "fuzz",
        }
    }
}

/// Caller-supplied descriptive fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScenarioMeta {
    pub name: String,
    pub tags: Vec<String>,
    pub industry: Option<String>,
    pub origin: ScenarioOrigin,
    /// Per-scenario opt-in for an empty event list.
    pub allow_empty: bool,
}

impl ScenarioMeta {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_origin(mut self, origin: ScenarioOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// Lifecycle: `draft → running → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Draft,
    Running,
    Completed,
    Failed,
}

impl ScenarioState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub event_index: usize,
    pub error: ApplyError,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {}: {}", self.event_index, self.error)
    }
}

/// A named, ordered list of events plus its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub scope: Scope,
    pub meta: ScenarioMeta,
    pub created_at: DateTime<Utc>,
    pub events: Vec<Event>,
    pub state: ScenarioState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl Scenario {
    #[must_use]
    pub fn summary(&self) -> ScenarioSummary {
        ScenarioSummary {
            id: self.id.clone(),
            name: self.meta.name.clone(),
            origin: self.meta.origin,
            state: self.state,
            event_count: self.events.len(),
            created_at: self.created_at,
        }
    }
}

/// Listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub id: ScenarioId,
    pub name: String,
    pub origin: ScenarioOrigin,
    pub state: ScenarioState,
    pub event_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Immutable point on a scenario's timeline: the cumulative review set after
/// applying event `index`, and the metrics computed from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: usize,
    /// Sorted by review id.
    pub reviews: Vec<Review>,
    pub metrics: TrustMetrics,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// SHA-256 of the canonical JSON encoding, lowercase hex.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    #[must_use]
    pub fn review_ids(&self) -> Vec<&str> {
        self.reviews.iter().map(|r| r.id.as_str()).collect()
    }
}

/// Digest over a whole timeline: each snapshot digest, newline-joined.
pub fn timeline_digest(snapshots: &[Snapshot]) -> Result<String> {
    let mut hasher = Sha256::new();
    for snapshot in snapshots {
        hasher.update(snapshot.digest()?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Outcome of [`ScenarioEngine::run`](crate::scenario::engine::ScenarioEngine::run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: Scenario,
    pub snapshot_count: usize,
}

impl RunReport {
    #[must_use]
    pub const fn status(&self) -> ScenarioState {
        self.scenario.state
    }

    #[must_use]
    pub const fn failure(&self) -> Option<&RunFailure> {
        self.scenario.failure.as_ref()
    }
}

/// First point where a replay disagrees with the stored timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub index: usize,
    pub stored: Option<String>,
    pub replayed: Option<String>,
}

/// Result of comparing a replay against stored snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayVerification {
    pub scenario_id: ScenarioId,
    pub snapshots_compared: usize,
    pub timeline_digest: String,
    pub divergence: Option<Divergence>,
}

impl ReplayVerification {
    #[must_use]
    pub const fn is_identical(&self) -> bool {
        self.divergence.is_none()
    }
}
