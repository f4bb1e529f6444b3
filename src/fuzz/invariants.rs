//! Invariant predicates evaluated against a fuzzed scenario's timeline.
//!
//! Adding a property means adding an [`Invariant`]; the generator and harness
//! stay untouched.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::scenario::event::Event;
use crate::scenario::model::{RunFailure, Snapshot};
use crate::signal::calculator::TrustCalculator;
use crate::signal::model::ReviewSource;

/// Slack for floating-point comparisons between consecutive scores.
pub const SCORE_EPSILON: f64 = 1e-9;

/// Everything an invariant may inspect about one run.
#[derive(Debug, Clone, Copy)]
pub struct InvariantInput<'a> {
    pub events: &'a [Event],
    /// Snapshots as persisted by the run.
    pub snapshots: &'a [Snapshot],
    /// Snapshots from an independent replay of the same events.
    pub replayed: &'a [Snapshot],
    pub failure: Option<&'a RunFailure>,
    pub calculator: &'a TrustCalculator,
}

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_index: Option<usize>,
    pub details: String,
}

impl Violation {
    fn at(invariant: &str, index: usize, details: impl Into<String>) -> Self {
        Self {
            invariant: invariant.to_string(),
            snapshot_index: Some(index),
            details: details.into(),
        }
    }

    fn global(invariant: &str, details: impl Into<String>) -> Self {
        Self {
            invariant: invariant.to_string(),
            snapshot_index: None,
            details: details.into(),
        }
    }
}

/// A property that must hold at every snapshot of every run.
pub trait Invariant: Send + Sync {
    fn name(&self) -> &str;

    /// Empty when the property holds.
    fn check(&self, input: &InvariantInput<'_>) -> Vec<Violation>;
}

/// Run every invariant and collect all violations.
pub fn evaluate(invariants: &[Arc<dyn Invariant>], input: &InvariantInput<'_>) -> Vec<Violation> {
    invariants
        .iter()
        .flat_map(|inv| inv.check(input))
        .collect()
}

/// The built-in predicate set.
#[must_use]
pub fn default_invariants() -> Vec<Arc<dyn Invariant>> {
    vec![
        Arc::new(Boundedness),
        Arc::new(Monotonicity),
        Arc::new(ReplayDeterminism),
        Arc::new(AppendOnlyTimeline),
        Arc::new(NetworkStrengthConsistency),
        Arc::new(CompletesWithoutFailure),
    ]
}

// ──────────────────── built-ins ────────────────────

/// Scores stay finite and inside `[0, 100]`.
pub struct Boundedness;

impl Invariant for Boundedness {
    fn name(&self) -> &str {
        "boundedness"
    }

    fn check(&self, input: &InvariantInput<'_>) -> Vec<Violation> {
        let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        let max_sources = u32::try_from(ReviewSource::ALL.len()).unwrap_or(u32::MAX);
        input
            .snapshots
            .iter()
            .filter_map(|s| {
                let m = &s.metrics;
                if in_range(m.trust_score)
                    && in_range(m.confidence_score)
                    && m.network_strength <= max_sources
                {
                    None
                } else {
                    Some(Violation::at(
                        self.name(),
                        s.index,
                        format!(
                            "trust={} confidence={} network={}",
                            m.trust_score, m.confidence_score, m.network_strength
                        ),
                    ))
                }
            })
            .collect()
    }
}

/// Adds and weight raises never lower trust; removals and weight cuts never
/// raise it.
pub struct Monotonicity;

impl Invariant for Monotonicity {
    fn name(&self) -> &str {
        "monotonicity"
    }

    fn check(&self, input: &InvariantInput<'_>) -> Vec<Violation> {
        let mut out = Vec::new();
        for (i, snap) in input.snapshots.iter().enumerate() {
            let Some(event) = input.events.get(i) else {
                break;
            };
            let prev = i.checked_sub(1).and_then(|p| input.snapshots.get(p));
            let before = prev.map_or(0.0, |p| p.metrics.trust_score);
            let after = snap.metrics.trust_score;

            // +1: must not decrease; -1: must not increase; 0: unconstrained.
            let direction = match event {
                Event::AddReview { .. } => 1,
                Event::RemoveReview { .. } => -1,
                Event::SetWeight {
                    review_id, weight, ..
                } => {
                    let old = prev
                        .and_then(|p| p.reviews.iter().find(|r| &r.id == review_id))
                        .map(|r| r.weight);
                    match old {
                        Some(old) if *weight > old => 1,
                        Some(old) if *weight < old => -1,
                        _ => 0,
                    }
                }
                Event::Extension { .. } => 0,
            };
            let broken = match direction {
                1 => after < before - SCORE_EPSILON,
                -1 => after > before + SCORE_EPSILON,
                _ => false,
            };
            if broken {
                out.push(Violation::at(
                    self.name(),
                    snap.index,
                    format!("{} moved trust {before} -> {after}", event.kind()),
                ));
            }
        }
        out
    }
}

/// Stored metrics equal a fresh computation, and an independent replay
/// reproduces the stored timeline exactly.
pub struct ReplayDeterminism;

impl Invariant for ReplayDeterminism {
    fn name(&self) -> &str {
        "replay_determinism"
    }

    fn check(&self, input: &InvariantInput<'_>) -> Vec<Violation> {
        let mut out = Vec::new();
        for snap in input.snapshots {
            let recomputed = input.calculator.compute(&snap.reviews);
            if recomputed != snap.metrics {
                out.push(Violation::at(
                    self.name(),
                    snap.index,
                    format!("stored {:?} but recomputed {recomputed:?}", snap.metrics),
                ));
            }
        }
        if input.snapshots.len() != input.replayed.len() {
            out.push(Violation::global(
                self.name(),
                format!(
                    "stored {} snapshots, replay produced {}",
                    input.snapshots.len(),
                    input.replayed.len()
                ),
            ));
        }
        if let Some((stored, _)) = input
            .snapshots
            .iter()
            .zip(input.replayed)
            .find(|(stored, replayed)| stored != replayed)
        {
            out.push(Violation::at(
                self.name(),
                stored.index,
                "replayed snapshot differs from stored snapshot",
            ));
        }
        out
    }
}

/// Indices are contiguous, instants come from the events, and each review set
/// is the previous one plus or minus exactly what the event changed.
pub struct AppendOnlyTimeline;

impl Invariant for AppendOnlyTimeline {
    fn name(&self) -> &str {
        "append_only_timeline"
    }

    fn check(&self, input: &InvariantInput<'_>) -> Vec<Violation> {
        let mut out = Vec::new();
        let mut prev_ids: BTreeSet<&str> = BTreeSet::new();
        for (i, snap) in input.snapshots.iter().enumerate() {
            if snap.index != i {
                out.push(Violation::at(
                    self.name(),
                    snap.index,
                    format!("expected index {i}"),
                ));
            }
            let ids: BTreeSet<&str> = snap.reviews.iter().map(|r| r.id.as_str()).collect();
            if let Some(event) = input.events.get(i) {
                if snap.created_at != event.at() {
                    out.push(Violation::at(
                        self.name(),
                        snap.index,
                        "created_at differs from the event instant",
                    ));
                }
                let consistent = match event {
                    Event::AddReview { review, .. } => {
                        ids.len() == prev_ids.len() + 1
                            && prev_ids.is_subset(&ids)
                            && ids.contains(review.id.as_str())
                    }
                    Event::RemoveReview { review_id, .. } => {
                        ids.len() + 1 == prev_ids.len()
                            && ids.is_subset(&prev_ids)
                            && !ids.contains(review_id.as_str())
                    }
                    Event::SetWeight { .. } => ids == prev_ids,
                    Event::Extension { .. } => true,
                };
                if !consistent {
                    out.push(Violation::at(
                        self.name(),
                        snap.index,
                        format!("review set change does not match {}", event.kind()),
                    ));
                }
            }
            prev_ids = ids;
        }
        out
    }
}

/// `network_strength` equals the number of distinct sources present.
pub struct NetworkStrengthConsistency;

impl Invariant for NetworkStrengthConsistency {
    fn name(&self) -> &str {
        "network_strength_consistency"
    }

    fn check(&self, input: &InvariantInput<'_>) -> Vec<Violation> {
        input
            .snapshots
            .iter()
            .filter_map(|s| {
                let distinct: BTreeSet<ReviewSource> = s.reviews.iter().map(|r| r.source).collect();
                let expected = u32::try_from(distinct.len()).unwrap_or(u32::MAX);
                (s.metrics.network_strength != expected).then(|| {
                    Violation::at(
                        self.name(),
                        s.index,
                        format!(
                            "network_strength {} but {expected} distinct sources",
                            s.metrics.network_strength
                        ),
                    )
                })
            })
            .collect()
    }
}

/// Generated events are valid by construction, so any failure is a bug.
pub struct CompletesWithoutFailure;

impl Invariant for CompletesWithoutFailure {
    fn name(&self) -> &str {
        "completes_without_failure"
    }

    fn check(&self, input: &InvariantInput<'_>) -> Vec<Violation> {
        let mut out = Vec::new();
        if let Some(failure) = input.failure {
            out.push(Violation::at(
                self.name(),
                failure.event_index,
                failure.error.to_string(),
            ));
        } else if input.snapshots.len() != input.events.len() {
            out.push(Violation::global(
                self.name(),
                format!(
                    "{} events produced {} snapshots",
                    input.events.len(),
                    input.snapshots.len()
                ),
            ));
        }
        out
    }
}
