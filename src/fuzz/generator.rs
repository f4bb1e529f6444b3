//! Seeded event generation within configurable bounds.
//!
//! All randomness is resolved here: every generated event carries concrete
//! ids, weights, and instants, so the scenario engine never needs an RNG. The
//! same `(seed, bounds)` always yields the same event list.

#![allow(missing_docs)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TsimError};
use crate::scenario::event::{Event, EventKind};
use crate::signal::model::{Review, ReviewSource};

/// Instant of the first generated event (2024-01-01T00:00:00Z).
const FUZZ_EPOCH_SECS: i64 = 1_704_067_200;

/// Latest instant the generator may reach: 9999-12-31T23:59:59Z, the last
/// second with a four-digit RFC 3339 year.
const MAX_INSTANT_SECS: i64 = 253_402_300_799;

/// Generated weights are quantized to this many steps per unit.
const WEIGHT_QUANTUM: f64 = 10_000.0;

/// Limits on what the generator may produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzBounds {
    pub min_events: usize,
    pub max_events: usize,
    pub allowed_kinds: Vec<EventKind>,
    pub allowed_sources: Vec<ReviewSource>,
    pub weight_min: f64,
    pub weight_max: f64,
    /// Upper bound on the gap between consecutive event instants.
    pub step_seconds: u32,
    /// Draws from `allowed_kinds` per event before falling back to the kinds
    /// that can apply to the current review set.
    pub max_attempts_per_event: u32,
}

impl Default for FuzzBounds {
    fn default() -> Self {
        Self {
            min_events: 1,
            max_events: 10,
            allowed_kinds: vec![
                EventKind::AddReview,
                EventKind::RemoveReview,
                EventKind::SetWeight,
            ],
            allowed_sources: ReviewSource::ALL.to_vec(),
            weight_min: 0.0,
            weight_max: 1.0,
            step_seconds: 3_600,
            max_attempts_per_event: 8,
        }
    }
}

impl FuzzBounds {
    /// Defaults with a different event ceiling (`min_events` follows if needed).
    #[must_use]
    pub fn with_max_events(max_events: usize) -> Self {
        let mut bounds = Self::default();
        bounds.max_events = max_events;
        bounds.min_events = bounds.min_events.min(max_events);
        bounds
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(TsimError::validation("bounds.max_events", "must be >= 1"));
        }
        if self.min_events > self.max_events {
            return Err(TsimError::validation(
                "bounds.min_events",
                format!("{} exceeds max_events {}", self.min_events, self.max_events),
            ));
        }
        if self.allowed_kinds.is_empty() {
            return Err(TsimError::validation("bounds.allowed_kinds", "must not be empty"));
        }
        if self.allowed_kinds.contains(&EventKind::Extension) {
            return Err(TsimError::validation(
                "bounds.allowed_kinds",
                "extension events cannot be generated",
            ));
        }
        if self.allowed_sources.is_empty() {
            return Err(TsimError::validation("bounds.allowed_sources", "must not be empty"));
        }
        if !self.weight_min.is_finite()
            || !self.weight_max.is_finite()
            || self.weight_min < 0.0
            || self.weight_min > self.weight_max
        {
            return Err(TsimError::validation(
                "bounds.weight_min",
                format!(
                    "weight range [{}, {}] must be finite, non-negative, and ordered",
                    self.weight_min, self.weight_max
                ),
            ));
        }
        if self.max_attempts_per_event == 0 {
            return Err(TsimError::validation(
                "bounds.max_attempts_per_event",
                "must be >= 1",
            ));
        }
        let span = i64::try_from(self.max_events)
            .ok()
            .and_then(|n| n.checked_mul(i64::from(self.step_seconds)));
        if span.is_none_or(|secs| secs > MAX_INSTANT_SECS - FUZZ_EPOCH_SECS) {
            return Err(TsimError::validation(
                "bounds.step_seconds",
                format!(
                    "{} events {}s apart run past 9999-12-31",
                    self.max_events, self.step_seconds
                ),
            ));
        }
        Ok(())
    }
}

/// Deterministic generator for one set of bounds.
#[derive(Debug, Clone)]
pub struct EventGenerator {
    bounds: FuzzBounds,
}

impl EventGenerator {
    pub fn new(bounds: FuzzBounds) -> Result<Self> {
        bounds.validate()?;
        Ok(Self { bounds })
    }

    #[must_use]
    pub const fn bounds(&self) -> &FuzzBounds {
        &self.bounds
    }

    /// Produce a valid event list for `seed`.
    ///
    /// Draws that cannot apply (removing from an empty set) are retried up to
    /// `max_attempts_per_event` times, then the draw is restricted to kinds
    /// that can apply. Exhaustion is reported only when no allowed kind can
    /// apply at all, never as an invalid event.
    pub fn generate(&self, seed: u64) -> Result<Vec<Event>> {
        let b = &self.bounds;
        let mut rng = StdRng::seed_from_u64(seed);
        let count = rng.random_range(b.min_events..=b.max_events);

        let mut events = Vec::with_capacity(count);
        let mut live: Vec<String> = Vec::new();
        let mut next_review = 0_u32;
        let mut at = epoch();

        for position in 0..count {
            let gap = Duration::seconds(i64::from(rng.random_range(0..=b.step_seconds)));
            at = at
                .checked_add_signed(gap)
                .ok_or_else(|| exhausted(seed, position, "instant out of range"))?;
            let event = self.draw(&mut rng, &mut live, &mut next_review, at, seed, position)?;
            events.push(event);
        }
        Ok(events)
    }

    fn draw(
        &self,
        rng: &mut StdRng,
        live: &mut Vec<String>,
        next_review: &mut u32,
        at: DateTime<Utc>,
        seed: u64,
        position: usize,
    ) -> Result<Event> {
        let b = &self.bounds;
        let no_kind = || exhausted(seed, position, "no allowed event kind applies");

        let mut chosen = None;
        for _ in 0..b.max_attempts_per_event {
            let kind = *b.allowed_kinds.choose(rng).ok_or_else(no_kind)?;
            if applies(kind, live) {
                chosen = Some(kind);
                break;
            }
        }
        let kind = match chosen {
            Some(kind) => kind,
            None => {
                let applicable: Vec<EventKind> = b
                    .allowed_kinds
                    .iter()
                    .copied()
                    .filter(|kind| applies(*kind, live))
                    .collect();
                *applicable.choose(rng).ok_or_else(no_kind)?
            }
        };

        match kind {
            EventKind::AddReview => {
                let id = format!("fz{seed:016x}-{:04}", *next_review);
                *next_review += 1;
                let source = *b.allowed_sources.choose(rng).ok_or_else(no_kind)?;
                let weight = self.weight(rng);
                let lag = Duration::seconds(i64::from(rng.random_range(0..=b.step_seconds)));
                let written = at
                    .checked_sub_signed(lag)
                    .ok_or_else(|| exhausted(seed, position, "review instant out of range"))?;
                live.push(id.clone());
                Ok(Event::add(Review::new(id, source, weight, written), at))
            }
            EventKind::RemoveReview => {
                let idx = rng.random_range(0..live.len());
                Ok(Event::remove(live.swap_remove(idx), at))
            }
            EventKind::SetWeight => {
                let id = live[rng.random_range(0..live.len())].clone();
                Ok(Event::set_weight(id, self.weight(rng), at))
            }
            EventKind::Extension => Err(no_kind()),
        }
    }

    fn weight(&self, rng: &mut StdRng) -> f64 {
        let (lo, hi) = (self.bounds.weight_min, self.bounds.weight_max);
        let raw = rng.random_range(lo..=hi);
        ((raw * WEIGHT_QUANTUM).round() / WEIGHT_QUANTUM).clamp(lo, hi)
    }
}

/// Regenerate the exact event list a fuzz run used.
pub fn reproduce(seed: u64, bounds: &FuzzBounds) -> Result<Vec<Event>> {
    EventGenerator::new(bounds.clone())?.generate(seed)
}

/// Per-iteration seed from a batch seed (SplitMix64 over `batch ^ index`).
#[must_use]
pub const fn derive_seed(batch_seed: u64, index: u64) -> u64 {
    let mut z = batch_seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Whether `kind` can apply to a review set holding `live`.
const fn applies(kind: EventKind, live: &[String]) -> bool {
    match kind {
        EventKind::AddReview => true,
        EventKind::RemoveReview | EventKind::SetWeight => !live.is_empty(),
        EventKind::Extension => false,
    }
}

fn exhausted(seed: u64, position: usize, why: &str) -> TsimError {
    TsimError::GeneratorExhausted {
        details: format!("seed {seed:#018x}: {why} at position {position}"),
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(FUZZ_EPOCH_SECS, 0)
        .single()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::event::{ExtensionRegistry, ReviewSet};

    #[test]
    fn same_seed_same_events() {
        let gen_ = EventGenerator::new(FuzzBounds::default()).unwrap();
        assert_eq!(gen_.generate(7).unwrap(), gen_.generate(7).unwrap());
        assert_eq!(gen_.generate(7).unwrap(), reproduce(7, &FuzzBounds::default()).unwrap());
    }

    #[test]
    fn generated_events_respect_bounds_and_apply_cleanly() {
        let bounds = FuzzBounds {
            min_events: 3,
            max_events: 25,
            weight_min: 0.2,
            weight_max: 0.7,
            ..FuzzBounds::default()
        };
        let gen_ = EventGenerator::new(bounds).unwrap();
        let ext = ExtensionRegistry::new();
        for seed in 0..200 {
            let events = gen_.generate(seed).unwrap();
            assert!((3..=25).contains(&events.len()));
            let mut set = ReviewSet::new();
            let mut last = None;
            for (i, event) in events.iter().enumerate() {
                event.validate(i).unwrap();
                if let Some(prev) = last {
                    assert!(event.at() >= prev);
                }
                last = Some(event.at());
                match event {
                    Event::AddReview { review, .. } => {
                        assert!((0.2..=0.7).contains(&review.weight));
                    }
                    Event::SetWeight { weight, .. } => assert!((0.2..=0.7).contains(weight)),
                    _ => {}
                }
                set.apply(event, &ext).unwrap();
            }
        }
    }

    #[test]
    fn default_bounds_never_exhaust() {
        let gen_ = EventGenerator::new(FuzzBounds::default()).unwrap();
        for seed in 0..10_000 {
            if let Err(e) = gen_.generate(seed) {
                panic!("seed {seed} failed: {e}");
            }
        }
    }

    #[test]
    fn single_attempt_still_finds_an_applicable_kind() {
        let bounds = FuzzBounds {
            min_events: 20,
            max_events: 20,
            allowed_kinds: vec![EventKind::RemoveReview, EventKind::SetWeight, EventKind::AddReview],
            max_attempts_per_event: 1,
            ..FuzzBounds::default()
        };
        let gen_ = EventGenerator::new(bounds).unwrap();
        for seed in 0..500 {
            let events = gen_.generate(seed).unwrap();
            assert_eq!(events.len(), 20);
            assert_eq!(events[0].kind(), EventKind::AddReview);
        }
    }

    #[test]
    fn step_past_year_9999_is_rejected() {
        let bounds = FuzzBounds {
            min_events: 5_000,
            max_events: 5_000,
            allowed_kinds: vec![EventKind::AddReview],
            step_seconds: u32::MAX,
            ..FuzzBounds::default()
        };
        let err = bounds.validate().unwrap_err();
        assert_eq!(err.code(), "TSIM-2001");
        assert!(EventGenerator::new(bounds).is_err());
    }

    #[test]
    fn widest_accepted_span_generates_without_overflow() {
        let max_events =
            usize::try_from((MAX_INSTANT_SECS - FUZZ_EPOCH_SECS) / i64::from(u32::MAX)).unwrap();
        let bounds = FuzzBounds {
            min_events: max_events,
            max_events,
            allowed_kinds: vec![EventKind::AddReview],
            step_seconds: u32::MAX,
            ..FuzzBounds::default()
        };
        let gen_ = EventGenerator::new(bounds.clone()).unwrap();
        for seed in 0..50 {
            let events = gen_.generate(seed).unwrap();
            assert_eq!(events.len(), max_events);
            assert!(events.iter().all(|e| e.at().timestamp() <= MAX_INSTANT_SECS));
        }
        assert!(
            FuzzBounds {
                max_events: max_events + 1,
                ..bounds
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn remove_only_bounds_exhaust() {
        let bounds = FuzzBounds {
            allowed_kinds: vec![EventKind::RemoveReview],
            ..FuzzBounds::default()
        };
        let err = EventGenerator::new(bounds).unwrap().generate(1).unwrap_err();
        assert_eq!(err.code(), "TSIM-5001");
    }

    #[test]
    fn invalid_bounds_rejected() {
        assert!(FuzzBounds { max_events: 0, min_events: 0, ..FuzzBounds::default() }
            .validate()
            .is_err());
        assert!(FuzzBounds { min_events: 5, max_events: 4, ..FuzzBounds::default() }
            .validate()
            .is_err());
        assert!(FuzzBounds { weight_min: 0.9, weight_max: 0.1, ..FuzzBounds::default() }
            .validate()
            .is_err());
        assert!(FuzzBounds { allowed_sources: vec![], ..FuzzBounds::default() }
            .validate()
            .is_err());
        assert!(FuzzBounds {
            allowed_kinds: vec![EventKind::Extension],
            ..FuzzBounds::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn derived_seeds_differ() {
        let seeds: std::collections::HashSet<u64> = (0..1_000).map(|i| derive_seed(99, i)).collect();
        assert_eq!(seeds.len(), 1_000);
        assert_eq!(derive_seed(99, 3), derive_seed(99, 3));
    }

    #[test]
    fn with_max_events_keeps_min_consistent() {
        let b = FuzzBounds::with_max_events(10);
        assert_eq!(b.max_events, 10);
        assert!(b.validate().is_ok());
    }
}
