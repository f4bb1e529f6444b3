//! Events: the atomic mutations a scenario applies to its review set.
//!
//! Each event fully determines the next review set from the previous one plus
//! itself. Application never reads the clock or a random source; the event's
//! own `at` instant becomes the resulting snapshot's `created_at`.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::errors::{Result, TsimError};
use crate::signal::model::{Review, validate_weight};

/// Discriminant of [`Event`], used by fuzz bounds and audit metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AddReview,
    RemoveReview,
    SetWeight,
    Extension,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AddReview => "add_review",
            Self::RemoveReview => "remove_review",
            Self::SetWeight => "set_weight",
            Self::Extension => "extension",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic mutation applied to a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    AddReview {
        review: Review,
        at: DateTime<Utc>,
    },
    RemoveReview {
        review_id: String,
        at: DateTime<Utc>,
    },
    SetWeight {
        review_id: String,
        weight: f64,
        at: DateTime<Utc>,
    },
    /// Extension point for event kinds handled by a registered
    /// [`EventExtension`].
    Extension {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
        at: DateTime<Utc>,
    },
}

impl Event {
    #[must_use]
    pub fn add(review: Review, at: DateTime<Utc>) -> Self {
        Self::AddReview { review, at }
    }

    #[must_use]
    pub fn remove(review_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::RemoveReview {
            review_id: review_id.into(),
            at,
        }
    }

    #[must_use]
    pub fn set_weight(review_id: impl Into<String>, weight: f64, at: DateTime<Utc>) -> Self {
        Self::SetWeight {
            review_id: review_id.into(),
            weight,
            at,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::AddReview { .. } => EventKind::AddReview,
            Self::RemoveReview { .. } => EventKind::RemoveReview,
            Self::SetWeight { .. } => EventKind::SetWeight,
            Self::Extension { .. } => EventKind::Extension,
        }
    }

    /// Logical instant of the event; becomes the snapshot's `created_at`.
    #[must_use]
    pub const fn at(&self) -> DateTime<Utc> {
        match self {
            Self::AddReview { at, .. }
            | Self::RemoveReview { at, .. }
            | Self::SetWeight { at, .. }
            | Self::Extension { at, .. } => *at,
        }
    }

    /// Validate the event in isolation (state-independent checks only).
    pub fn validate(&self, position: usize) -> Result<()> {
        let field = |name: &str| format!("events[{position}].{name}");
        match self {
            Self::AddReview { review, at } => {
                review.validate().map_err(|err| match err {
                    TsimError::Validation { field: f, details } => {
                        TsimError::validation(field(f.as_str()), details)
                    }
                    other => other,
                })?;
                if review.timestamp > *at {
                    return Err(TsimError::validation(
                        field("review.timestamp"),
                        format!(
                            "review timestamp {} is later than the event instant {at}",
                            review.timestamp
                        ),
                    ));
                }
            }
            Self::RemoveReview { review_id, .. } => {
                if review_id.trim().is_empty() {
                    return Err(TsimError::validation(field("review_id"), "must not be empty"));
                }
            }
            Self::SetWeight {
                review_id, weight, ..
            } => {
                if review_id.trim().is_empty() {
                    return Err(TsimError::validation(field("review_id"), "must not be empty"));
                }
                validate_weight(*weight).map_err(|_| {
                    TsimError::validation(
                        field("weight"),
                        format!("must be finite and >= 0, got {weight}"),
                    )
                })?;
            }
            Self::Extension { name, .. } => {
                if name.trim().is_empty() {
                    return Err(TsimError::validation(field("name"), "must not be empty"));
                }
            }
        }
        Ok(())
    }
}

// ──────────────────── structural errors ────────────────────

/// An event that cannot apply to the current review set.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ApplyError {
    #[error("review {review_id} is not present")]
    UnknownReview { review_id: String },

    #[error("review {review_id} is already present")]
    DuplicateReview { review_id: String },

    #[error("no handler registered for extension event {name}")]
    UnknownExtension { name: String },

    #[error("extension {name} rejected the event: {details}")]
    ExtensionFailed { name: String, details: String },

    #[error("run interrupted by {code}: {details}")]
    Interrupted { code: String, details: String },
}

// ──────────────────── review set ────────────────────

/// The cumulative review set a timeline evolves, keyed (and ordered) by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewSet {
    reviews: BTreeMap<String, Review>,
}

impl ReviewSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reviews.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reviews.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Review> {
        self.reviews.get(id)
    }

    pub fn insert(&mut self, review: Review) -> std::result::Result<(), ApplyError> {
        if self.reviews.contains_key(&review.id) {
            return Err(ApplyError::DuplicateReview {
                review_id: review.id,
            });
        }
        self.reviews.insert(review.id.clone(), review);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> std::result::Result<Review, ApplyError> {
        self.reviews
            .remove(id)
            .ok_or_else(|| ApplyError::UnknownReview {
                review_id: id.to_string(),
            })
    }

    pub fn set_weight(&mut self, id: &str, weight: f64) -> std::result::Result<(), ApplyError> {
        let review = self
            .reviews
            .get_mut(id)
            .ok_or_else(|| ApplyError::UnknownReview {
                review_id: id.to_string(),
            })?;
        review.weight = weight;
        Ok(())
    }

    /// Canonical (id-ordered) copy of the set, as stored in a snapshot.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Review> {
        self.reviews.values().cloned().collect()
    }

    /// Apply one event in place. On error the set is left unchanged.
    pub fn apply(
        &mut self,
        event: &Event,
        extensions: &ExtensionRegistry,
    ) -> std::result::Result<(), ApplyError> {
        match event {
            Event::AddReview { review, .. } => self.insert(review.clone()),
            Event::RemoveReview { review_id, .. } => self.remove(review_id).map(|_| ()),
            Event::SetWeight {
                review_id, weight, ..
            } => self.set_weight(review_id, *weight),
            Event::Extension { name, payload, at } => {
                let handler = extensions
                    .get(name)
                    .ok_or_else(|| ApplyError::UnknownExtension { name: name.clone() })?;
                let mut scratch = self.clone();
                handler
                    .apply(&mut scratch, payload, *at)
                    .map_err(|details| ApplyError::ExtensionFailed {
                        name: name.clone(),
                        details,
                    })?;
                *self = scratch;
                Ok(())
            }
        }
    }
}

// ──────────────────── extensions ────────────────────

/// Handler for a custom event kind.
///
/// Handlers must be deterministic functions of `(set, payload, at)`; replay
/// equivalence depends on it.
pub trait EventExtension: Send + Sync {
    fn apply(
        &self,
        set: &mut ReviewSet,
        payload: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), String>;
}

/// Named extension handlers. Cloning shares the handlers.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    handlers: BTreeMap<String, Arc<dyn EventExtension>>,
}

impl ExtensionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn EventExtension>) {
        self.handlers.insert(name.into(), handler);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn EventExtension>> {
        self.handlers.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::model::ReviewSource;

    fn t(minute: u32) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2026-02-01T10:{minute:02}:00Z"))
            .unwrap()
            .with_timezone(&Utc)
    }

    fn peer(id: &str, weight: f64) -> Review {
        Review::new(id, ReviewSource::Peer, weight, t(0))
    }

    /// Doubles every weight; used to exercise the extension point.
    struct DoubleWeights;

    impl EventExtension for DoubleWeights {
        fn apply(
            &self,
            set: &mut ReviewSet,
            _payload: &serde_json::Value,
            _at: DateTime<Utc>,
        ) -> std::result::Result<(), String> {
            for review in set.to_vec() {
                set.set_weight(&review.id, review.weight * 2.0)
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        }
    }

    struct AlwaysFails;

    impl EventExtension for AlwaysFails {
        fn apply(
            &self,
            set: &mut ReviewSet,
            _payload: &serde_json::Value,
            _at: DateTime<Utc>,
        ) -> std::result::Result<(), String> {
            // Mutate first to prove the set is restored on failure.
            let _ = set.remove("a");
            Err("nope".to_string())
        }
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let json = serde_json::to_value(Event::remove("r1", t(1))).unwrap();
        assert_eq!(json["kind"], "remove_review");
        assert_eq!(json["review_id"], "r1");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), EventKind::RemoveReview);
    }

    #[test]
    fn validate_rejects_review_from_the_future() {
        let review = Review::new("a", ReviewSource::Peer, 1.0, t(5));
        let err = Event::add(review, t(4)).validate(3).unwrap_err();
        assert!(err.to_string().contains("events[3].review.timestamp"), "{err}");
    }

    #[test]
    fn validate_rejects_bad_weights() {
        assert!(Event::add(peer("a", -1.0), t(1)).validate(0).is_err());
        assert!(Event::set_weight("a", f64::NAN, t(1)).validate(0).is_err());
        assert!(Event::set_weight("", 0.5, t(1)).validate(0).is_err());
    }

    #[test]
    fn apply_add_remove_set_weight() {
        let ext = ExtensionRegistry::new();
        let mut set = ReviewSet::new();
        set.apply(&Event::add(peer("a", 1.0), t(1)), &ext).unwrap();
        set.apply(&Event::add(peer("b", 0.5), t(2)), &ext).unwrap();
        set.apply(&Event::set_weight("a", 0.2, t(3)), &ext).unwrap();
        assert!((set.get("a").unwrap().weight - 0.2).abs() < f64::EPSILON);
        set.apply(&Event::remove("b", t(4)), &ext).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn structural_errors() {
        let ext = ExtensionRegistry::new();
        let mut set = ReviewSet::new();
        assert_eq!(
            set.apply(&Event::remove("ghost", t(1)), &ext),
            Err(ApplyError::UnknownReview {
                review_id: "ghost".to_string()
            })
        );
        set.apply(&Event::add(peer("a", 1.0), t(1)), &ext).unwrap();
        assert!(matches!(
            set.apply(&Event::add(peer("a", 0.3), t(2)), &ext),
            Err(ApplyError::DuplicateReview { .. })
        ));
        assert!(matches!(
            set.apply(&Event::set_weight("ghost", 0.3, t(2)), &ext),
            Err(ApplyError::UnknownReview { .. })
        ));
        // Failed applications leave the set unchanged.
        assert_eq!(set.len(), 1);
        assert!((set.get("a").unwrap().weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn extension_dispatch() {
        let mut ext = ExtensionRegistry::new();
        ext.register("double", Arc::new(DoubleWeights));
        ext.register("broken", Arc::new(AlwaysFails));

        let mut set = ReviewSet::new();
        set.apply(&Event::add(peer("a", 0.25), t(1)), &ext).unwrap();
        let double = Event::Extension {
            name: "double".to_string(),
            payload: serde_json::Value::Null,
            at: t(2),
        };
        set.apply(&double, &ext).unwrap();
        assert!((set.get("a").unwrap().weight - 0.5).abs() < f64::EPSILON);

        let broken = Event::Extension {
            name: "broken".to_string(),
            payload: serde_json::Value::Null,
            at: t(3),
        };
        assert!(matches!(
            set.apply(&broken, &ext),
            Err(ApplyError::ExtensionFailed { .. })
        ));
        assert!(set.get("a").is_some(), "failed extension must not mutate");

        let unknown = Event::Extension {
            name: "missing".to_string(),
            payload: serde_json::Value::Null,
            at: t(4),
        };
        assert!(matches!(
            set.apply(&unknown, &ext),
            Err(ApplyError::UnknownExtension { .. })
        ));
    }

    #[test]
    fn to_vec_is_id_ordered() {
        let ext = ExtensionRegistry::new();
        let mut set = ReviewSet::new();
        for id in ["c", "a", "b"] {
            set.apply(&Event::add(peer(id, 0.1), t(1)), &ext).unwrap();
        }
        let ids: Vec<String> = set.to_vec().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
