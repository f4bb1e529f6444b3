//! Reviews (weighted trust signals) and the metrics derived from them.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TsimError};

/// Who produced a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewSource {
    Peer,
    Employer,
    System,
}

impl ReviewSource {
    pub const ALL: [Self; 3] = [Self::Peer, Self::Employer, Self::System];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Employer => "employer",
            Self::System => "system",
        }
    }

    /// Parse a source label, accepting the aliases found in legacy exports.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "peer" | "colleague" | "coworker" => Ok(Self::Peer),
            "employer" | "manager" | "company" => Ok(Self::Employer),
            "system" | "platform" | "auto" | "automated" => Ok(Self::System),
            other => Err(TsimError::validation(
                "review.source",
                format!("unknown review source {other:?}"),
            )),
        }
    }
}

impl fmt::Display for ReviewSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One weighted signal contributing to trust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub source: ReviewSource,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
}

impl Review {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: ReviewSource,
        weight: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            weight,
            timestamp,
        }
    }

    /// Check the invariants that do not depend on the surrounding timeline.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TsimError::validation("review.id", "must not be empty"));
        }
        validate_weight(self.weight)
    }
}

/// Weights must be finite and non-negative.
pub fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(TsimError::validation(
            "review.weight",
            format!("must be finite and >= 0, got {weight}"),
        ));
    }
    Ok(())
}

/// Derived trust figures. Only ever stored inside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustMetrics {
    /// 0–100.
    pub trust_score: f64,
    /// 0–100.
    pub confidence_score: f64,
    /// Distinct sources with at least one review.
    pub network_strength: u32,
}

impl TrustMetrics {
    pub const EMPTY: Self = Self {
        trust_score: 0.0,
        confidence_score: 0.0,
        network_strength: 0,
    };
}
