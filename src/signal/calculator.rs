//! Trust score calculator: pure mapping from a review set to [`TrustMetrics`].
//!
//! ```text
//! signal     = 100 · (1 − e^(−Σ wᵢ·m(sourceᵢ) / signal_saturation))
//! confidence = 100 · (1 − e^(−Σ min(wᵢ, 1) / confidence_saturation))
//! trust      = clamp(a·signal + b·confidence + min(n·bonus, bonus_cap), 0, 100)
//! ```
//!
//! Every term is non-decreasing in each weight and in the review count, so
//! adding a review never lowers the trust score and removing one never raises
//! it. Reviews are folded in id order, which makes the floating-point result a
//! function of the review *set* rather than of insertion order.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::config::CalculatorConfig;
use crate::signal::model::{Review, ReviewSource, TrustMetrics};

/// Per-source weight multipliers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceMultipliers {
    pub peer: f64,
    pub employer: f64,
    pub system: f64,
}

impl SourceMultipliers {
    #[must_use]
    pub const fn for_source(&self, source: ReviewSource) -> f64 {
        match source {
            ReviewSource::Peer => self.peer,
            ReviewSource::Employer => self.employer,
            ReviewSource::System => self.system,
        }
    }
}

/// Intermediate terms, exposed for explain output and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub weighted_signal: f64,
    pub signal_score: f64,
    pub confidence_score: f64,
    pub review_bonus: f64,
    pub trust_score: f64,
    pub network_strength: u32,
}

/// Deterministic, stateless calculator. Cheap to clone and share.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustCalculator {
    multipliers: SourceMultipliers,
    signal_weight: f64,
    confidence_weight: f64,
    review_bonus: f64,
    review_bonus_cap: f64,
    signal_saturation: f64,
    confidence_saturation: f64,
}

impl Default for TrustCalculator {
    fn default() -> Self {
        Self::from_config(&CalculatorConfig::default())
    }
}

impl TrustCalculator {
    #[must_use]
    pub fn from_config(cfg: &CalculatorConfig) -> Self {
        Self {
            multipliers: SourceMultipliers {
                peer: cfg.peer_multiplier,
                employer: cfg.employer_multiplier,
                system: cfg.system_multiplier,
            },
            signal_weight: cfg.signal_weight,
            confidence_weight: cfg.confidence_weight,
            review_bonus: cfg.review_bonus,
            review_bonus_cap: cfg.review_bonus_cap,
            signal_saturation: cfg.signal_saturation,
            confidence_saturation: cfg.confidence_saturation,
        }
    }

    /// Compute metrics for a review set. Empty input yields all zeros.
    #[must_use]
    pub fn compute(&self, reviews: &[Review]) -> TrustMetrics {
        let b = self.breakdown(reviews);
        TrustMetrics {
            trust_score: b.trust_score,
            confidence_score: b.confidence_score,
            network_strength: b.network_strength,
        }
    }

    /// Same as [`compute`](Self::compute) but returns every intermediate term.
    #[must_use]
    pub fn breakdown(&self, reviews: &[Review]) -> ScoreBreakdown {
        if reviews.is_empty() {
            return ScoreBreakdown {
                weighted_signal: 0.0,
                signal_score: 0.0,
                confidence_score: 0.0,
                review_bonus: 0.0,
                trust_score: 0.0,
                network_strength: 0,
            };
        }

        let mut ordered: Vec<&Review> = reviews.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let mut weighted = 0.0_f64;
        let mut capped = 0.0_f64;
        let mut sources = BTreeSet::new();
        for review in &ordered {
            let w = sanitize(review.weight);
            weighted += w * sanitize(self.multipliers.for_source(review.source));
            capped += w.min(1.0);
            sources.insert(review.source);
        }

        let signal_score = saturate(weighted, self.signal_saturation);
        let confidence_score = saturate(capped, self.confidence_saturation);
        let review_bonus = (ordered.len() as f64 * self.review_bonus).min(self.review_bonus_cap);
        let trust_score = self
            .confidence_weight
            .mul_add(
                confidence_score,
                self.signal_weight.mul_add(signal_score, review_bonus),
            )
            .clamp(0.0, 100.0);

        ScoreBreakdown {
            weighted_signal: weighted,
            signal_score,
            confidence_score,
            review_bonus,
            trust_score,
            network_strength: u32::try_from(sources.len()).unwrap_or(u32::MAX),
        }
    }
}

/// Map a non-negative accumulator onto `[0, 100]`, monotonically.
fn saturate(value: f64, saturation: f64) -> f64 {
    if value <= 0.0 || saturation <= 0.0 {
        return 0.0;
    }
    (100.0 * (1.0 - (-value / saturation).exp())).clamp(0.0, 100.0)
}

/// Non-finite or negative inputs contribute nothing.
fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
