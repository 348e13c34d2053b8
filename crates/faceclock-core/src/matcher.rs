//! Signature comparison: Euclidean distance, tolerance decision, confidence tier.

use crate::types::Signature;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum distance accepted as the same person.
pub const DEFAULT_TOLERANCE: f64 = 0.6;

// Fixed calibration constants; checked in this order.
const HIGH_CONFIDENCE_SIMILARITY: f64 = 0.85;
const MEDIUM_CONFIDENCE_SIMILARITY: f64 = 0.70;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("incompatible signatures: {0}")]
    IncompatibleSignatures(String),
    #[error("tolerance must be within [0, 1], got {0}")]
    InvalidTolerance(f64),
}

/// Coarse, human-facing classification of a similarity value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn from_similarity(similarity: f64) -> Self {
        if similarity >= HIGH_CONFIDENCE_SIMILARITY {
            ConfidenceTier::High
        } else if similarity >= MEDIUM_CONFIDENCE_SIMILARITY {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::High => "high",
            ConfidenceTier::Medium => "medium",
            ConfidenceTier::Low => "low",
        }
    }
}

impl std::fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of comparing one candidate signature against one reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Euclidean distance between the two vectors. Lower is better.
    pub distance: f64,
    /// `clamp(1 - distance, 0, 1)` rounded to 3 decimals, for display.
    pub similarity: f64,
    /// Unrounded similarity; the confidence tier is derived from this value.
    pub exact_similarity: f64,
    pub is_match: bool,
    pub confidence: ConfidenceTier,
    pub tolerance_used: f64,
}

/// Strategy for deciding whether a candidate signature matches a reference.
pub trait Matcher {
    fn compare(
        &self,
        reference: &Signature,
        candidate: &Signature,
        tolerance: f64,
    ) -> Result<MatchResult, MatchError>;
}

/// L2-distance matcher.
///
/// The similarity it reports is a linear display approximation of the
/// distance, not a probability: distance is unbounded above, so similarity
/// saturates at 0 instead of going negative.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        reference: &Signature,
        candidate: &Signature,
        tolerance: f64,
    ) -> Result<MatchResult, MatchError> {
        if !(0.0..=1.0).contains(&tolerance) {
            return Err(MatchError::InvalidTolerance(tolerance));
        }
        check_compatible(reference, candidate)?;

        let distance = euclidean_distance(&reference.vector, &candidate.vector);
        let exact_similarity = (1.0 - distance).clamp(0.0, 1.0);

        Ok(MatchResult {
            distance,
            similarity: round_to(exact_similarity, 3),
            exact_similarity,
            // Distance against tolerance: a match is anything at or under it.
            is_match: distance <= tolerance,
            confidence: ConfidenceTier::from_similarity(exact_similarity),
            tolerance_used: tolerance,
        })
    }
}

fn check_compatible(reference: &Signature, candidate: &Signature) -> Result<(), MatchError> {
    for (role, sig) in [("reference", reference), ("candidate", candidate)] {
        sig.check_shape()
            .map_err(|e| MatchError::IncompatibleSignatures(format!("{role}: {e}")))?;
    }
    if reference.format_version != candidate.format_version {
        return Err(MatchError::IncompatibleSignatures(format!(
            "format version {} vs {}",
            reference.format_version, candidate.format_version
        )));
    }
    if reference.vector.len() != candidate.vector.len() {
        return Err(MatchError::IncompatibleSignatures(format!(
            "vector length {} vs {}",
            reference.vector.len(),
            candidate.vector.len()
        )));
    }
    Ok(())
}

/// L2 norm of the component-wise difference, accumulated in f64.
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
