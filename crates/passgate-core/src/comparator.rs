//! Embedding comparison: Euclidean distance, heuristic confidence, verdict.

use crate::types::Embedding;
use serde::Serialize;
use thiserror::Error;

/// Distance below which two faces are considered the same person.
pub const DEFAULT_THRESHOLD: f64 = 0.6;

#[derive(Error, Debug, PartialEq)]
pub enum CompareError {
    #[error("embedding dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("cannot compare empty embeddings")]
    Empty,
    #[error("embeddings come from different models: {left} vs {right}")]
    ModelMismatch { left: String, right: String },
    #[error("threshold must be a finite non-negative number, got {0}")]
    InvalidThreshold(f64),
}

/// Distance threshold separating "verified" from "failed".
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Threshold(f64);

impl Threshold {
    pub fn new(value: f64) -> Result<Self, CompareError> {
        if value.is_finite() && value >= 0.0 {
            Ok(Self(value))
        } else {
            Err(CompareError::InvalidThreshold(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD)
    }
}

/// Result of comparing two embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub distance: f64,
    /// Percentage in [0, 100], rounded to two decimals.
    pub confidence: f64,
    pub verified: bool,
}

/// `round(max(0, 1 - distance) * 100, 2)`.
///
/// A heuristic, not a calibrated probability: it reaches 0 at distance 1.
pub fn confidence_for(distance: f64) -> f64 {
    let pct = (1.0 - distance).max(0.0) * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Compare two embeddings against `threshold`. Verified iff distance < threshold.
pub fn compare(a: &Embedding, b: &Embedding, threshold: Threshold) -> Result<Comparison, CompareError> {
    if a.is_empty() || b.is_empty() {
        return Err(CompareError::Empty);
    }
    if a.len() != b.len() {
        return Err(CompareError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if let (Some(left), Some(right)) = (&a.model_version, &b.model_version) {
        if left != right {
            return Err(CompareError::ModelMismatch {
                left: left.clone(),
                right: right.clone(),
            });
        }
    }

    let distance = a.euclidean_distance(b);
    Ok(Comparison {
        distance,
        confidence: confidence_for(distance),
        verified: distance < threshold.value(),
    })
}
