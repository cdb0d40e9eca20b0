use crate::comparator::Comparison;
use serde::Serialize;
use std::fmt;

const FALLBACK_SUFFIX: &str = " (fallback used)";

/// Why a run ended without a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CaptureFailed,
    FaceNotDetected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CaptureFailed => f.write_str("capture failed"),
            FailureReason::FaceNotDetected => f.write_str("face not detected in one or both images"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    Failed,
    Error,
}

/// The single result of one verification run.
///
/// Compared runs always carry distance and confidence; errored runs never do.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Compared { comparison: Comparison, fallback_used: bool },
    Errored { reason: FailureReason, fallback_used: bool },
}

impl VerificationOutcome {
    pub fn verdict(&self) -> Verdict {
        match self {
            VerificationOutcome::Compared { comparison, .. } if comparison.verified => Verdict::Verified,
            VerificationOutcome::Compared { .. } => Verdict::Failed,
            VerificationOutcome::Errored { .. } => Verdict::Error,
        }
    }

    pub fn distance(&self) -> Option<f64> {
        match self {
            VerificationOutcome::Compared { comparison, .. } => Some(comparison.distance),
            VerificationOutcome::Errored { .. } => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            VerificationOutcome::Compared { comparison, .. } => Some(comparison.confidence),
            VerificationOutcome::Errored { .. } => None,
        }
    }

    pub fn fallback_used(&self) -> bool {
        match self {
            VerificationOutcome::Compared { fallback_used, .. }
            | VerificationOutcome::Errored { fallback_used, .. } => *fallback_used,
        }
    }

    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            VerificationOutcome::Compared { .. } => None,
            VerificationOutcome::Errored { reason, .. } => Some(*reason),
        }
    }

    /// User-facing verdict line, e.g. `"Verified (fallback used)"`.
    pub fn verdict_text(&self) -> String {
        match self {
            VerificationOutcome::Compared { comparison, fallback_used } => {
                let base = if comparison.verified { "Verified" } else { "Failed to verify" };
                if *fallback_used {
                    format!("{base}{FALLBACK_SUFFIX}")
                } else {
                    base.to_string()
                }
            }
            VerificationOutcome::Errored { reason: FailureReason::CaptureFailed, .. } => {
                "Error: capture failed".to_string()
            }
            VerificationOutcome::Errored { reason: FailureReason::FaceNotDetected, .. } => {
                "Face not detected in one or both images".to_string()
            }
        }
    }

    /// Confidence as `"87.66%"`, or `"N/A"` when nothing was compared.
    pub fn confidence_text(&self) -> String {
        match self.confidence() {
            Some(c) => format!("{c:.2}%"),
            None => "N/A".to_string(),
        }
    }

    pub fn record(&self) -> OutcomeRecord {
        OutcomeRecord {
            verdict: self.verdict(),
            verification_result: self.verdict_text(),
            distance: self.distance(),
            confidence: self.confidence(),
            fallback_used: self.fallback_used(),
            reason: self.reason(),
        }
    }
}

/// Flat, serializable view of an outcome.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    pub verdict: Verdict,
    pub verification_result: String,
    pub distance: Option<f64>,
    pub confidence: Option<f64>,
    pub fallback_used: bool,
    pub reason: Option<FailureReason>,
}
