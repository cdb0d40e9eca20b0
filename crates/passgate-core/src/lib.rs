//! passgate-core: face location, embedding comparison, and the verification flow.
//!
//! The primary locator runs SCRFD detection and ArcFace recognition; the
//! fallback runs BlazeFace and an unaligned crop embedder. Both go through
//! ONNX Runtime on the CPU.

pub mod alignment;
pub mod blazeface;
pub mod comparator;
pub mod detector;
pub mod embedder;
pub mod locator;
mod model;
pub mod outcome;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use comparator::{compare, Comparison, CompareError, Threshold, DEFAULT_THRESHOLD};
pub use locator::{FaceLocator, FallbackLocator, LocatorError, PrimaryLocator, SelectionPolicy};
pub use outcome::{FailureReason, OutcomeRecord, Verdict, VerificationOutcome};
pub use pipeline::{CaptureUnavailable, LiveCapture, Stage, VerificationReport, Verifier, VerifyError};
pub use types::{BoundingBox, Embedding, ExtractionMethod, FaceSample, FaceSource};

use std::path::PathBuf;

/// Default directory for ONNX model files: `$XDG_DATA_HOME/passgate/models`,
/// falling back to `~/.local/share/passgate/models`.
pub fn default_model_dir() -> PathBuf {
    if let Some(data) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(data).join("passgate/models");
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
    PathBuf::from(home).join(".local/share/passgate/models")
}
