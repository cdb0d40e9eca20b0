//! Verification orchestrator.
//!
//! Capture a live frame, locate a face in the document and in the live frame
//! with the primary locator, retry both with the fallback locator if either
//! came back empty, then compare. Both embeddings always come from the same
//! locator.

use crate::comparator::{self, CompareError, Threshold};
use crate::locator::{FaceLocator, LocatorError};
use crate::outcome::{FailureReason, VerificationOutcome};
use crate::types::{FaceSample, FaceSource};
use image::DynamicImage;
use thiserror::Error;

/// Camera could not be opened or produced no usable frame.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("capture unavailable: {0}")]
pub struct CaptureUnavailable(pub String);

/// Source of the live face sample.
pub trait LiveCapture {
    /// Acquire one usable frame. The device is released before returning.
    fn capture(&mut self) -> Result<DynamicImage, CaptureUnavailable>;
}

/// Unexpected failures. Expected ones (no camera, no face) become an
/// errored [`VerificationOutcome`] instead.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("locator error: {0}")]
    Locator(#[from] LocatorError),
    #[error("comparison error: {0}")]
    Compare(#[from] CompareError),
}

/// Stages a run passes through, recorded in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    LiveCaptured,
    DocFaceLocated,
    LiveFaceLocated,
    FallbackRetry,
    Compared,
    Done,
    Errored,
}

/// Everything one run produced.
#[derive(Debug)]
pub struct VerificationReport {
    pub outcome: VerificationOutcome,
    pub stages: Vec<Stage>,
    pub live_frame: Option<DynamicImage>,
    pub document_face: Option<FaceSample>,
    pub live_face: Option<FaceSample>,
}

/// Runs verifications with a fixed pair of locators and a fixed threshold.
pub struct Verifier<P, F> {
    primary: P,
    fallback: F,
    threshold: Threshold,
}

impl<P: FaceLocator, F: FaceLocator> Verifier<P, F> {
    pub fn new(primary: P, fallback: F, threshold: Threshold) -> Self {
        Self { primary, fallback, threshold }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    /// Whether either locator finds a face in `document`, primary first.
    pub fn document_has_face(&mut self, document: &DynamicImage) -> Result<bool, LocatorError> {
        if self.primary.locate(document, FaceSource::Document)?.is_some() {
            return Ok(true);
        }
        let found = self.fallback.locate(document, FaceSource::Document)?.is_some();
        tracing::debug!(found, "document face via fallback");
        Ok(found)
    }

    /// Run one verification of `document` against a live capture.
    pub fn verify<C>(&mut self, document: &DynamicImage, camera: &mut C) -> Result<VerificationReport, VerifyError>
    where
        C: LiveCapture + ?Sized,
    {
        let mut stages = vec![Stage::Start];

        let live_frame = match camera.capture() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "live capture failed");
                stages.push(Stage::Errored);
                return Ok(VerificationReport {
                    outcome: VerificationOutcome::Errored {
                        reason: FailureReason::CaptureFailed,
                        fallback_used: false,
                    },
                    stages,
                    live_frame: None,
                    document_face: None,
                    live_face: None,
                });
            }
        };
        stages.push(Stage::LiveCaptured);
        tracing::debug!(width = live_frame.width(), height = live_frame.height(), "live frame captured");

        let (mut doc_face, mut live_face) = locate_both(&mut self.primary, document, &live_frame, &mut stages)?;

        let fallback_used = doc_face.is_none() || live_face.is_none();
        if fallback_used {
            tracing::warn!(
                document = doc_face.is_some(),
                live = live_face.is_some(),
                "primary locator missed a face, retrying both images with fallback"
            );
            stages.push(Stage::FallbackRetry);
            (doc_face, live_face) = locate_both(&mut self.fallback, document, &live_frame, &mut stages)?;
        }

        let (Some(doc), Some(live)) = (doc_face, live_face) else {
            tracing::info!(fallback_used, "face not detected in one or both images");
            stages.push(Stage::Errored);
            return Ok(VerificationReport {
                outcome: VerificationOutcome::Errored {
                    reason: FailureReason::FaceNotDetected,
                    fallback_used,
                },
                stages,
                live_frame: Some(live_frame),
                document_face: None,
                live_face: None,
            });
        };

        let comparison = comparator::compare(&doc.embedding, &live.embedding, self.threshold)?;
        stages.push(Stage::Compared);

        let outcome = VerificationOutcome::Compared { comparison, fallback_used };
        tracing::info!(
            result = %outcome.verdict_text(),
            distance = comparison.distance,
            confidence = comparison.confidence,
            method = %doc.method,
            "verification complete"
        );
        stages.push(Stage::Done);

        Ok(VerificationReport {
            outcome,
            stages,
            live_frame: Some(live_frame),
            document_face: Some(doc),
            live_face: Some(live),
        })
    }
}

/// Locate the document face and then the live face with the same locator.
fn locate_both<L: FaceLocator>(
    locator: &mut L,
    document: &DynamicImage,
    live: &DynamicImage,
    stages: &mut Vec<Stage>,
) -> Result<(Option<FaceSample>, Option<FaceSample>), LocatorError> {
    let method = locator.method();

    let doc = locator.locate(document, FaceSource::Document)?;
    tracing::debug!(%method, found = doc.is_some(), "document face");
    stages.push(Stage::DocFaceLocated);

    let live = locator.locate(live, FaceSource::Live)?;
    tracing::debug!(%method, found = live.is_some(), "live face");
    stages.push(Stage::LiveFaceLocated);

    Ok((doc, live))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::types::{BoundingBox, Embedding, ExtractionMethod};
    use std::collections::HashMap;

    /// Locator that answers from a table keyed by face source.
    struct FakeLocator {
        method: ExtractionMethod,
        faces: HashMap<FaceSource, Vec<f32>>,
        calls: Vec<FaceSource>,
        fail: bool,
    }

    impl FakeLocator {
        fn new(method: ExtractionMethod) -> Self {
            Self { method, faces: HashMap::new(), calls: Vec::new(), fail: false }
        }

        fn with(mut self, source: FaceSource, embedding: &[f32]) -> Self {
            self.faces.insert(source, embedding.to_vec());
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    impl FaceLocator for FakeLocator {
        fn method(&self) -> ExtractionMethod {
            self.method
        }

        fn locate(&mut self, image: &DynamicImage, source: FaceSource) -> Result<Option<FaceSample>, LocatorError> {
            self.calls.push(source);
            if self.fail {
                return Err(DetectorError::InferenceFailed("boom".into()).into());
            }
            Ok(self.faces.get(&source).map(|values| FaceSample {
                source,
                method: self.method,
                bbox: BoundingBox {
                    x: 0.0, y: 0.0, width: 1.0, height: 1.0, confidence: 1.0, landmarks: None,
                },
                region: image.clone(),
                embedding: Embedding {
                    values: values.clone(),
                    model_version: Some(self.method.to_string()),
                },
            }))
        }
    }

    struct FakeCamera {
        available: bool,
        captures: usize,
    }

    impl LiveCapture for FakeCamera {
        fn capture(&mut self) -> Result<DynamicImage, CaptureUnavailable> {
            self.captures += 1;
            if self.available {
                Ok(DynamicImage::new_luma8(4, 4))
            } else {
                Err(CaptureUnavailable("no device".into()))
            }
        }
    }

    fn camera() -> FakeCamera {
        FakeCamera { available: true, captures: 0 }
    }

    fn document() -> DynamicImage {
        DynamicImage::new_rgb8(8, 8)
    }

    fn primary() -> FakeLocator {
        FakeLocator::new(ExtractionMethod::Primary)
    }

    fn fallback() -> FakeLocator {
        FakeLocator::new(ExtractionMethod::Fallback)
    }

    #[test]
    fn test_identical_faces_verified() {
        let p = primary().with(FaceSource::Document, &[0.0, 0.0]).with(FaceSource::Live, &[0.0, 0.0]);
        let mut verifier = Verifier::new(p, fallback(), Threshold::default());
        let report = verifier.verify(&document(), &mut camera()).unwrap();

        assert_eq!(report.outcome.distance(), Some(0.0));
        assert_eq!(report.outcome.confidence(), Some(100.0));
        assert_eq!(report.outcome.verdict_text(), "Verified");
        assert!(!report.outcome.fallback_used());
        assert_eq!(
            report.stages,
            vec![
                Stage::Start,
                Stage::LiveCaptured,
                Stage::DocFaceLocated,
                Stage::LiveFaceLocated,
                Stage::Compared,
                Stage::Done,
            ]
        );
        assert!(verifier.fallback.calls.is_empty());
    }

    #[test]
    fn test_distant_faces_fail() {
        let p = primary().with(FaceSource::Document, &[0.0, 0.0]).with(FaceSource::Live, &[1.0, 0.0]);
        let mut verifier = Verifier::new(p, fallback(), Threshold::default());
        let report = verifier.verify(&document(), &mut camera()).unwrap();

        assert_eq!(report.outcome.distance(), Some(1.0));
        assert_eq!(report.outcome.confidence(), Some(0.0));
        assert_eq!(report.outcome.verdict_text(), "Failed to verify");
    }

    #[test]
    fn test_live_miss_retries_both_with_fallback() {
        let p = primary().with(FaceSource::Document, &[0.0, 0.0]);
        let f = fallback().with(FaceSource::Document, &[0.1, 0.0]).with(FaceSource::Live, &[0.1, 0.0]);
        let mut verifier = Verifier::new(p, f, Threshold::default());
        let report = verifier.verify(&document(), &mut camera()).unwrap();

        assert!(report.outcome.fallback_used());
        assert_eq!(report.outcome.verdict_text(), "Verified (fallback used)");
        assert_eq!(verifier.fallback.calls, vec![FaceSource::Document, FaceSource::Live]);

        let doc = report.document_face.unwrap();
        let live = report.live_face.unwrap();
        assert_eq!(doc.method, ExtractionMethod::Fallback);
        assert_eq!(live.method, ExtractionMethod::Fallback);
        assert!(report.stages.contains(&Stage::FallbackRetry));
    }

    #[test]
    fn test_document_miss_also_triggers_fallback() {
        let p = primary().with(FaceSource::Live, &[0.0]);
        let f = fallback().with(FaceSource::Document, &[0.0]).with(FaceSource::Live, &[0.9]);
        let mut verifier = Verifier::new(p, f, Threshold::default());
        let report = verifier.verify(&document(), &mut camera()).unwrap();

        // Primary still tried the live image before falling back.
        assert_eq!(verifier.primary.calls, vec![FaceSource::Document, FaceSource::Live]);
        assert_eq!(report.outcome.verdict_text(), "Failed to verify (fallback used)");
    }

    #[test]
    fn test_fallback_miss_is_errored_outcome() {
        let p = primary().with(FaceSource::Document, &[0.0]);
        let f = fallback().with(FaceSource::Document, &[0.0]);
        let mut verifier = Verifier::new(p, f, Threshold::default());
        let report = verifier.verify(&document(), &mut camera()).unwrap();

        assert_eq!(report.outcome.reason(), Some(FailureReason::FaceNotDetected));
        assert_eq!(report.outcome.distance(), None);
        assert_eq!(report.outcome.confidence(), None);
        assert!(report.outcome.fallback_used());
        assert_eq!(report.stages.last(), Some(&Stage::Errored));
        assert!(report.live_frame.is_some());
    }

    #[test]
    fn test_capture_failure_skips_locating() {
        let p = primary().with(FaceSource::Document, &[0.0]).with(FaceSource::Live, &[0.0]);
        let mut verifier = Verifier::new(p, fallback(), Threshold::default());
        let mut cam = FakeCamera { available: false, captures: 0 };
        let report = verifier.verify(&document(), &mut cam).unwrap();

        assert_eq!(cam.captures, 1);
        assert_eq!(report.outcome.verdict_text(), "Error: capture failed");
        assert_eq!(report.outcome.distance(), None);
        assert!(verifier.primary.calls.is_empty());
        assert!(verifier.fallback.calls.is_empty());
        assert_eq!(report.stages, vec![Stage::Start, Stage::Errored]);
    }

    #[test]
    fn test_locator_error_propagates() {
        let mut verifier = Verifier::new(primary().failing(), fallback(), Threshold::default());
        let result = verifier.verify(&document(), &mut camera());
        assert!(matches!(result, Err(VerifyError::Locator(_))));
    }

    #[test]
    fn test_document_face_check_tries_fallback() {
        let p = primary();
        let f = fallback().with(FaceSource::Document, &[0.0]);
        let mut verifier = Verifier::new(p, f, Threshold::default());
        assert!(verifier.document_has_face(&document()).unwrap());
        assert_eq!(verifier.primary.calls, vec![FaceSource::Document]);
        assert_eq!(verifier.fallback.calls, vec![FaceSource::Document]);

        let mut empty = Verifier::new(primary(), fallback(), Threshold::default());
        assert!(!empty.document_has_face(&document()).unwrap());
    }

    #[test]
    fn test_document_face_check_stops_at_primary() {
        let p = primary().with(FaceSource::Document, &[0.0]);
        let mut verifier = Verifier::new(p, fallback(), Threshold::default());
        assert!(verifier.document_has_face(&document()).unwrap());
        assert!(verifier.fallback.calls.is_empty());
    }

    #[test]
    fn test_threshold_boundary_fails() {
        let p = primary().with(FaceSource::Document, &[0.0]).with(FaceSource::Live, &[0.5]);
        let threshold = Threshold::new(0.5).unwrap();
        let mut verifier = Verifier::new(p, fallback(), threshold);
        let report = verifier.verify(&document(), &mut camera()).unwrap();
        assert_eq!(report.outcome.verdict_text(), "Failed to verify");
    }
}
