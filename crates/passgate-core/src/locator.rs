//! Face locators: find one face in an image and embed it.
//!
//! Two implementations share the [`FaceLocator`] contract. The primary pairs
//! SCRFD with ArcFace; the fallback pairs BlazeFace with an unaligned crop
//! embedder. Their embeddings are not comparable with each other.

use crate::blazeface::BlazeFaceDetector;
use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::CropEmbedder;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding, ExtractionMethod, FaceSample, FaceSource};
use image::DynamicImage;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Find the face to verify in an image.
pub trait FaceLocator {
    /// Which extraction method this locator's embeddings belong to.
    fn method(&self) -> ExtractionMethod;

    /// Locate one face and embed it.
    ///
    /// `Ok(None)` means no face was found, which is an expected outcome. Errors
    /// are reserved for failures of the underlying models.
    fn locate(
        &mut self,
        image: &DynamicImage,
        source: FaceSource,
    ) -> Result<Option<FaceSample>, LocatorError>;
}

/// Which candidate to take when a detector reports several faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// The first candidate in the detector's own output order. For SCRFD that
    /// is the highest-scoring box after NMS; for BlazeFace it is anchor order.
    #[default]
    First,
    HighestConfidence,
    Largest,
}

impl SelectionPolicy {
    pub fn select<'a>(&self, faces: &'a [BoundingBox]) -> Option<&'a BoundingBox> {
        let by = |key: fn(&BoundingBox) -> f32| {
            // max_by keeps the last of equal elements; fold to keep the first.
            faces.iter().fold(None::<&BoundingBox>, |best, f| match best {
                Some(b) if key(b) >= key(f) => Some(b),
                _ => Some(f),
            })
        };
        match self {
            SelectionPolicy::First => faces.first(),
            SelectionPolicy::HighestConfidence => by(|f| f.confidence),
            SelectionPolicy::Largest => by(BoundingBox::area),
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(SelectionPolicy::First),
            "confidence" | "highest_confidence" => Ok(SelectionPolicy::HighestConfidence),
            "largest" => Ok(SelectionPolicy::Largest),
            other => Err(format!("unknown face selection policy: {other}")),
        }
    }
}

/// Crop the pixels of `face` out of `image`, `None` if the box misses the image.
pub fn crop_region(image: &DynamicImage, face: &BoundingBox) -> Option<DynamicImage> {
    let (x, y, w, h) = face.pixel_rect(image.width(), image.height())?;
    Some(image.crop_imm(x, y, w, h))
}

/// SCRFD detection + ArcFace embedding.
pub struct PrimaryLocator {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    policy: SelectionPolicy,
}

impl PrimaryLocator {
    pub fn load(detector_path: &str, recognizer_path: &str, policy: SelectionPolicy) -> Result<Self, LocatorError> {
        let detector = FaceDetector::load(detector_path)?;
        tracing::info!(path = detector_path, "SCRFD detector loaded");
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        tracing::info!(path = recognizer_path, "ArcFace recognizer loaded");
        Ok(Self { detector, recognizer, policy })
    }
}

impl FaceLocator for PrimaryLocator {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Primary
    }

    fn locate(
        &mut self,
        image: &DynamicImage,
        source: FaceSource,
    ) -> Result<Option<FaceSample>, LocatorError> {
        let gray = image.to_luma8();
        let faces = self.detector.detect(&gray)?;
        tracing::debug!(%source, candidates = faces.len(), "primary detection");

        let Some(face) = self.policy.select(&faces) else {
            return Ok(None);
        };
        let Some(region) = crop_region(image, face) else {
            return Ok(None);
        };
        let Some(embedding) = unalignable_as_missing(self.recognizer.extract(&gray, face))? else {
            tracing::debug!(%source, "selected face cannot be aligned");
            return Ok(None);
        };

        Ok(Some(FaceSample {
            source,
            method: ExtractionMethod::Primary,
            bbox: face.clone(),
            region,
            embedding,
        }))
    }
}

/// A face that cannot be aligned counts as no face, so the fallback gets a turn.
fn unalignable_as_missing(result: Result<Embedding, RecognizerError>) -> Result<Option<Embedding>, RecognizerError> {
    match result {
        Ok(embedding) => Ok(Some(embedding)),
        Err(RecognizerError::NoLandmarks | RecognizerError::DegenerateLandmarks) => Ok(None),
        Err(e) => Err(e),
    }
}

/// BlazeFace detection + unaligned crop embedding.
pub struct FallbackLocator {
    detector: BlazeFaceDetector,
    embedder: CropEmbedder,
    policy: SelectionPolicy,
}

impl FallbackLocator {
    pub fn load(detector_path: &str, embedder_path: &str, policy: SelectionPolicy) -> Result<Self, LocatorError> {
        let detector = BlazeFaceDetector::load(detector_path)?;
        tracing::info!(path = detector_path, "BlazeFace detector loaded");
        let embedder = CropEmbedder::load(embedder_path)?;
        tracing::info!(path = embedder_path, "crop embedder loaded");
        Ok(Self { detector, embedder, policy })
    }
}

impl FaceLocator for FallbackLocator {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Fallback
    }

    fn locate(
        &mut self,
        image: &DynamicImage,
        source: FaceSource,
    ) -> Result<Option<FaceSample>, LocatorError> {
        let gray = image.to_luma8();
        let faces = self.detector.detect(&gray)?;
        tracing::debug!(%source, candidates = faces.len(), "fallback detection");

        let Some(face) = self.policy.select(&faces) else {
            return Ok(None);
        };
        let Some(region) = crop_region(image, face) else {
            return Ok(None);
        };
        let Some(embedding) = self.embedder.extract(&gray, face)? else {
            return Ok(None);
        };

        Ok(Some(FaceSample {
            source,
            method: ExtractionMethod::Fallback,
            bbox: face.clone(),
            region,
            embedding,
        }))
    }
}
