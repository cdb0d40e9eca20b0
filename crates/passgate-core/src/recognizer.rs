//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional embeddings from landmark-aligned 112×112 crops
//! using the w600k_r50 model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::model;
use crate::types::{BoundingBox, Embedding};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; alignment needs the detector's five points")]
    NoLandmarks,
    #[error("face landmarks are degenerate and cannot be aligned")]
    DegenerateLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !model::exists(model_path) {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }
        let session = model::load_session(model_path, "arcface")?;
        Ok(Self { session })
    }

    /// Extract an L2-normalized embedding for `face` within `frame`.
    pub fn extract(&mut self, frame: &GrayImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned =
            alignment::align_face(frame, landmarks).ok_or(RecognizerError::DegenerateLandmarks)?;

        let input = Self::preprocess(&aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::normalized(raw.to_vec(), ARCFACE_MODEL_VERSION))
    }

    /// Aligned grayscale crop → NCHW float tensor, luma replicated to RGB.
    fn preprocess(aligned: &GrayImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
            let pixel = aligned
                .get_pixel_checked(x as u32, y as u32)
                .map_or(0.0, |p| p[0] as f32);
            (pixel - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = GrayImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Luma([128]));
        let tensor = FaceRecognizer::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = GrayImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Luma([255]));
        let tensor = FaceRecognizer::preprocess(&aligned);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let aligned = GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| Luma([((x + y) % 256) as u8]));
        let tensor = FaceRecognizer::preprocess(&aligned);
        for (y, x) in [(0, 0), (10, 50), (111, 111)] {
            assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
            assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
        }
        let expected = ((10 + 50) as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 10, 50]] - expected).abs() < 1e-6);
    }
}
