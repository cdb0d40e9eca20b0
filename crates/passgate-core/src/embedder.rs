//! Crop embedder for the fallback path.
//!
//! Runs a MobileFaceNet-style model on the detector's box, resized to 112×112
//! without landmark alignment. Embeddings from this model live in a different
//! space than ArcFace's and must never be compared against them.

use crate::model;
use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

const CROP_INPUT_SIZE: u32 = 112;
const CROP_MEAN: f32 = 127.5;
const CROP_STD: f32 = 128.0;
pub const CROP_MODEL_VERSION: &str = "mobilefacenet";

/// Unaligned crop embedder.
pub struct CropEmbedder {
    session: Session,
}

impl CropEmbedder {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !model::exists(model_path) {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }
        let session = model::load_session(model_path, "crop-embedder")?;
        Ok(Self { session })
    }

    /// Embed the region of `frame` covered by `face`.
    ///
    /// Returns `Ok(None)` when the box does not overlap the frame.
    pub fn extract(
        &mut self,
        frame: &GrayImage,
        face: &BoundingBox,
    ) -> Result<Option<Embedding>, RecognizerError> {
        let Some(input) = Self::preprocess(frame, face) else {
            return Ok(None);
        };

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("crop embedding: {e}")))?;

        if raw.is_empty() {
            return Err(RecognizerError::InferenceFailed("empty crop embedding".into()));
        }

        Ok(Some(Embedding::normalized(raw.to_vec(), CROP_MODEL_VERSION)))
    }

    fn preprocess(frame: &GrayImage, face: &BoundingBox) -> Option<Array4<f32>> {
        let (x, y, w, h) = face.pixel_rect(frame.width(), frame.height())?;
        let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
        let resized = imageops::resize(&crop, CROP_INPUT_SIZE, CROP_INPUT_SIZE, FilterType::Triangle);

        let size = CROP_INPUT_SIZE as usize;
        Some(Array4::from_shape_fn((1, 3, size, size), |(_, _, row, col)| {
            (resized.get_pixel(col as u32, row as u32)[0] as f32 - CROP_MEAN) / CROP_STD
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: 0.9, landmarks: None,
        }
    }

    #[test]
    fn test_preprocess_uses_only_the_box() {
        // Left half dark, right half bright; box covers the bright half.
        let frame = GrayImage::from_fn(100, 50, |x, _| if x < 50 { Luma([0]) } else { Luma([255]) });
        let tensor = CropEmbedder::preprocess(&frame, &face(50.0, 0.0, 50.0, 50.0)).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        let expected = (255.0 - CROP_MEAN) / CROP_STD;
        assert!((tensor[[0, 0, 56, 56]] - expected).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_box_outside_frame() {
        let frame = GrayImage::new(20, 20);
        assert!(CropEmbedder::preprocess(&frame, &face(40.0, 40.0, 10.0, 10.0)).is_none());
    }
}
