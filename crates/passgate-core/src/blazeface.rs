//! BlazeFace short-range detector, the fallback path.
//!
//! Model input: 128×128 NCHW float image in [-1, 1].
//! Model output: 896 anchor scores (logits) and 896×16 regressors. The first
//! four regressor values are centre offset and size in input pixels relative
//! to a fixed SSD anchor; the remaining twelve are six keypoints, which this
//! detector does not use.
//!
//! Detections are returned in anchor order, which is the detector's native
//! ordering, not sorted by confidence.

use crate::detector::DetectorError;
use crate::model;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

const BLAZE_INPUT_SIZE: u32 = 128;
const BLAZE_ANCHOR_COUNT: usize = 896;
const BLAZE_REGRESSOR_WIDTH: usize = 16;
const BLAZE_SCORE_THRESHOLD: f32 = 0.5;
const BLAZE_OVERLAP_THRESHOLD: f32 = 0.3;
const BLAZE_LOGIT_CLIP: f32 = 100.0;
/// (stride, anchors per cell) after merging the three stride-16 layers.
const BLAZE_ANCHOR_LAYERS: [(u32, usize); 2] = [(8, 2), (16, 6)];

/// BlazeFace-based face detector.
pub struct BlazeFaceDetector {
    session: Session,
    anchors: Vec<(f32, f32)>,
}

impl BlazeFaceDetector {
    /// Load the BlazeFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !model::exists(model_path) {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }
        let session = model::load_session(model_path, "blazeface")?;
        if session.outputs().len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "BlazeFace needs regressor and score outputs, got {}",
                session.outputs().len()
            )));
        }
        Ok(Self {
            session,
            anchors: anchor_centers(),
        })
    }

    /// Detect faces in anchor order.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let input = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, first) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("output 0: {e}")))?;
        let (_, second) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("output 1: {e}")))?;

        // Export order varies; tell the heads apart by size.
        let (regressors, scores) = if first.len() >= second.len() {
            (first, second)
        } else {
            (second, first)
        };
        if scores.len() < BLAZE_ANCHOR_COUNT
            || regressors.len() < BLAZE_ANCHOR_COUNT * BLAZE_REGRESSOR_WIDTH
        {
            return Err(DetectorError::InferenceFailed(format!(
                "unexpected BlazeFace head sizes: scores {}, regressors {}",
                scores.len(),
                regressors.len()
            )));
        }

        let sx = frame.width() as f32 / BLAZE_INPUT_SIZE as f32;
        let sy = frame.height() as f32 / BLAZE_INPUT_SIZE as f32;
        let candidates = decode(&self.anchors, scores, regressors, (sx, sy), BLAZE_SCORE_THRESHOLD);
        let faces = suppress_in_order(candidates, BLAZE_OVERLAP_THRESHOLD);
        tracing::trace!(count = faces.len(), "BlazeFace detections");
        Ok(faces)
    }

    /// Stretch the frame to 128×128 and scale luma into [-1, 1].
    fn preprocess(frame: &GrayImage) -> Array4<f32> {
        let resized = imageops::resize(frame, BLAZE_INPUT_SIZE, BLAZE_INPUT_SIZE, FilterType::Triangle);
        let size = BLAZE_INPUT_SIZE as usize;
        Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
            resized.get_pixel(x as u32, y as u32)[0] as f32 / 127.5 - 1.0
        })
    }
}

/// Normalized anchor centres in model output order.
fn anchor_centers() -> Vec<(f32, f32)> {
    let mut anchors = Vec::with_capacity(BLAZE_ANCHOR_COUNT);
    for (stride, per_cell) in BLAZE_ANCHOR_LAYERS {
        let grid = BLAZE_INPUT_SIZE / stride;
        for y in 0..grid {
            for x in 0..grid {
                let center = (
                    (x as f32 + 0.5) / grid as f32,
                    (y as f32 + 0.5) / grid as f32,
                );
                anchors.extend(std::iter::repeat(center).take(per_cell));
            }
        }
    }
    anchors
}

fn sigmoid(logit: f32) -> f32 {
    let x = logit.clamp(-BLAZE_LOGIT_CLIP, BLAZE_LOGIT_CLIP);
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        x.exp() / (1.0 + x.exp())
    }
}

/// Decode anchor-relative regressions into source-frame boxes.
fn decode(
    anchors: &[(f32, f32)],
    scores: &[f32],
    regressors: &[f32],
    (sx, sy): (f32, f32),
    threshold: f32,
) -> Vec<BoundingBox> {
    let input = BLAZE_INPUT_SIZE as f32;
    anchors
        .iter()
        .enumerate()
        .filter_map(|(idx, &(acx, acy))| {
            let score = sigmoid(*scores.get(idx)?);
            if score <= threshold {
                return None;
            }
            let r = regressors.get(idx * BLAZE_REGRESSOR_WIDTH..idx * BLAZE_REGRESSOR_WIDTH + 4)?;
            let cx = acx * input + r[0];
            let cy = acy * input + r[1];
            let (w, h) = (r[2], r[3]);
            Some(BoundingBox {
                x: (cx - w / 2.0) * sx,
                y: (cy - h / 2.0) * sy,
                width: w * sx,
                height: h * sy,
                confidence: score,
                landmarks: None,
            })
        })
        .collect()
}

/// Overlap suppression that keeps first-seen order: a candidate replaces an
/// overlapping kept box in place when it scores higher, otherwise it is dropped.
fn suppress_in_order(candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        match kept.iter().position(|k| k.iou(&candidate) > iou_threshold) {
            Some(i) if kept[i].confidence < candidate.confidence => kept[i] = candidate,
            Some(_) => {}
            None => kept.push(candidate),
        }
    }
    kept
}
