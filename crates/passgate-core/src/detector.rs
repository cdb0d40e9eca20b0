//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. Input frames are
//! letterboxed into a 640×640 grayscale canvas replicated across RGB.

use crate::model;
use crate::types::{non_max_suppression, BoundingBox};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the model canvas.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    /// Map a point from canvas space back into source-frame space.
    fn to_source(self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Positions of the score, bbox and keypoint tensors for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideSlots {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw head outputs for one stride.
struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    slots: [StrideSlots; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !model::exists(model_path) {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = model::load_session(model_path, "scrfd")?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }

        let slots = stride_slots(&names);
        tracing::debug!(?slots, "SCRFD output tensor mapping");

        Ok(Self { session, slots })
    }

    /// Detect faces, returning boxes ordered by descending confidence.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = letterbox_tensor(frame, SCRFD_INPUT_SIZE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slots, &stride) in self.slots.iter().zip(SCRFD_STRIDES.iter()) {
            let (_, scores) = outputs[slots.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| head_error("scores", stride, e))?;
            let (_, bboxes) = outputs[slots.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| head_error("bboxes", stride, e))?;
            let (_, kps) = outputs[slots.kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| head_error("kps", stride, e))?;

            candidates.extend(decode_stride(
                &StrideOutputs { scores, bboxes, kps },
                stride,
                SCRFD_INPUT_SIZE,
                letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let faces = non_max_suppression(candidates, SCRFD_NMS_THRESHOLD);
        tracing::trace!(count = faces.len(), "SCRFD detections");
        Ok(faces)
    }
}

fn head_error(what: &str, stride: u32, e: ort::Error) -> DetectorError {
    DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
}

/// Fit `frame` into a `size`×`size` NCHW tensor, centered, padding with the mean.
fn letterbox_tensor(frame: &GrayImage, size: u32) -> (Array4<f32>, Letterbox) {
    let (width, height) = frame.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    // Zero is the normalized value of SCRFD_MEAN, so the padding needs no fill.
    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (row, col) = ((y + pad_y) as usize, (x + pad_x) as usize);
        for channel in 0..3 {
            tensor[[0, channel, row, col]] = value;
        }
    }

    let letterbox = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (tensor, letterbox)
}

/// Map output tensors to stride slots.
///
/// Exports either name their heads `score_8`, `bbox_16`, `kps_32`, ... or use
/// opaque numeric names, in which case the standard positional layout applies:
/// scores at 0-2, bboxes at 3-5, keypoints at 6-8.
fn stride_slots(names: &[String]) -> [StrideSlots; 3] {
    let find = |prefix: &str, stride: u32| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideSlots>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideSlots {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideSlots {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Decode detections for one stride level, in anchor order.
fn decode_stride(
    out: &StrideOutputs<'_>,
    stride: u32,
    input_size: u32,
    letterbox: Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = (input_size / stride) as usize;
    let step = stride as f32;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    (0..anchors)
        .filter_map(|idx| {
            let score = *out.scores.get(idx)?;
            if score <= threshold {
                return None;
            }

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let d = out.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_source(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = letterbox.to_source(ax + d[2] * step, ay + d[3] * step);

            let landmarks = out.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.to_source(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step)
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}
