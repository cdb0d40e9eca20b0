use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, 0.0 when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Integer pixel rectangle `(x, y, width, height)` clipped to an image of the
    /// given size. `None` when nothing of the box lies inside the image.
    pub fn pixel_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.floor().clamp(0.0, image_width as f32) as u32;
        let y1 = self.y.floor().clamp(0.0, image_height as f32) as u32;
        let x2 = (self.x + self.width).ceil().clamp(0.0, image_width as f32) as u32;
        let y2 = (self.y + self.height).ceil().clamp(0.0, image_height as f32) as u32;

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Greedy Non-Maximum Suppression. Output is ordered by descending confidence.
pub fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Face embedding vector produced by one recognition model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Build an embedding from raw model output, scaled to unit L2 norm.
    /// An all-zero vector is kept as-is.
    pub fn normalized(raw: Vec<f32>, model_version: &str) -> Self {
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.into_iter().map(|v| v / norm).collect()
        } else {
            raw
        };
        Self {
            values,
            model_version: Some(model_version.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm of the element-wise difference, accumulated in f64.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (*a as f64 - *b as f64).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// Which image a face sample was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceSource {
    Document,
    Live,
}

impl fmt::Display for FaceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaceSource::Document => f.write_str("document"),
            FaceSource::Live => f.write_str("live"),
        }
    }
}

/// Which locator produced a face sample. Embeddings are only comparable
/// between samples sharing the same method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Primary,
    Fallback,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMethod::Primary => f.write_str("primary"),
            ExtractionMethod::Fallback => f.write_str("fallback"),
        }
    }
}

/// One located face: the cropped pixels, its box in the source image and the
/// embedding computed from it.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub source: FaceSource,
    pub method: ExtractionMethod,
    pub bbox: BoundingBox,
    pub region: DynamicImage,
    pub embedding: Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: conf, landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_shifted() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // 50 shared over 150 covered
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_drops_overlapping_lower_score() {
        let boxes = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = non_max_suppression(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_pixel_rect_clipped_to_image() {
        let b = make_bbox(-10.0, 5.5, 50.0, 200.0, 1.0);
        assert_eq!(b.pixel_rect(30, 100), Some((0, 5, 30, 95)));
    }

    #[test]
    fn test_pixel_rect_outside_image() {
        let b = make_bbox(40.0, 40.0, 10.0, 10.0, 1.0);
        assert_eq!(b.pixel_rect(30, 30), None);
    }

    #[test]
    fn test_normalized_embedding_has_unit_norm() {
        let e = Embedding::normalized(vec![3.0, 4.0], "test");
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
        assert_eq!(e.model_version.as_deref(), Some("test"));
    }

    #[test]
    fn test_normalized_zero_vector_unchanged() {
        let e = Embedding::normalized(vec![0.0, 0.0], "test");
        assert_eq!(e.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding { values: vec![0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![3.0, 4.0], model_version: None };
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-12);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }
}
