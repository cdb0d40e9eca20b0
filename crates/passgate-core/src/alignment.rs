//! Five-point face alignment onto the canonical ArcFace crop.
//!
//! A 4-DOF similarity (scale, rotation, translation) is fitted in closed form
//! from detected landmarks to the InsightFace reference points, then applied
//! with a bilinear warp.

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// ArcFace reference landmarks for a 112×112 crop.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Least-squares similarity `[a, -b, tx, b, a, ty]` mapping `src` onto `dst`:
///
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
///
/// `None` when the source points are coincident.
fn fit_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<[f32; 6]> {
    let n = src.len() as f32;
    let centroid = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (scx, scy) = centroid(src);
    let (dcx, dcy) = centroid(dst);

    let mut spread = 0.0f32;
    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (px, py) = (sx - scx, sy - scy);
        let (qx, qy) = (dx - dcx, dy - dcy);
        spread += px * px + py * py;
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
    }

    if spread < 1e-6 {
        return None;
    }

    let a = dot / spread;
    let b = cross / spread;
    let tx = dcx - (a * scx - b * scy);
    let ty = dcy - (b * scx + a * scy);
    Some([a, -b, tx, b, a, ty])
}

/// Warp the face described by `landmarks` into a 112×112 aligned crop.
///
/// Pixels that fall outside the source frame are black. Returns `None` for
/// degenerate landmarks.
pub fn align_face(frame: &GrayImage, landmarks: &[(f32, f32); 5]) -> Option<GrayImage> {
    let m = fit_similarity(landmarks, &REFERENCE_LANDMARKS_112)?;
    let projection = Projection::from_matrix([m[0], m[1], m[2], m[3], m[4], m[5], 0.0, 0.0, 1.0])?;

    let mut aligned = GrayImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    warp_into(frame, &projection, Interpolation::Bilinear, Luma([0]), &mut aligned);
    Some(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(m: &[f32; 6], (x, y): (f32, f32)) -> (f32, f32) {
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    #[test]
    fn test_fit_identity() {
        let m = fit_similarity(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112).unwrap();
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        for (got, want) in m.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-4, "{m:?}");
        }
    }

    #[test]
    fn test_fit_recovers_scale_and_translation() {
        // Landmarks at half scale, shifted by (10, 20).
        let src: [(f32, f32); 5] =
            std::array::from_fn(|i| {
                let (x, y) = REFERENCE_LANDMARKS_112[i];
                (x * 0.5 + 10.0, y * 0.5 + 20.0)
            });
        let m = fit_similarity(&src, &REFERENCE_LANDMARKS_112).unwrap();
        for i in 0..5 {
            let (x, y) = apply(&m, src[i]);
            let (rx, ry) = REFERENCE_LANDMARKS_112[i];
            assert!((x - rx).abs() < 1e-2 && (y - ry).abs() < 1e-2);
        }
        assert!((m[0] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_rotation() {
        // Rotate the reference 90° about the origin: (x, y) -> (-y, x).
        let src: [(f32, f32); 5] = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS_112[i];
            (-y, x)
        });
        let m = fit_similarity(&src, &REFERENCE_LANDMARKS_112).unwrap();
        for i in 0..5 {
            let (x, y) = apply(&m, src[i]);
            let (rx, ry) = REFERENCE_LANDMARKS_112[i];
            assert!((x - rx).abs() < 1e-2 && (y - ry).abs() < 1e-2);
        }
    }

    #[test]
    fn test_fit_degenerate_points() {
        let src = [(5.0, 5.0); 5];
        assert!(fit_similarity(&src, &REFERENCE_LANDMARKS_112).is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = GrayImage::from_pixel(200, 200, Luma([90]));
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        // Identity warp over a uniform frame keeps the interior uniform.
        assert_eq!(aligned.get_pixel(56, 56)[0], 90);
    }
}
