//! Similarity primitives: cosine similarity/distance, box overlap and centroids.
//!
//! Degenerate input never errors here. Mismatched or zero vectors score a
//! similarity of 0 and degenerate boxes contribute zero area; callers that
//! need stricter checks validate before calling.

use serde::{Deserialize, Serialize};

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// `1 - cosine_similarity`. Lower is closer.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Scale a vector to unit length in place. Returns false for a zero vector.
pub fn normalize(v: &mut [f32]) -> bool {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Mean of a set of vectors, re-normalized to unit length.
///
/// Empty vectors are skipped, as are vectors whose length differs from the
/// first usable one. Returns `None` when nothing usable remains or the mean
/// is the zero vector.
pub fn centroid<'a, I>(vectors: I) -> Option<Vec<f32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Option<Vec<f32>> = None;

    for v in vectors {
        if v.is_empty() {
            continue;
        }
        match sum {
            None => sum = Some(v.to_vec()),
            Some(ref mut acc) => {
                if acc.len() != v.len() {
                    continue;
                }
                for (a, x) in acc.iter_mut().zip(v) {
                    *a += x;
                }
            }
        }
    }

    // Normalizing the sum gives the same direction as normalizing the mean.
    let mut mean = sum?;
    if normalize(&mut mean) {
        Some(mean)
    } else {
        None
    }
}

/// Axis-aligned box in relative image coordinates (0-1).
///
/// Stored as origin plus size, the way the photo server reports markers.
/// Serialized as a `[x, y, width, height]` array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from corner coordinates `(x_min, y_min, x_max, y_max)`.
    pub fn from_corners(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self::new(x_min, y_min, x_max - x_min, y_max - y_min)
    }

    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (self.x, self.y, self.x + self.width, self.y + self.height)
    }

    /// Area, or 0 for a box with non-positive width or height.
    pub fn area(&self) -> f32 {
        let (x_min, y_min, x_max, y_max) = self.corners();
        if x_max <= x_min || y_max <= y_min {
            return 0.0;
        }
        (x_max - x_min) * (y_max - y_min)
    }

    /// True when every corner lies within [0, 1] and all values are finite.
    pub fn is_relative(&self) -> bool {
        let (x_min, y_min, x_max, y_max) = self.corners();
        [x_min, y_min, x_max, y_max]
            .iter()
            .all(|c| c.is_finite() && (0.0..=1.0).contains(c))
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

/// Intersection area over union area, in [0, 1].
pub fn intersection_over_union(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a == 0.0 || area_b == 0.0 {
        return 0.0;
    }

    let (ax0, ay0, ax1, ay1) = a.corners();
    let (bx0, by0, bx1, by1) = b.corners();

    let ix = (ax1.min(bx1) - ax0.max(bx0)).max(0.0);
    let iy = (ay1.min(by1) - ay0.max(by0)).max(0.0);
    let intersection = ix * iy;
    if intersection == 0.0 {
        return 0.0;
    }

    let union = area_a + area_b - intersection;
    (intersection / union).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - (-1.0)).abs() < 0.0001);
    }

    #[test]
    fn test_self_similarity_is_one() {
        let v = vec![0.3, -1.7, 2.2, 0.01, 5.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < EPS);
        assert!(cosine_distance(&v, &v).abs() < EPS);
    }

    #[test]
    fn test_similarity_is_symmetric_and_bounded() {
        let pairs = [
            (vec![1.0, 2.0, 3.0], vec![-4.0, 0.5, 9.0]),
            (vec![0.1, 0.1], vec![100.0, 100.0]),
            (vec![-1.0, -1.0, 0.0], vec![1.0, 1.0, 0.0]),
        ];
        for (a, b) in pairs.iter() {
            let ab = cosine_similarity(a, b);
            let ba = cosine_similarity(b, a);
            assert_eq!(ab, ba);
            assert!((-1.0..=1.0).contains(&ab));
        }
    }

    #[test]
    fn test_degenerate_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 1.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 1.0]), 1.0);
    }

    #[test]
    fn test_centroid_is_unit_mean() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let c = centroid([a.as_slice(), b.as_slice()]).unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((c[0] - expected).abs() < EPS);
        assert!((c[1] - expected).abs() < EPS);
    }

    #[test]
    fn test_centroid_edge_cases() {
        assert!(centroid(std::iter::empty::<&[f32]>()).is_none());

        let single = vec![3.0, 4.0];
        let c = centroid([single.as_slice()]).unwrap();
        assert!((c[0] - 0.6).abs() < EPS);
        assert!((c[1] - 0.8).abs() < EPS);

        // Opposite vectors cancel out
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!(centroid([a.as_slice(), b.as_slice()]).is_none());

        // Empty and mismatched vectors are skipped
        let empty: Vec<f32> = Vec::new();
        let odd = vec![1.0, 2.0, 3.0];
        let c = centroid([empty.as_slice(), single.as_slice(), odd.as_slice()]).unwrap();
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        assert!((intersection_over_union(&a, &a) - 1.0).abs() < EPS);

        let b = BoundingBox::new(0.6, 0.6, 0.2, 0.2);
        assert_eq!(intersection_over_union(&a, &b), 0.0);

        // Touching edges do not overlap
        let d = BoundingBox::new(0.25, 0.25, 0.25, 0.25);
        let e = BoundingBox::new(0.5, 0.25, 0.25, 0.25);
        assert_eq!(intersection_over_union(&d, &e), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BoundingBox::from_corners(0.0, 0.0, 0.4, 0.4);
        let b = BoundingBox::from_corners(0.2, 0.0, 0.6, 0.4);
        // intersection 0.08, union 0.24
        assert!((intersection_over_union(&a, &b) - 1.0 / 3.0).abs() < EPS);
        assert_eq!(intersection_over_union(&a, &b), intersection_over_union(&b, &a));
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let a = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        let flat = BoundingBox::new(0.1, 0.1, 0.2, 0.0);
        let inverted = BoundingBox::from_corners(0.3, 0.3, 0.1, 0.1);
        assert_eq!(intersection_over_union(&a, &flat), 0.0);
        assert_eq!(intersection_over_union(&a, &inverted), 0.0);
        assert_eq!(intersection_over_union(&flat, &flat), 0.0);
    }

    #[test]
    fn test_bbox_serializes_as_array() {
        let b = BoundingBox::new(0.25, 0.5, 0.125, 0.25);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[0.25,0.5,0.125,0.25]");
        let back: BoundingBox = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    #[test]
    fn test_bbox_relative_range() {
        assert!(BoundingBox::new(0.0, 0.0, 1.0, 1.0).is_relative());
        assert!(!BoundingBox::new(0.5, 0.5, 0.6, 0.1).is_relative());
        assert!(!BoundingBox::new(-0.1, 0.0, 0.2, 0.2).is_relative());
        assert!(!BoundingBox::new(f32::NAN, 0.0, 0.2, 0.2).is_relative());
    }
}
