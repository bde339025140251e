use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box produced by a detector collaborator.
///
/// Coordinates are pixels in the frame the detector was given; `area_ratio`
/// is box area divided by full frame area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub area_ratio: f32,
}

impl BoxDetection {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Box aspect as width / height.
    pub fn aspect(&self) -> f32 {
        self.width() / self.height().max(1.0)
    }

    /// Corners normalized to [0, 1] against the given frame dimensions.
    pub fn normalized(&self, frame_width: u32, frame_height: u32) -> [f32; 4] {
        let w = (frame_width as f32).max(1.0);
        let h = (frame_height as f32).max(1.0);
        [self.x1 / w, self.y1 / h, self.x2 / w, self.y2 / h]
    }

    pub fn as_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// L2-normalized face embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Normalize a raw model output vector. A zero vector is kept as-is.
    pub fn from_raw(raw: Vec<f32>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Cosine similarity: the dot product of two normalized vectors, in [-1, 1].
    pub fn similarity(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_identical_is_one() {
        let a = Embedding::from_raw(vec![3.0, 4.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_orthogonal_is_zero() {
        let a = Embedding::from_raw(vec![1.0, 0.0]);
        let b = Embedding::from_raw(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn similarity_opposite_is_minus_one() {
        let a = Embedding::from_raw(vec![2.0, 0.0]);
        let b = Embedding::from_raw(vec![-5.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_stays_zero() {
        let a = Embedding::from_raw(vec![0.0, 0.0]);
        let b = Embedding::from_raw(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn from_raw_normalizes() {
        let a = Embedding::from_raw(vec![3.0, 4.0]);
        let norm: f32 = a.values().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bbox_derived_metrics() {
        let b = BoxDetection {
            x1: 10.0,
            y1: 20.0,
            x2: 110.0,
            y2: 70.0,
            confidence: 0.9,
            area_ratio: 0.1,
        };
        assert_eq!(b.width(), 100.0);
        assert_eq!(b.height(), 50.0);
        assert_eq!(b.area(), 5000.0);
        assert_eq!(b.center(), (60.0, 45.0));
        assert!((b.aspect() - 2.0).abs() < 1e-6);
        let n = b.normalized(200, 100);
        assert_eq!(n, [0.05, 0.2, 0.55, 0.7]);
    }
}
