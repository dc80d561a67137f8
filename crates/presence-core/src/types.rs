use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension of every face embedding in the system (ArcFace-style).
pub const EMBEDDING_DIM: usize = 512;

/// Opaque per-identity key/value bag, carried through from the remote index.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("expected {EMBEDDING_DIM}-dim embedding, got {0}")]
    DimensionMismatch(usize),
    #[error("embedding contains non-finite values")]
    NonFinite,
}

/// Unit-length face embedding.
///
/// The only way to build one is through [`Embedding::new`], which checks the
/// dimension and L2-normalizes, so every stored or compared vector has norm 1
/// (or is exactly zero).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::DimensionMismatch(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        Ok(Self {
            values: normalize(values),
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// L2 norm; 1.0 for anything but the zero vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1]. Both sides are unit length, so this is
    /// the dot product.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot.clamp(-1.0, 1.0)
    }

    /// Normalized mean of several embeddings. `None` for an empty slice.
    pub fn mean(embeddings: &[Embedding]) -> Option<Embedding> {
        if embeddings.is_empty() {
            return None;
        }
        let mut sum = vec![0.0f32; EMBEDDING_DIM];
        for e in embeddings {
            for (acc, v) in sum.iter_mut().zip(e.values.iter()) {
                *acc += v;
            }
        }
        let n = embeddings.len() as f32;
        sum.iter_mut().for_each(|v| *v /= n);
        Some(Embedding {
            values: normalize(sum),
        })
    }
}

fn normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}

/// Face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// One face found by the detector. The embedding is raw and may not be
/// normalized yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub embedding: Vec<f32>,
}

impl Detection {
    /// Largest face by bounding-box area.
    pub fn largest(detections: &[Detection]) -> Option<&Detection> {
        detections
            .iter()
            .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
    }
}

/// Which tier produced a [`MatchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Cache,
    Remote,
    None,
    Error,
}

impl std::fmt::Display for MatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchSource::Cache => "cache",
            MatchSource::Remote => "remote",
            MatchSource::None => "none",
            MatchSource::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of resolving one embedding to an identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: Option<String>,
    /// Similarity of the best candidate seen, in [-1, 1].
    pub score: f32,
    pub source: MatchSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MatchResult {
    pub fn unknown(source: MatchSource, score: f32) -> Self {
        Self {
            identity: None,
            score,
            source,
            metadata: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    /// Identity for display, "Unknown" when unmatched.
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or("Unknown")
    }
}

#[cfg(test)]
pub(crate) fn unit_vector(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[axis] = 1.0;
    v
}

/// Raw vector whose cosine similarity to `unit_vector(0)` is `cos`.
#[cfg(test)]
pub(crate) fn vector_at(cos: f32, other_axis: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[0] = cos;
    v[other_axis] = (1.0 - cos * cos).max(0.0).sqrt();
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes() {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        raw[0] = 3.0;
        raw[1] = 4.0;
        let e = Embedding::new(raw).unwrap();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
        assert!((e.values()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_new_rejects_wrong_dimension() {
        assert_eq!(
            Embedding::new(vec![1.0; 128]),
            Err(EmbeddingError::DimensionMismatch(128))
        );
    }

    #[test]
    fn test_new_rejects_nan() {
        let mut raw = unit_vector(0);
        raw[3] = f32::NAN;
        assert_eq!(Embedding::new(raw), Err(EmbeddingError::NonFinite));
    }

    #[test]
    fn test_zero_vector_stays_zero() {
        let e = Embedding::new(vec![0.0; EMBEDDING_DIM]).unwrap();
        assert_eq!(e.norm(), 0.0);
        let other = Embedding::new(unit_vector(0)).unwrap();
        assert_eq!(e.similarity(&other), 0.0);
    }

    #[test]
    fn test_similarity_identical_orthogonal_opposite() {
        let a = Embedding::new(unit_vector(0)).unwrap();
        let b = Embedding::new(unit_vector(1)).unwrap();
        let c = Embedding::new(unit_vector(0).iter().map(|v| -v).collect()).unwrap();
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.similarity(&c) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_ignores_scale() {
        let a = Embedding::new(vector_at(0.72, 5)).unwrap();
        let scaled: Vec<f32> = vector_at(0.72, 5).iter().map(|v| v * 40.0).collect();
        let b = Embedding::new(scaled).unwrap();
        let axis = Embedding::new(unit_vector(0)).unwrap();
        assert!((a.similarity(&axis) - 0.72).abs() < 1e-5);
        assert!((b.similarity(&axis) - 0.72).abs() < 1e-5);
    }

    #[test]
    fn test_mean_is_normalized() {
        let a = Embedding::new(unit_vector(0)).unwrap();
        let b = Embedding::new(unit_vector(1)).unwrap();
        let m = Embedding::mean(&[a, b]).unwrap();
        assert!((m.norm() - 1.0).abs() < 1e-6);
        let half = std::f32::consts::FRAC_1_SQRT_2;
        assert!((m.values()[0] - half).abs() < 1e-6);
        assert!(Embedding::mean(&[]).is_none());
    }

    #[test]
    fn test_largest_detection() {
        let det = |w: f32, h: f32| Detection {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: w, height: h },
            score: 0.9,
            embedding: vec![],
        };
        let faces = vec![det(10.0, 10.0), det(30.0, 20.0), det(5.0, 50.0)];
        assert_eq!(Detection::largest(&faces).unwrap().bbox.width, 30.0);
        assert!(Detection::largest(&[]).is_none());
    }

    #[test]
    fn test_match_source_serializes_lowercase() {
        let r = MatchResult::unknown(MatchSource::Error, 0.0);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["source"], "error");
        assert_eq!(r.label(), "Unknown");
    }
}
