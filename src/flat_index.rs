//! Flat inner-product index: O(n) k-NN search over unit vectors
//!
//! Vectors live in one contiguous arena addressed by insertion position.
//! There is no in-place removal: dropping entries means building a new arena
//! from the survivors with [`VectorIndex::rebuild`].

use rayon::prelude::*;

use crate::distance::dot_product;
use crate::embedding::normalize_in_place;
use crate::error::{FaceMatchError, Result};

/// Arenas at least this large are scored on the rayon pool.
const PARALLEL_THRESHOLD: usize = 4096;

/// A brute-force index that scores the query against every stored vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    /// Create a new empty index for vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    /// Create an empty index with room for `capacity` vectors.
    pub fn with_capacity(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            data: Vec::with_capacity(dimension * capacity),
        }
    }

    /// Wrap an arena of already-normalized vectors, e.g. one read back from a snapshot.
    pub fn from_normalized(dimension: usize, data: Vec<f32>) -> Result<Self> {
        if dimension == 0 {
            return Err(FaceMatchError::InvalidVector {
                reason: "Index dimension must be non-zero".to_string(),
            });
        }
        if data.len() % dimension != 0 {
            return Err(FaceMatchError::DimensionMismatch {
                expected: dimension,
                actual: data.len() % dimension,
            });
        }
        Ok(Self { dimension, data })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Normalize and append a vector, returning its position.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize> {
        if vector.len() != self.dimension {
            return Err(FaceMatchError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut unit = vector.to_vec();
        normalize_in_place(&mut unit)?;
        self.data.extend_from_slice(&unit);
        Ok(self.len() - 1)
    }

    /// Replace the whole arena with `vectors`. On error the index is left unchanged.
    pub fn rebuild<'a, I>(&mut self, vectors: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let mut fresh = VectorIndex::new(self.dimension);
        for v in vectors {
            fresh.add(v)?;
        }
        *self = fresh;
        Ok(())
    }

    /// Get the stored (normalized) vector at `position`.
    pub fn get(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Iterate stored vectors in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension.max(1))
    }

    /// Raw arena, `len() * dimension()` floats.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Return up to `k` `(position, cosine score)` pairs, best first.
    /// Equal scores keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dimension {
            return Err(FaceMatchError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut unit = query.to_vec();
        normalize_in_place(&mut unit)?;

        let scores: Vec<f32> = if self.len() >= PARALLEL_THRESHOLD {
            self.data
                .par_chunks_exact(self.dimension)
                .map(|v| dot_product(&unit, v))
                .collect()
        } else {
            self.iter().map(|v| dot_product(&unit, v)).collect()
        };

        if k == 1 {
            let mut best = (0, scores[0]);
            for (pos, &score) in scores.iter().enumerate().skip(1) {
                if score.total_cmp(&best.1).is_gt() {
                    best = (pos, score);
                }
            }
            return Ok(vec![best]);
        }

        let mut results: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
        results.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }
}
