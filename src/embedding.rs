//! Face embedding type

use crate::error::{FaceMatchError, Result};
use serde::{Deserialize, Serialize};

/// Norms below this are treated as zero; their direction is meaningless.
pub const MIN_NORM: f32 = 1e-6;

/// A face embedding produced by the external model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    data: Vec<f32>,
}

impl Embedding {
    /// Create an embedding from raw model output
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Get the dimension of the embedding
    pub fn dimension(&self) -> usize {
        self.data.len()
    }

    /// Get the underlying data as a slice
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Consume the embedding, returning its components
    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }

    /// Compute the L2 norm of the embedding
    pub fn norm(&self) -> f32 {
        l2_norm(&self.data)
    }

    /// Fail with `DimensionMismatch` unless the embedding has `expected` components.
    pub fn check_dimension(&self, expected: usize) -> Result<()> {
        if self.dimension() != expected {
            return Err(FaceMatchError::DimensionMismatch {
                expected,
                actual: self.dimension(),
            });
        }
        Ok(())
    }

    /// Normalize the embedding to unit length
    pub fn normalize(&mut self) -> Result<()> {
        normalize_in_place(&mut self.data)
    }

    /// Create a normalized copy of the embedding
    pub fn normalized(&self) -> Result<Embedding> {
        let mut e = self.clone();
        e.normalize()?;
        Ok(e)
    }

    /// Parse an embedding from a comma-separated string
    pub fn parse_csv(s: &str) -> Result<Self> {
        let data: Result<Vec<f32>> = s
            .split(',')
            .map(|x| {
                x.trim()
                    .parse::<f32>()
                    .map_err(|_| FaceMatchError::InvalidVector {
                        reason: format!("Invalid float: {}", x),
                    })
            })
            .collect();
        Ok(Embedding::new(data?))
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(data: Vec<f32>) -> Self {
        Self::new(data)
    }
}

/// L2 norm of a raw slice.
pub fn l2_norm(data: &[f32]) -> f32 {
    data.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `data` to unit length, rejecting near-zero and non-finite vectors.
pub fn normalize_in_place(data: &mut [f32]) -> Result<()> {
    let norm = l2_norm(data);
    if !norm.is_finite() {
        return Err(FaceMatchError::InvalidVector {
            reason: "Vector contains non-finite components".to_string(),
        });
    }
    if norm < MIN_NORM {
        return Err(FaceMatchError::InvalidVector {
            reason: "Cannot normalize zero vector".to_string(),
        });
    }
    for x in data.iter_mut() {
        *x /= norm;
    }
    Ok(())
}
