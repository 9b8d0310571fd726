//! Similarity scoring for unit-normalized embeddings

/// Compute the dot product of two equal-length slices
pub fn dot_product(v1: &[f32], v2: &[f32]) -> f32 {
    v1.iter().zip(v2.iter()).map(|(a, b)| a * b).sum()
}

/// Cosine similarity of two already-normalized vectors, clamped to [-1, 1]
/// to absorb floating point drift.
pub fn cosine_similarity(v1: &[f32], v2: &[f32]) -> f32 {
    dot_product(v1, v2).clamp(-1.0, 1.0)
}

/// Convert a cosine score into the percentage reported to service clients.
pub fn similarity_percent(score: f32) -> f32 {
    score * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dot_product() {
        let dot = dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        assert_relative_eq!(dot, 32.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_identical() {
        let v = [0.6, 0.8];
        assert_relative_eq!(cosine_similarity(&v, &v), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert_relative_eq!(
            cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]),
            0.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_cosine_opposite() {
        assert_relative_eq!(
            cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]),
            -1.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_cosine_clamps_drift() {
        assert_eq!(cosine_similarity(&[1.000001, 0.0], &[1.000001, 0.0]), 1.0);
    }

    #[test]
    fn test_similarity_percent() {
        assert_relative_eq!(similarity_percent(0.875), 87.5, epsilon = 1e-4);
    }
}
