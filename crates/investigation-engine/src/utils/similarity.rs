use crate::utils::error::{EngineError, EngineResult};

/// Dot product and both squared norms in one pass over the pair.
fn accumulate(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    a.iter()
        .zip(b)
        .fold((0.0, 0.0, 0.0), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        })
}

/// Cosine of the angle between two embeddings, in [-1, 1].
///
/// Vectors from different models (different lengths) are an error rather
/// than a silent zero. An all-zero vector scores 0 against anything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> EngineResult<f32> {
    if a.len() != b.len() {
        return Err(EngineError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    if a.is_empty() {
        return Err(EngineError::validation("Embedding vectors cannot be empty"));
    }

    let (dot, norm_a, norm_b) = accumulate(a, b);
    let denom = (norm_a * norm_b).sqrt();
    if denom == 0.0 {
        return Ok(0.0);
    }

    Ok((dot / denom).clamp(-1.0, 1.0))
}

/// Two exchange embeddings count as the same content at or above `threshold`.
pub fn is_near_duplicate(a: &[f32], b: &[f32], threshold: f32) -> EngineResult<bool> {
    Ok(cosine_similarity(a, b)? >= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_vector_is_identical() {
        let sim = cosine_similarity(&[0.5, 1.0, 1.5], &[2.0, 4.0, 6.0]).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).unwrap().abs() < 1e-6);
        let opposite = cosine_similarity(&[1.0, -2.0], &[-1.0, 2.0]).unwrap();
        assert!((opposite + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_models_rejected() {
        assert!(matches!(
            cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]),
            Err(EngineError::DimensionMismatch { expected: 2, actual: 3 })
        ));
        assert!(cosine_similarity(&[], &[]).is_err());
    }

    #[test]
    fn test_zero_embedding_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0; 4], &[1.0, 2.0, 3.0, 4.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_near_duplicate_threshold() {
        let a = [1.0, 0.0, 0.0];
        let close = [1.0, 0.05, 0.0];
        let apart = [1.0, 1.0, 0.0];
        assert!(is_near_duplicate(&a, &close, 0.95).unwrap());
        assert!(!is_near_duplicate(&a, &apart, 0.95).unwrap());
        assert!(is_near_duplicate(&a, &a, 1.0).unwrap());
    }
}
