use super::embedding::FeatureVector;
use super::error::VisionError;

/// Dot product of two unit vectors, clamped to [0, 1].
pub fn try_similarity(a: &FeatureVector, b: &FeatureVector) -> Result<f32, VisionError> {
    if a.len() != b.len() {
        return Err(VisionError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let dot: f32 = a
        .as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(x, y)| x * y)
        .sum();
    if !dot.is_finite() {
        return Ok(0.0);
    }
    Ok(dot.clamp(0.0, 1.0))
}

/// Never fails: mismatched dimensions score 0.
pub fn similarity(a: &FeatureVector, b: &FeatureVector) -> f32 {
    match try_similarity(a, b) {
        Ok(score) => score,
        Err(e) => {
            log::debug!("similarity skipped: {}", e);
            0.0
        }
    }
}
