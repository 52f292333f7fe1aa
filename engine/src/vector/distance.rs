//! Cosine similarity over f32 embeddings
//!
//! Embedding dimensions in this system are in the hundreds to low thousands
//! (384, 768, 1536), so a single fused pass computing the dot product and
//! both norms together is enough. Zero vectors have similarity 0.0 instead
//! of NaN so they never qualify as neighbours.

/// Cosine similarity `dot(a, b) / (|a| * |b|)`, clamped to [-1.0, 1.0]
///
/// Returns 0.0 for mismatched lengths, empty inputs and zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_finite() {
        similarity.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Euclidean norm of a vector
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}
