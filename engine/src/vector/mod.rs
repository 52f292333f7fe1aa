//! Vector math shared by the embedding index backends

pub mod distance;

pub use distance::{cosine_similarity, l2_norm};
