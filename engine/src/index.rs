//! Embedding index: nearest-neighbour lookup over cache entry embeddings
//!
//! The orchestrator only sees the `EmbeddingIndex` trait, so a deployment can
//! swap the exact linear scan for the HNSW graph (`hnsw_index`) through
//! configuration. Approximate recall is acceptable: every candidate is still
//! gated by the confidence threshold downstream.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::config::{IndexBackend, IndexConfig};
use crate::error::IndexError;
use crate::hnsw_index::HnswEmbeddingIndex;
use crate::schema::{CacheEntry, EntryId};
use crate::vector::{cosine_similarity, l2_norm};

/// One search hit: the entry it points to and its cosine similarity to the query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub entry_id: EntryId,
    pub similarity: f32,
}

/// Nearest-neighbour search over fixed-dimension vectors
pub trait EmbeddingIndex: Send + Sync {
    /// Index `vector` under `entry_id`.
    ///
    /// Fails with `DuplicateKey` when the entry is already indexed.
    fn insert(&self, entry_id: EntryId, vector: &[f32]) -> Result<(), IndexError>;

    /// Up to `k` neighbours with similarity >= `min_similarity`, best first
    fn nearest_neighbors(
        &self,
        vector: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<Neighbor>, IndexError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimension(&self) -> usize;

    /// Backend name (for metrics/logging)
    fn name(&self) -> &str;
}

/// Build the configured backend
pub fn build_index(
    config: &IndexConfig,
    dimension: usize,
) -> Result<Box<dyn EmbeddingIndex>, IndexError> {
    match config.backend {
        IndexBackend::Linear => Ok(Box::new(LinearScanIndex::new(dimension))),
        IndexBackend::Hnsw => Ok(Box::new(HnswEmbeddingIndex::from_config(
            dimension, config,
        )?)),
    }
}

/// Load persisted entries into an index at startup.
///
/// Entries already present are skipped. Returns the number inserted.
pub fn load_entries(index: &dyn EmbeddingIndex, entries: &[CacheEntry]) -> Result<usize, IndexError> {
    let mut inserted = 0;
    for entry in entries {
        match index.insert(entry.id, &entry.embedding) {
            Ok(()) => inserted += 1,
            Err(IndexError::DuplicateKey(id)) => {
                debug!(entry_id = id, "entry already indexed, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(inserted)
}

/// Reject vectors that cannot take part in a cosine comparison
pub(crate) fn validate_vector(vector: &[f32], dimension: usize) -> Result<(), IndexError> {
    if vector.len() != dimension {
        return Err(IndexError::DimensionMismatch {
            expected: dimension,
            got: vector.len(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(IndexError::InvalidVector("non-finite component".to_string()));
    }
    if l2_norm(vector) == 0.0 {
        return Err(IndexError::InvalidVector("zero-norm vector".to_string()));
    }
    Ok(())
}

/// Sort best-first (ties broken by entry id for determinism), filter and truncate
pub(crate) fn rank(mut hits: Vec<Neighbor>, k: usize, min_similarity: f32) -> Vec<Neighbor> {
    hits.retain(|n| n.similarity >= min_similarity);
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.entry_id.cmp(&b.entry_id))
    });
    hits.truncate(k);
    hits
}

/// Exact brute-force index
///
/// # Thread Safety
/// A single RwLock guards both the vector list and the id → slot map so an
/// insert is never half-visible to a concurrent search.
///
/// # Performance
/// O(n × d) per search. Fine up to tens of thousands of cached queries;
/// beyond that switch `index.backend` to `hnsw`.
pub struct LinearScanIndex {
    state: RwLock<LinearState>,
    dimension: usize,
}

struct LinearState {
    vectors: Vec<(EntryId, Vec<f32>)>,
    slots: HashMap<EntryId, usize>,
}

impl LinearScanIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            state: RwLock::new(LinearState {
                vectors: Vec::new(),
                slots: HashMap::new(),
            }),
            dimension,
        }
    }
}

impl EmbeddingIndex for LinearScanIndex {
    fn insert(&self, entry_id: EntryId, vector: &[f32]) -> Result<(), IndexError> {
        validate_vector(vector, self.dimension)?;

        let mut state = self.state.write();
        if state.slots.contains_key(&entry_id) {
            return Err(IndexError::DuplicateKey(entry_id));
        }
        let slot = state.vectors.len();
        state.vectors.push((entry_id, vector.to_vec()));
        state.slots.insert(entry_id, slot);
        Ok(())
    }

    fn nearest_neighbors(
        &self,
        vector: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<Neighbor>, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        let hits = state
            .vectors
            .iter()
            .map(|(entry_id, stored)| Neighbor {
                entry_id: *entry_id,
                similarity: cosine_similarity(vector, stored),
            })
            .collect();

        Ok(rank(hits, k, min_similarity))
    }

    fn len(&self) -> usize {
        self.state.read().vectors.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "linear"
    }
}
