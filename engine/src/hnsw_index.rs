//! HNSW embedding index for approximate k-NN search
//!
//! Thin wrapper around hnsw_rs with cosine distance and cache-entry ids.
//! hnsw_rs reports cosine *distance* (1 - similarity); this wrapper converts
//! back so callers compare against similarity thresholds directly.

use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::index::{rank, validate_vector, EmbeddingIndex, Neighbor};
use crate::schema::EntryId;

/// HNSW graph index over cache entry embeddings
///
/// Defaults: cosine distance, M=16, ef_construction=200
///
/// # Example
/// ```no_run
/// use promcache_engine::hnsw_index::HnswEmbeddingIndex;
/// use promcache_engine::index::EmbeddingIndex;
///
/// let index = HnswEmbeddingIndex::new(128, 10_000).unwrap();
/// index.insert(42, &vec![0.1; 128]).unwrap();
///
/// let hits = index.nearest_neighbors(&vec![0.1; 128], 3, 0.9).unwrap();
/// assert_eq!(hits[0].entry_id, 42);
/// ```
pub struct HnswEmbeddingIndex {
    graph: Arc<Hnsw<'static, f32, DistCosine>>,

    /// Ids present in the graph; the write lock also serializes inserts so
    /// the same id can never enter the graph twice
    ids: RwLock<HashSet<EntryId>>,

    dimension: usize,
    max_elements: usize,
    ef_search: Option<usize>,
}

impl HnswEmbeddingIndex {
    pub const DEFAULT_M: usize = 16;
    pub const DEFAULT_EF_CONSTRUCTION: usize = 200;

    /// Create a new index with default construction parameters
    pub fn new(dimension: usize, max_elements: usize) -> Result<Self, IndexError> {
        Self::with_params(
            dimension,
            max_elements,
            Self::DEFAULT_M,
            Self::DEFAULT_EF_CONSTRUCTION,
            None,
        )
    }

    pub fn from_config(dimension: usize, config: &IndexConfig) -> Result<Self, IndexError> {
        Self::with_params(
            dimension,
            config.max_elements,
            config.m,
            config.ef_construction,
            config.ef_search,
        )
    }

    /// Create a new index with explicit construction parameters.
    ///
    /// `m` controls graph connectivity (higher = better recall, more memory).
    /// `ef_construction` controls build quality (higher = better recall, slower build).
    pub fn with_params(
        dimension: usize,
        max_elements: usize,
        m: usize,
        ef_construction: usize,
        ef_search: Option<usize>,
    ) -> Result<Self, IndexError> {
        if dimension == 0 {
            return Err(IndexError::Backend("dimension must be > 0".to_string()));
        }
        if max_elements == 0 {
            return Err(IndexError::Backend("max_elements must be > 0".to_string()));
        }
        if m == 0 || ef_construction == 0 {
            return Err(IndexError::Backend(
                "HNSW m and ef_construction must be > 0".to_string(),
            ));
        }

        // max_layer follows the hnsw_rs convention
        let max_layer = 16.min((max_elements as f32).ln().ceil().max(1.0) as usize);

        let graph = Hnsw::<f32, DistCosine>::new(
            m,
            max_elements,
            max_layer,
            ef_construction,
            DistCosine {},
        );

        Ok(Self {
            graph: Arc::new(graph),
            ids: RwLock::new(HashSet::new()),
            dimension,
            max_elements,
            ef_search,
        })
    }

    pub fn capacity(&self) -> usize {
        self.max_elements
    }

    fn effective_ef(&self, k: usize, count: usize) -> usize {
        if let Some(ef) = self.ef_search {
            return ef.clamp(k.max(1), 10_000);
        }
        // Small graphs: explore aggressively so recall stays near-exact
        let mut ef = 200;
        if count <= 1024 {
            let target = (count.max(k) * 4).max(32);
            ef = ef.max(target.min(2048));
        }
        ef
    }
}

impl EmbeddingIndex for HnswEmbeddingIndex {
    fn insert(&self, entry_id: EntryId, vector: &[f32]) -> Result<(), IndexError> {
        validate_vector(vector, self.dimension)?;

        let origin_id = usize::try_from(entry_id)
            .map_err(|_| IndexError::Backend(format!("entry id {entry_id} exceeds usize")))?;

        let mut ids = self.ids.write();
        if ids.contains(&entry_id) {
            return Err(IndexError::DuplicateKey(entry_id));
        }
        if ids.len() >= self.max_elements {
            return Err(IndexError::Full(self.max_elements));
        }

        // hnsw_rs copies the slice internally
        self.graph.insert((vector, origin_id));
        ids.insert(entry_id);
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

        let count = self.ids.read().len();
        if k == 0 || count == 0 {
            return Ok(Vec::new());
        }

        let ef = self.effective_ef(k, count);
        let hits = self
            .graph
            .search(vector, k, ef)
            .into_iter()
            .filter(|n| n.distance.is_finite())
            .map(|n| Neighbor {
                entry_id: n.d_id as EntryId,
                similarity: (1.0 - n.distance).clamp(-1.0, 1.0),
            })
            .collect();

        Ok(rank(hits, k, min_similarity))
    }

    fn len(&self) -> usize {
        self.ids.read().len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hnsw"
    }
}
