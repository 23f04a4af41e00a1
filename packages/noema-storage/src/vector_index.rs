/// Persistent approximate-nearest-neighbor index over concept vectors
///
/// USearch-backed HNSW with cosine metric. The index file is loaded via mmap,
/// so startup with an existing index is proportional to mapping the file,
/// not rebuilding it; a cold start builds from the snapshot's vectors.
/// A bincode sidecar persists the internal-key to ConceptId mapping.
///
/// Mutations come from a single writer (the reconciler); readers may observe
/// an index at most one reconciliation cycle behind the snapshot.
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

use crate::error::EngineError;
use crate::types::ConceptId;

/// Results below this cosine similarity are pruned from search output
const SIMILARITY_FLOOR: f32 = 0.0;

#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Vector dimension; fixed per deployment
    pub dimension: usize,
    /// Max neighbors (M parameter)
    pub max_neighbors: usize,
    /// Construction beam width (ef_construction)
    pub ef_construction: usize,
}

impl VectorIndexConfig {
    pub fn for_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            max_neighbors: 16,
            ef_construction: 200,
        }
    }
}

/// Metadata sidecar for persistence
#[derive(serde::Serialize, serde::Deserialize)]
struct IndexMetadata {
    id_mapping: HashMap<u64, ConceptId>,
    next_key: u64,
    version: u32,
}

struct IndexInner {
    index: Option<Index>,
    id_mapping: HashMap<u64, ConceptId>,
    reverse_mapping: HashMap<ConceptId, u64>,
    next_key: u64,
    dirty: bool,
}

/// HNSW vector index with single-file persistence
pub struct VectorIndex {
    base_path: PathBuf,
    config: VectorIndexConfig,
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    pub fn new<P: AsRef<Path>>(base_path: P, config: VectorIndexConfig) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            config,
            inner: RwLock::new(IndexInner {
                index: None,
                id_mapping: HashMap::new(),
                reverse_mapping: HashMap::new(),
                next_key: 0,
                dirty: false,
            }),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.base_path.with_extension("usearch")
    }

    fn metadata_path(&self) -> PathBuf {
        self.base_path.with_extension("usearch.meta")
    }

    fn make_index(&self) -> Result<Index> {
        Index::new(&IndexOptions {
            dimensions: self.config.dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: self.config.max_neighbors,
            expansion_add: self.config.ef_construction,
            expansion_search: 40,
            multi: false,
        })
        .context("Failed to create vector index")
    }

    /// Load the persisted index if present, otherwise build from `vectors`
    pub fn load_or_build(&self, vectors: &HashMap<ConceptId, Vec<f32>>) -> Result<()> {
        let index_path = self.index_path();
        let metadata_path = self.metadata_path();
        let start = Instant::now();

        if index_path.exists() && metadata_path.exists() {
            let data = std::fs::read(&metadata_path).context("Failed to read index metadata")?;
            let metadata: IndexMetadata =
                bincode::deserialize(&data).context("Failed to decode index metadata")?;
            if metadata.version != 1 {
                anyhow::bail!("Unknown vector index metadata version {}", metadata.version);
            }

            let index = self.make_index()?;
            index
                .load(index_path.to_str().unwrap_or_default())
                .context("Failed to load index from disk")?;

            let loaded = index.size();
            tracing::info!(
                "Loaded vector index: {} vectors in {:.1}ms",
                loaded,
                start.elapsed().as_secs_f64() * 1000.0
            );

            let mut inner = self.inner.write();
            inner.reverse_mapping = metadata
                .id_mapping
                .iter()
                .map(|(k, id)| (*id, *k))
                .collect();
            inner.id_mapping = metadata.id_mapping;
            inner.next_key = metadata.next_key;
            inner.index = Some(index);
            inner.dirty = false;
            drop(inner);

            // Catch up on vectors learned since the index was last saved
            for (id, vector) in vectors {
                if !self.contains(id) {
                    self.insert(*id, vector)?;
                }
            }
            return Ok(());
        }

        // Cold start: build from snapshot vectors
        let index = self.make_index()?;
        if !vectors.is_empty() {
            index
                .reserve(vectors.len())
                .context("Failed to reserve index capacity")?;
        }

        let mut inner = self.inner.write();
        for (concept_id, vector) in vectors {
            if vector.len() != self.config.dimension {
                tracing::warn!(
                    "Skipping vector for {}: dimension {} != {}",
                    concept_id,
                    vector.len(),
                    self.config.dimension
                );
                continue;
            }
            let key = inner.next_key;
            index
                .add(key, vector)
                .context("Failed to add vector to index")?;
            inner.id_mapping.insert(key, *concept_id);
            inner.reverse_mapping.insert(*concept_id, key);
            inner.next_key += 1;
        }
        inner.dirty = !inner.id_mapping.is_empty();
        inner.index = Some(index);

        tracing::info!(
            "Built vector index: {} vectors in {:.1}ms",
            inner.id_mapping.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(())
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.inner.read().reverse_mapping.contains_key(id)
    }

    /// Add or replace a vector. Fails if the length differs from the
    /// deployment dimension; the vector does not enter the index.
    pub fn insert(&self, concept_id: ConceptId, vector: &[f32]) -> Result<(), EngineError> {
        if vector.len() != self.config.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }

        let mut inner = self.inner.write();
        if inner.index.is_none() {
            let index = self
                .make_index()
                .map_err(|e| EngineError::Corruption(e.to_string()))?;
            inner.index = Some(index);
        }

        // Replace semantics: drop the old entry before adding the new one
        if let Some(old_key) = inner.reverse_mapping.remove(&concept_id) {
            inner.id_mapping.remove(&old_key);
            if let Some(index) = inner.index.as_ref() {
                let _ = index.remove(old_key);
            }
        }

        let key = inner.next_key;
        inner.next_key += 1;
        let capacity = inner.id_mapping.len() + 1;

        {
            let index = inner.index.as_ref().expect("index initialized above");
            index
                .reserve(capacity)
                .and_then(|_| index.add(key, vector))
                .map_err(|e| EngineError::Corruption(format!("index insert failed: {}", e)))?;
        }

        inner.id_mapping.insert(key, concept_id);
        inner.reverse_mapping.insert(concept_id, key);
        inner.dirty = true;

        Ok(())
    }

    /// Remove a concept's vector from the index
    pub fn remove(&self, concept_id: &ConceptId) {
        let mut inner = self.inner.write();
        if let Some(key) = inner.reverse_mapping.remove(concept_id) {
            inner.id_mapping.remove(&key);
            if let Some(index) = inner.index.as_ref() {
                let _ = index.remove(key);
            }
            inner.dirty = true;
        }
    }

    /// k nearest neighbors by cosine similarity, best first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>, EngineError> {
        if query.len() != self.config.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.dimension,
                actual: query.len(),
            });
        }

        let inner = self.inner.read();
        let Some(index) = inner.index.as_ref() else {
            return Ok(Vec::new());
        };

        let matches = index
            .search(query, k)
            .map_err(|e| EngineError::Corruption(format!("index search failed: {}", e)))?;

        let mut results: Vec<(ConceptId, f32)> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(key, distance)| {
                inner.id_mapping.get(key).map(|concept_id| {
                    // Cosine distance -> cosine similarity
                    (*concept_id, 1.0 - distance.min(1.0))
                })
            })
            .filter(|(_, similarity)| *similarity > SIMILARITY_FLOOR)
            .collect();

        results.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(results)
    }

    /// Save the index file and metadata sidecar if anything changed
    pub fn persist(&self) -> Result<()> {
        let inner = self.inner.read();
        if !inner.dirty {
            return Ok(());
        }
        let Some(index) = inner.index.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = self.index_path().parent() {
            std::fs::create_dir_all(parent)?;
        }

        index
            .save(self.index_path().to_str().unwrap_or_default())
            .context("Failed to save vector index")?;

        let metadata = IndexMetadata {
            id_mapping: inner.id_mapping.clone(),
            next_key: inner.next_key,
            version: 1,
        };
        let encoded = bincode::serialize(&metadata).context("Failed to encode index metadata")?;
        std::fs::write(self.metadata_path(), encoded).context("Failed to write index metadata")?;

        drop(inner);
        self.inner.write().dirty = false;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().id_mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }
}
