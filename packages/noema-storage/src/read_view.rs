/// Immutable read view for zero-contention graph traversal
///
/// Readers load the current snapshot and keep it for the duration of their
/// work; the reconciler publishes a successor by a single atomic swap. The
/// snapshot is backed by persistent maps, so successive versions share most
/// of their structure and cloning for mutation is cheap.
use crate::semantic::SemanticType;
use crate::types::{AssociationEdge, AssociationType, ConceptId};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// In-memory concept with co-located outgoing edges
#[derive(Debug, Clone)]
pub struct ConceptNode {
    pub id: ConceptId,
    pub content: Arc<[u8]>,
    pub vector: Option<Arc<[f32]>>,
    pub strength: f32,
    pub confidence: f32,
    pub created: u64,
    pub last_accessed: u64,
    pub access_count: u32,
    pub semantic: Option<SemanticType>,
    /// Outgoing edges, deduplicated by (target, type)
    pub edges: Vec<AssociationEdge>,
}

impl ConceptNode {
    pub fn new(
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            content: Arc::from(content),
            vector: vector.map(Arc::from),
            strength,
            confidence,
            created: timestamp,
            last_accessed: timestamp,
            access_count: 0,
            semantic: None,
            edges: Vec::new(),
        }
    }

    /// Insert or reinforce an edge, keyed by (target, type)
    pub fn upsert_edge(
        &mut self,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
        timestamp: u64,
    ) {
        if let Some(existing) = self
            .edges
            .iter_mut()
            .find(|e| e.target == target && e.assoc_type == assoc_type)
        {
            existing.reinforce(confidence, timestamp);
        } else {
            self.edges
                .push(AssociationEdge::new(target, assoc_type, confidence, timestamp));
        }
    }

    pub fn neighbor_ids(&self) -> Vec<ConceptId> {
        self.edges.iter().map(|e| e.target).collect()
    }

    /// Outgoing edges sorted by confidence descending
    pub fn edges_by_confidence(&self) -> Vec<AssociationEdge> {
        let mut edges = self.edges.clone();
        edges.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        edges
    }
}

/// Lowercase alphanumeric tokens of at least 3 characters
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| w.to_string())
        .collect()
}

/// Immutable graph snapshot
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    /// All concepts indexed by ID
    pub concepts: im::HashMap<ConceptId, ConceptNode>,

    /// Inverted word -> concept ids index, maintained on every upsert
    pub word_index: im::HashMap<String, im::HashSet<ConceptId>>,

    /// Snapshot metadata
    pub sequence: u64,
    pub timestamp: u64,
    pub concept_count: usize,
    pub edge_count: usize,
}

impl GraphSnapshot {
    pub fn new(sequence: u64) -> Self {
        Self {
            concepts: im::HashMap::new(),
            word_index: im::HashMap::new(),
            sequence,
            timestamp: crate::types::current_timestamp_us(),
            concept_count: 0,
            edge_count: 0,
        }
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<&ConceptNode> {
        self.concepts.get(id)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.concepts.contains_key(id)
    }

    pub fn get_neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        self.concepts
            .get(id)
            .map(|node| node.neighbor_ids())
            .unwrap_or_default()
    }

    /// Look up a specific edge
    pub fn get_association(&self, source: &ConceptId, target: &ConceptId) -> Option<AssociationEdge> {
        self.concepts.get(source).and_then(|node| {
            node.edges
                .iter()
                .filter(|e| e.target == *target)
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .copied()
        })
    }

    /// Insert or replace a concept, keeping the word index current
    pub fn upsert_concept(&mut self, node: ConceptNode) {
        let id = node.id;
        for word in tokenize(&String::from_utf8_lossy(&node.content)) {
            let mut ids = self.word_index.get(&word).cloned().unwrap_or_default();
            ids.insert(id);
            self.word_index.insert(word, ids);
        }
        self.concepts.insert(id, node);
    }

    /// Remove a concept and its word index entries. Edges pointing at the
    /// removed id become dangling targets, which traversal skips.
    pub fn remove_concept(&mut self, id: &ConceptId) {
        if let Some(node) = self.concepts.remove(id) {
            for word in tokenize(&String::from_utf8_lossy(&node.content)) {
                if let Some(ids) = self.word_index.get(&word) {
                    let mut ids = ids.clone();
                    ids.remove(id);
                    if ids.is_empty() {
                        self.word_index.remove(&word);
                    } else {
                        self.word_index.insert(word, ids);
                    }
                }
            }
        }
    }

    /// Concept ids whose content contains `word`
    pub fn concepts_with_word(&self, word: &str) -> Vec<ConceptId> {
        self.word_index
            .get(word)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Shortest path from start to end (BFS over outgoing edges), with the
    /// product of traversed edge confidences. Dangling targets are skipped.
    pub fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<(Vec<ConceptId>, f32)> {
        use std::collections::{HashMap, VecDeque};

        if start == end {
            return Some((vec![start], 1.0));
        }
        if !self.contains(&start) {
            return None;
        }

        let mut queue = VecDeque::new();
        let mut visited: HashMap<ConceptId, Option<(ConceptId, f32)>> = HashMap::new();

        queue.push_back((start, 0usize));
        visited.insert(start, None);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }

            if let Some(node) = self.concepts.get(&current) {
                for edge in &node.edges {
                    let neighbor = edge.target;
                    if let std::collections::hash_map::Entry::Vacant(e) = visited.entry(neighbor) {
                        e.insert(Some((current, edge.confidence)));

                        if neighbor == end {
                            let mut path = vec![neighbor];
                            let mut confidence = 1.0f32;
                            let mut backtrack = neighbor;

                            while let Some(Some((prev, conf))) = visited.get(&backtrack) {
                                confidence *= conf;
                                path.push(*prev);
                                backtrack = *prev;
                            }

                            path.reverse();
                            return Some((path, confidence));
                        }

                        // Only expand through concepts present in this snapshot
                        if self.contains(&neighbor) {
                            queue.push_back((neighbor, depth + 1));
                        }
                    }
                }
            }
        }

        None
    }

    pub fn all_concepts(&self) -> impl Iterator<Item = &ConceptNode> {
        self.concepts.values()
    }

    /// Recompute cached counts after modifications
    pub fn update_stats(&mut self) {
        self.concept_count = self.concepts.len();
        self.edge_count = self.concepts.values().map(|node| node.edges.len()).sum();
    }
}

/// Read view with atomic snapshot swapping
pub struct ReadView {
    snapshot: ArcSwap<GraphSnapshot>,
}

impl ReadView {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(GraphSnapshot::new(0)),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Load current snapshot (lock-free)
    pub fn load(&self) -> Arc<GraphSnapshot> {
        self.snapshot.load_full()
    }

    /// Publish a new snapshot (atomic swap)
    pub fn store(&self, new_snapshot: GraphSnapshot) {
        self.snapshot.store(Arc::new(new_snapshot));
    }
}

impl Default for ReadView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8, content: &str) -> ConceptNode {
        ConceptNode::new(
            ConceptId([id; 16]),
            content.as_bytes().to_vec(),
            None,
            1.0,
            0.9,
            1000,
        )
    }

    #[test]
    fn test_upsert_edge_dedup() {
        let mut n = node(1, "source");
        let target = ConceptId([2; 16]);

        n.upsert_edge(target, AssociationType::Semantic, 0.8, 1000);
        n.upsert_edge(target, AssociationType::Semantic, 0.9, 2000);

        assert_eq!(n.edges.len(), 1);
        assert_eq!(n.edges[0].reinforcement_count, 2);

        // Different type is a distinct edge
        n.upsert_edge(target, AssociationType::Causal, 0.7, 3000);
        assert_eq!(n.edges.len(), 2);
    }

    #[test]
    fn test_word_index_maintained() {
        let mut snapshot = GraphSnapshot::new(0);
        let n = node(1, "Paris is the capital of France");
        let id = n.id;

        snapshot.upsert_concept(n);

        assert_eq!(snapshot.concepts_with_word("paris"), vec![id]);
        assert_eq!(snapshot.concepts_with_word("capital"), vec![id]);
        // Words shorter than 3 chars are not indexed
        assert!(snapshot.concepts_with_word("is").is_empty());

        snapshot.remove_concept(&id);
        assert!(snapshot.concepts_with_word("paris").is_empty());
    }

    #[test]
    fn test_read_view_swap_isolation() {
        let view = ReadView::new();

        let snap1 = view.load();
        assert_eq!(snap1.sequence, 0);

        let mut snap2 = GraphSnapshot::new(1);
        snap2.upsert_concept(node(1, "new concept"));
        snap2.update_stats();
        view.store(snap2);

        let snap_new = view.load();
        assert_eq!(snap_new.sequence, 1);
        assert!(snap_new.contains(&ConceptId([1; 16])));

        // Readers holding the old snapshot are unaffected
        assert_eq!(snap1.sequence, 0);
        assert!(!snap1.contains(&ConceptId([1; 16])));
    }

    #[test]
    fn test_find_path_with_confidence() {
        let mut snapshot = GraphSnapshot::new(0);

        let mut n1 = node(1, "one");
        let mut n2 = node(2, "two");
        let n3 = node(3, "three");

        n1.upsert_edge(n2.id, AssociationType::Semantic, 0.8, 1000);
        n2.upsert_edge(n3.id, AssociationType::Semantic, 0.5, 1000);

        let (id1, id3) = (n1.id, n3.id);
        snapshot.upsert_concept(n1);
        snapshot.upsert_concept(n2);
        snapshot.upsert_concept(n3);

        let (path, confidence) = snapshot.find_path(id1, id3, 10).unwrap();
        assert_eq!(path.len(), 3);
        assert!((confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_find_path_skips_dangling_targets() {
        let mut snapshot = GraphSnapshot::new(0);

        let mut n1 = node(1, "one");
        // Forward reference: target concept never learned
        n1.upsert_edge(ConceptId([9; 16]), AssociationType::Semantic, 0.8, 1000);
        let id1 = n1.id;
        snapshot.upsert_concept(n1);

        assert!(snapshot.find_path(id1, ConceptId([3; 16]), 10).is_none());
    }

    #[test]
    fn test_get_association() {
        let mut snapshot = GraphSnapshot::new(0);

        let mut n1 = node(1, "one");
        let n2 = node(2, "two");
        n1.upsert_edge(n2.id, AssociationType::Hierarchical, 0.7, 1000);

        let (id1, id2) = (n1.id, n2.id);
        snapshot.upsert_concept(n1);
        snapshot.upsert_concept(n2);

        let edge = snapshot.get_association(&id1, &id2).unwrap();
        assert_eq!(edge.assoc_type, AssociationType::Hierarchical);
        assert!(snapshot.get_association(&id2, &id1).is_none());
    }
}
