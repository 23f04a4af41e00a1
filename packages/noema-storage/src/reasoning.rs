/// Multi-hop reasoning over graph snapshots
///
/// Three search strategies produce candidate paths from seed concepts;
/// candidates are diversified by shape and aggregated into answer clusters
/// (Multi-Path Plan Aggregation). The top cluster's representative is the
/// answer, guarded by a confidence quality gate: if no cluster clears it,
/// the result carries the paths but no answer. Answers are never fabricated;
/// they are always the terminal concept of an actually-found path.
use crate::read_view::{tokenize, GraphSnapshot};
use crate::types::{AssociationType, ConceptId};
use smallvec::SmallVec;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Per-hop confidence decay; guarantees convergence on long paths
const ALPHA: f32 = 0.9;

/// Paths kept per (seed, target) pair
const PATHS_PER_SEED: usize = 3;

/// Answer-similarity threshold for clustering
const CLUSTER_SIMILARITY: f32 = 0.8;

/// Unique type-sequence cap for the diversity bonus
const DIVERSITY_CAP: usize = 4;

/// Penalty factor per redundant path of the same shape
const REDUNDANCY_PENALTY: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    BestFirst,
    BreadthFirst,
    Bidirectional,
}

impl SearchStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "best_first" => Some(Self::BestFirst),
            "breadth_first" => Some(Self::BreadthFirst),
            "bidirectional" => Some(Self::Bidirectional),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReasonOptions {
    pub strategy: SearchStrategy,
    /// Paths requested in the final result
    pub num_paths: usize,
    pub max_depth: usize,
    /// Seeds taken from vector search
    pub seed_k: usize,
    /// Quality gate: below this top-cluster confidence, no answer is returned
    pub min_confidence: f32,
    /// Soft deadline; exceeded searches return best-known results as partial
    pub soft_deadline: Duration,
}

impl Default for ReasonOptions {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::BestFirst,
            num_paths: 4,
            max_depth: 6,
            seed_k: 10,
            min_confidence: 0.05,
            soft_deadline: Duration::from_secs(10),
        }
    }
}

/// One traversed edge with the confidence after this hop
#[derive(Debug, Clone, Copy)]
pub struct PathStep {
    pub source: ConceptId,
    pub target: ConceptId,
    pub assoc_type: AssociationType,
    pub edge_confidence: f32,
    pub hop_confidence: f32,
}

/// A complete candidate path
#[derive(Debug, Clone)]
pub struct ReasonedPath {
    pub concepts: Vec<ConceptId>,
    pub steps: Vec<PathStep>,
    /// Propagated confidence after the final hop
    pub confidence: f32,
    /// Seed relevance this path started from
    pub seed_score: f32,
}

impl ReasonedPath {
    pub fn terminal(&self) -> ConceptId {
        *self.concepts.last().expect("path never empty")
    }

    /// Shape fingerprint: the ordered edge-type sequence, ignoring ids
    pub fn fingerprint(&self) -> Vec<u8> {
        self.steps.iter().map(|s| s.assoc_type as u8).collect()
    }

    /// Score reported to aggregation. Longer paths use the harmonic mean of
    /// hop confidences, which is less punishing than the raw product.
    pub fn aggregation_score(&self) -> f32 {
        if self.steps.len() <= 3 {
            return self.confidence;
        }
        let sum_inverse: f32 = self
            .steps
            .iter()
            .map(|s| 1.0 / s.hop_confidence.max(1e-6))
            .sum();
        self.steps.len() as f32 / sum_inverse
    }
}

/// An answer cluster produced by consensus aggregation
#[derive(Debug, Clone)]
pub struct AnswerCluster {
    pub representative: ReasonedPath,
    pub answer_text: String,
    pub member_count: usize,
    pub average_confidence: f32,
    pub path_support: f32,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct ReasoningResult {
    /// Terminal concept of the winning cluster's representative, if the
    /// quality gate passed
    pub answer: Option<(ConceptId, String)>,
    pub confidence: f32,
    pub paths: Vec<ReasonedPath>,
    /// Runner-up clusters as (answer text, score)
    pub alternatives: Vec<(String, f32)>,
    pub explanation: String,
    pub partial: bool,
    /// Every concept visited on a returned path; scheduled for strengthening
    pub visited: Vec<ConceptId>,
}

/// Visited-set key: a concept plus the last three ids on the way in. Blocks
/// local cycles while still admitting legitimate diamond paths.
type VisitKey = (ConceptId, SmallVec<[ConceptId; 3]>);

fn visit_key(path: &[ConceptId], current: ConceptId) -> VisitKey {
    let context: SmallVec<[ConceptId; 3]> =
        path.iter().rev().take(3).copied().collect();
    (current, context)
}

fn hop_confidence(current: f32, edge_confidence: f32, assoc_type: AssociationType) -> f32 {
    (current * edge_confidence * assoc_type.traversal_weight() * ALPHA).min(1.0)
}

/// Best-first heuristic toward an explicit target
fn heuristic(snapshot: &GraphSnapshot, neighbor: ConceptId, target: Option<ConceptId>) -> f32 {
    let Some(target) = target else {
        return 0.0;
    };
    if neighbor == target {
        return 1.0;
    }
    let Some(node) = snapshot.get_concept(&neighbor) else {
        return 0.0;
    };
    if node.edges.iter().any(|e| e.target == target) {
        return 0.5;
    }
    let target_neighbors: HashSet<ConceptId> = snapshot
        .get_concept(&target)
        .map(|n| n.neighbor_ids().into_iter().collect())
        .unwrap_or_default();
    if target_neighbors.is_empty() {
        return 0.0;
    }
    let common = node
        .edges
        .iter()
        .filter(|e| target_neighbors.contains(&e.target))
        .count();
    0.2 * (common as f32 / 3.0).min(1.0)
}

struct Candidate {
    score: f32,
    confidence: f32,
    path: Vec<ConceptId>,
    steps: Vec<PathStep>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.total_cmp(&other.score)
    }
}

/// Priority-queue search ordered by confidence times a target heuristic
fn best_first(
    snapshot: &GraphSnapshot,
    seed: ConceptId,
    seed_score: f32,
    target: Option<ConceptId>,
    opts: &ReasonOptions,
    deadline: Instant,
) -> (Vec<ReasonedPath>, bool) {
    let mut found = Vec::new();
    let mut visited: HashSet<VisitKey> = HashSet::new();
    let mut queue: BinaryHeap<Candidate> = BinaryHeap::new();
    let mut partial = false;

    queue.push(Candidate {
        score: 1.0,
        confidence: 1.0,
        path: vec![seed],
        steps: Vec::new(),
    });

    while let Some(candidate) = queue.pop() {
        if found.len() >= PATHS_PER_SEED {
            break;
        }
        if Instant::now() >= deadline {
            partial = true;
            break;
        }

        let current = *candidate.path.last().expect("non-empty path");

        if let Some(t) = target {
            if current == t && candidate.path.len() > 1 {
                found.push(ReasonedPath {
                    concepts: candidate.path,
                    steps: candidate.steps,
                    confidence: candidate.confidence,
                    seed_score,
                });
                continue;
            }
        }

        if candidate.steps.len() >= opts.max_depth {
            if target.is_none() && candidate.path.len() > 1 {
                found.push(ReasonedPath {
                    concepts: candidate.path,
                    steps: candidate.steps,
                    confidence: candidate.confidence,
                    seed_score,
                });
            }
            continue;
        }

        let Some(node) = snapshot.get_concept(&current) else {
            continue;
        };

        let mut expanded = false;
        for edge in &node.edges {
            // Dangling forward references are skipped
            if !snapshot.contains(&edge.target) {
                continue;
            }
            let key = visit_key(&candidate.path, edge.target);
            if !visited.insert(key) {
                continue;
            }

            let confidence = hop_confidence(candidate.confidence, edge.confidence, edge.assoc_type);
            let score = confidence * (1.0 + heuristic(snapshot, edge.target, target));

            let mut path = candidate.path.clone();
            path.push(edge.target);
            let mut steps = candidate.steps.clone();
            steps.push(PathStep {
                source: current,
                target: edge.target,
                assoc_type: edge.assoc_type,
                edge_confidence: edge.confidence,
                hop_confidence: confidence,
            });

            queue.push(Candidate {
                score,
                confidence,
                path,
                steps,
            });
            expanded = true;
        }

        // Open-ended search: a dead end terminates a path
        if !expanded && target.is_none() && candidate.path.len() > 1 {
            found.push(ReasonedPath {
                concepts: candidate.path,
                steps: candidate.steps,
                confidence: candidate.confidence,
                seed_score,
            });
        }
    }

    (found, partial)
}

/// Level-by-level search; a neighbor is admitted only when the new confidence
/// beats the best previously seen at that concept
fn breadth_first(
    snapshot: &GraphSnapshot,
    seed: ConceptId,
    seed_score: f32,
    target: Option<ConceptId>,
    opts: &ReasonOptions,
    deadline: Instant,
) -> (Vec<ReasonedPath>, bool) {
    let mut found = Vec::new();
    let mut best_confidence: HashMap<ConceptId, f32> = HashMap::new();
    let mut queue: VecDeque<Candidate> = VecDeque::new();
    let mut partial = false;

    best_confidence.insert(seed, 1.0);
    queue.push_back(Candidate {
        score: 1.0,
        confidence: 1.0,
        path: vec![seed],
        steps: Vec::new(),
    });

    while let Some(candidate) = queue.pop_front() {
        if found.len() >= PATHS_PER_SEED {
            break;
        }
        if Instant::now() >= deadline {
            partial = true;
            break;
        }

        let current = *candidate.path.last().expect("non-empty path");

        if let Some(t) = target {
            if current == t && candidate.path.len() > 1 {
                found.push(ReasonedPath {
                    concepts: candidate.path,
                    steps: candidate.steps,
                    confidence: candidate.confidence,
                    seed_score,
                });
                continue;
            }
        }

        if candidate.steps.len() >= opts.max_depth {
            if target.is_none() && candidate.path.len() > 1 {
                found.push(ReasonedPath {
                    concepts: candidate.path,
                    steps: candidate.steps,
                    confidence: candidate.confidence,
                    seed_score,
                });
            }
            continue;
        }

        let Some(node) = snapshot.get_concept(&current) else {
            continue;
        };

        let mut expanded = false;
        for edge in &node.edges {
            if !snapshot.contains(&edge.target) {
                continue;
            }
            let confidence = hop_confidence(candidate.confidence, edge.confidence, edge.assoc_type);

            let best = best_confidence.get(&edge.target).copied().unwrap_or(0.0);
            if confidence <= best {
                continue;
            }
            best_confidence.insert(edge.target, confidence);

            let mut path = candidate.path.clone();
            path.push(edge.target);
            let mut steps = candidate.steps.clone();
            steps.push(PathStep {
                source: current,
                target: edge.target,
                assoc_type: edge.assoc_type,
                edge_confidence: edge.confidence,
                hop_confidence: confidence,
            });

            queue.push_back(Candidate {
                score: confidence,
                confidence,
                path,
                steps,
            });
            expanded = true;
        }

        if !expanded && target.is_none() && candidate.path.len() > 1 {
            found.push(ReasonedPath {
                concepts: candidate.path,
                steps: candidate.steps,
                confidence: candidate.confidence,
                seed_score,
            });
        }
    }

    (found, partial)
}

/// Half of a bidirectional frontier
#[derive(Clone)]
struct Frontier {
    /// concept -> (path from origin, steps, confidence)
    reached: HashMap<ConceptId, (Vec<ConceptId>, Vec<PathStep>, f32)>,
    queue: VecDeque<ConceptId>,
}

impl Frontier {
    fn new(origin: ConceptId) -> Self {
        let mut reached = HashMap::new();
        reached.insert(origin, (vec![origin], Vec::new(), 1.0));
        let mut queue = VecDeque::new();
        queue.push_back(origin);
        Self { reached, queue }
    }
}

/// Alternate expansion from start and target; meeting frontiers merge the
/// forward path with the reversed backward path, multiplying confidences.
fn bidirectional(
    snapshot: &GraphSnapshot,
    seed: ConceptId,
    seed_score: f32,
    target: ConceptId,
    opts: &ReasonOptions,
    deadline: Instant,
) -> (Vec<ReasonedPath>, bool) {
    // Backward expansion needs incoming edges; build the reverse adjacency once
    let mut incoming: HashMap<ConceptId, Vec<(ConceptId, AssociationType, f32)>> = HashMap::new();
    for node in snapshot.all_concepts() {
        for edge in &node.edges {
            incoming
                .entry(edge.target)
                .or_default()
                .push((node.id, edge.assoc_type, edge.confidence));
        }
    }

    let mut forward = Frontier::new(seed);
    let mut backward = Frontier::new(target);
    let mut found = Vec::new();
    let mut partial = false;
    let half_depth = opts.max_depth.div_ceil(2);

    for _ in 0..half_depth {
        if Instant::now() >= deadline {
            partial = true;
            break;
        }

        // Forward step over outgoing edges
        let level: Vec<ConceptId> = forward.queue.drain(..).collect();
        for current in level {
            let (path, steps, confidence) = forward.reached[&current].clone();
            if steps.len() >= half_depth {
                continue;
            }
            let Some(node) = snapshot.get_concept(&current) else {
                continue;
            };
            for edge in &node.edges {
                if !snapshot.contains(&edge.target) || forward.reached.contains_key(&edge.target) {
                    continue;
                }
                let conf = hop_confidence(confidence, edge.confidence, edge.assoc_type);
                let mut new_path = path.clone();
                new_path.push(edge.target);
                let mut new_steps = steps.clone();
                new_steps.push(PathStep {
                    source: current,
                    target: edge.target,
                    assoc_type: edge.assoc_type,
                    edge_confidence: edge.confidence,
                    hop_confidence: conf,
                });
                forward
                    .reached
                    .insert(edge.target, (new_path, new_steps, conf));
                forward.queue.push_back(edge.target);
            }
        }

        // Backward step over incoming edges
        let level: Vec<ConceptId> = backward.queue.drain(..).collect();
        for current in level {
            let (path, steps, confidence) = backward.reached[&current].clone();
            if steps.len() >= half_depth {
                continue;
            }
            let Some(sources) = incoming.get(&current) else {
                continue;
            };
            for (source, assoc_type, edge_confidence) in sources {
                if !snapshot.contains(source) || backward.reached.contains_key(source) {
                    continue;
                }
                let conf = hop_confidence(confidence, *edge_confidence, *assoc_type);
                let mut new_path = path.clone();
                new_path.push(*source);
                let mut new_steps = steps.clone();
                new_steps.push(PathStep {
                    source: *source,
                    target: current,
                    assoc_type: *assoc_type,
                    edge_confidence: *edge_confidence,
                    hop_confidence: conf,
                });
                backward
                    .reached
                    .insert(*source, (new_path, new_steps, conf));
                backward.queue.push_back(*source);
            }
        }

        // Meet detection
        let meets: Vec<ConceptId> = forward
            .reached
            .keys()
            .filter(|id| backward.reached.contains_key(*id))
            .copied()
            .collect();

        for meet in meets {
            let (f_path, f_steps, f_conf) = forward.reached[&meet].clone();
            let (b_path, b_steps, b_conf) = backward.reached[&meet].clone();

            // Merge: forward path to the meet node, then the backward path
            // reversed (it was built target-outward)
            let mut concepts = f_path;
            for id in b_path.iter().rev().skip(1) {
                concepts.push(*id);
            }
            let mut steps = f_steps;
            steps.extend(b_steps.into_iter().rev());

            if concepts.len() < 2 || concepts.len() > opts.max_depth + 1 {
                continue;
            }

            found.push(ReasonedPath {
                concepts,
                steps,
                confidence: (f_conf * b_conf).min(1.0),
                seed_score,
            });
            if found.len() >= PATHS_PER_SEED {
                return (found, partial);
            }
        }
        if !found.is_empty() {
            break;
        }
    }

    (found, partial)
}

/// Run the selected strategy from every seed
pub fn search_paths(
    snapshot: &GraphSnapshot,
    seeds: &[(ConceptId, f32)],
    target: Option<ConceptId>,
    opts: &ReasonOptions,
) -> (Vec<ReasonedPath>, bool) {
    let deadline = Instant::now() + opts.soft_deadline;
    let mut all = Vec::new();
    let mut partial = false;

    for (seed, seed_score) in seeds {
        if !snapshot.contains(seed) {
            continue;
        }
        let (paths, timed_out) = match opts.strategy {
            SearchStrategy::BestFirst => {
                best_first(snapshot, *seed, *seed_score, target, opts, deadline)
            }
            SearchStrategy::BreadthFirst => {
                breadth_first(snapshot, *seed, *seed_score, target, opts, deadline)
            }
            SearchStrategy::Bidirectional => match target {
                Some(t) => bidirectional(snapshot, *seed, *seed_score, t, opts, deadline),
                // Open-ended queries have no target frontier to expand
                None => best_first(snapshot, *seed, *seed_score, None, opts, deadline),
            },
        };
        partial |= timed_out;
        all.extend(paths);
        if timed_out {
            break;
        }
    }

    (all, partial)
}

/// Penalize redundant paths sharing a shape fingerprint so the surviving
/// top-k is diverse
pub fn diversify(paths: &mut [ReasonedPath]) {
    let mut groups: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();
    for (i, path) in paths.iter().enumerate() {
        groups.entry(path.fingerprint()).or_default().push(i);
    }

    for indices in groups.values() {
        let mut ordered = indices.clone();
        ordered.sort_by(|a, b| paths[*b].confidence.total_cmp(&paths[*a].confidence));
        for (rank, &idx) in ordered.iter().enumerate().skip(1) {
            paths[idx].confidence *= REDUNDANCY_PENALTY.powi(rank as i32);
        }
    }
}

/// Token-overlap similarity (Dice coefficient) on normalized content
pub fn answer_similarity(a: &str, b: &str) -> f32 {
    let ta: HashSet<String> = tokenize(a).into_iter().collect();
    let tb: HashSet<String> = tokenize(b).into_iter().collect();
    if ta.is_empty() && tb.is_empty() {
        return if a.trim().eq_ignore_ascii_case(b.trim()) {
            1.0
        } else {
            0.0
        };
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let common = ta.intersection(&tb).count();
    (2.0 * common as f32) / (ta.len() + tb.len()) as f32
}

fn content_of(snapshot: &GraphSnapshot, id: ConceptId) -> String {
    snapshot
        .get_concept(&id)
        .map(|n| String::from_utf8_lossy(&n.content).to_string())
        .unwrap_or_default()
}

/// Multi-Path Plan Aggregation: cluster paths by answer similarity and score
/// each cluster by support, consensus, outlier, and diversity factors.
pub fn aggregate(snapshot: &GraphSnapshot, paths: &[ReasonedPath]) -> Vec<AnswerCluster> {
    if paths.is_empty() {
        return Vec::new();
    }
    let total_paths = paths.len();

    // Greedy clustering by answer text similarity
    let mut clusters: Vec<(String, Vec<&ReasonedPath>)> = Vec::new();
    for path in paths {
        let answer = content_of(snapshot, path.terminal());
        match clusters
            .iter_mut()
            .find(|(text, _)| answer_similarity(text, &answer) >= CLUSTER_SIMILARITY)
        {
            Some((_, members)) => members.push(path),
            None => clusters.push((answer, vec![path])),
        }
    }
    let cluster_count = clusters.len();

    let mut scored: Vec<AnswerCluster> = clusters
        .into_iter()
        .map(|(answer_text, members)| {
            let n = members.len();
            let average_confidence =
                members.iter().map(|p| p.aggregation_score()).sum::<f32>() / n as f32;
            let path_support = n as f32 / total_paths as f32;

            let consensus_bonus = if path_support >= 0.5 && n >= 2 {
                1.0 + (path_support - 0.5)
            } else {
                1.0
            };
            let outlier_penalty = if n == 1 && cluster_count > 1 { 0.7 } else { 1.0 };

            let unique_shapes: HashSet<Vec<u8>> =
                members.iter().map(|p| p.fingerprint()).collect();
            let unique = unique_shapes.len().min(DIVERSITY_CAP);
            let diversity_bonus = 1.0 + 0.2 * (unique as f32 / DIVERSITY_CAP as f32);

            let representative = members
                .iter()
                .max_by(|a, b| {
                    a.confidence
                        .total_cmp(&b.confidence)
                        .then_with(|| b.terminal().to_hex().cmp(&a.terminal().to_hex()))
                })
                .expect("cluster never empty");

            AnswerCluster {
                representative: (*representative).clone(),
                answer_text,
                member_count: n,
                average_confidence,
                path_support,
                score: average_confidence
                    * path_support
                    * consensus_bonus
                    * outlier_penalty
                    * diversity_bonus,
            }
        })
        .collect();

    // Deterministic ordering: score descending, then answer text
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.answer_text.cmp(&b.answer_text))
    });
    scored
}

fn explain(snapshot: &GraphSnapshot, clusters: &[AnswerCluster], gated: bool) -> String {
    let Some(top) = clusters.first() else {
        return "No reasoning paths were found for this query.".to_string();
    };
    if gated {
        return format!(
            "No confident answer: the best candidate \"{}\" scored {:.2}, below the quality gate.",
            top.answer_text.trim(),
            top.score
        );
    }

    let chain: Vec<String> = top
        .representative
        .concepts
        .iter()
        .map(|id| {
            let text = content_of(snapshot, *id);
            let mut short = text.trim().to_string();
            if short.len() > 40 {
                short.truncate(40);
                short.push('…');
            }
            short
        })
        .collect();

    format!(
        "\"{}\" is supported by {} of {} path cluster(s) (score {:.2}); strongest chain: {}",
        top.answer_text.trim(),
        top.member_count,
        clusters.iter().map(|c| c.member_count).sum::<usize>(),
        top.score,
        chain.join(" -> ")
    )
}

/// Full reasoning pass over already-selected seeds
pub fn reason_over_seeds(
    snapshot: &GraphSnapshot,
    seeds: &[(ConceptId, f32)],
    opts: &ReasonOptions,
) -> ReasoningResult {
    let (mut paths, partial) = search_paths(snapshot, seeds, None, opts);
    diversify(&mut paths);
    paths.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let clusters = aggregate(snapshot, &paths);

    let (answer, confidence, gated) = match clusters.first() {
        Some(top) if top.score >= opts.min_confidence => {
            let id = top.representative.terminal();
            (
                Some((id, top.answer_text.clone())),
                top.score.clamp(0.0, 1.0),
                false,
            )
        }
        Some(top) => (None, top.score.clamp(0.0, 1.0), true),
        None => (None, 0.0, false),
    };

    let explanation = explain(snapshot, &clusters, gated);

    let alternatives: Vec<(String, f32)> = clusters
        .iter()
        .skip(1)
        .take(4)
        .map(|c| (c.answer_text.clone(), c.score))
        .collect();

    let mut returned: Vec<ReasonedPath> = Vec::new();
    // Representative first, then the strongest remaining paths
    if let Some(top) = clusters.first() {
        returned.push(top.representative.clone());
    }
    for path in &paths {
        if returned.len() >= opts.num_paths.max(1) {
            break;
        }
        if !returned
            .iter()
            .any(|r| r.concepts == path.concepts)
        {
            returned.push(path.clone());
        }
    }

    let mut visited: Vec<ConceptId> = returned
        .iter()
        .flat_map(|p| p.concepts.iter().copied())
        .collect();
    visited.sort();
    visited.dedup();

    ReasoningResult {
        answer,
        confidence,
        paths: returned,
        alternatives,
        explanation,
        partial,
        visited,
    }
}
