/// Sharded deployment: hash-routed concept placement with a two-phase
/// commit coordinator for writes that span shards
///
/// Each shard is an independent Engine with its own WAL, snapshot, and
/// vector index. Concepts route by an avalanche mix of the id, deliberately
/// independent of the id's own content hash. Cross-shard transactions write
/// BeginTxn/CommitTxn framing into every participant WAL; the coordinator's
/// decision log is the commit record that drives recovery when the process
/// dies between phases.
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineStats, ShardOp};
use crate::error::{EngineError, Result};
use crate::pipeline::ConceptSink;
use crate::read_view::ConceptNode;
use crate::reasoning::{ReasonOptions, ReasoningResult};
use crate::semantic::SemanticType;
use crate::types::{AssociationEdge, AssociationType, ConceptId};
use crate::wal::{Operation, WriteAheadLog};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Coordinator transaction ids live above every shard-local id
const COORDINATOR_TXN_BASE: u64 = 1 << 32;

/// Default prepare timeout
const PREPARE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decision log file inside the base storage directory
const DECISION_LOG_FILE: &str = "txn.log";

/// Route a concept id to its shard. SplitMix64-style avalanche over the
/// identifying half, independent of the SHA-based id derivation.
pub fn shard_of(id: &ConceptId, num_shards: u32) -> u32 {
    let mut x = u64::from_le_bytes(id.0[..8].try_into().expect("8 bytes"));
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    (x % num_shards as u64) as u32
}

/// Durable record of global commit decisions: fixed 8-byte LE txn ids,
/// appended and fsynced before any participant is told to commit.
struct DecisionLog {
    file: File,
}

impl DecisionLog {
    fn open(path: &Path) -> Result<(Self, HashSet<u64>)> {
        let mut committed = HashSet::new();
        if path.exists() {
            let mut bytes = Vec::new();
            File::open(path)
                .and_then(|mut f| f.read_to_end(&mut bytes))
                .map_err(|e| EngineError::Corruption(format!("decision log: {}", e)))?;
            for chunk in bytes.chunks_exact(8) {
                committed.insert(u64::from_le_bytes(chunk.try_into().expect("8 bytes")));
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::Durability(format!("decision log: {}", e)))?;

        Ok((Self { file }, committed))
    }

    fn record_commit(&mut self, txn_id: u64) -> Result<()> {
        self.file
            .write_all(&txn_id.to_le_bytes())
            .and_then(|_| self.file.sync_all())
            .map_err(|e| EngineError::Durability(format!("decision log: {}", e)))
    }
}

#[derive(Debug, Clone)]
pub struct ShardedStats {
    pub num_shards: u32,
    pub total_concepts: usize,
    pub total_edges: usize,
    pub total_vectors: usize,
    pub shard_stats: Vec<EngineStats>,
}

/// The sharded engine: S independent engines behind one routing facade
pub struct ShardedEngine {
    num_shards: u32,
    shards: Vec<Arc<Engine>>,
    decision_log: Mutex<DecisionLog>,
    next_txn_id: AtomicU64,
    prepare_timeout: Duration,
}

impl std::fmt::Debug for ShardedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedEngine")
            .field("num_shards", &self.num_shards)
            .finish_non_exhaustive()
    }
}

impl ShardedEngine {
    /// Open all shards under `base_config.storage_dir/shard_NNNN`, finishing
    /// any transaction the coordinator decided but did not finish delivering.
    pub fn open(base_config: EngineConfig, num_shards: u32) -> Result<Self> {
        if !matches!(num_shards, 1 | 2 | 4 | 8 | 16) {
            return Err(EngineError::InvalidRequest(format!(
                "num_shards must be 1, 2, 4, 8, or 16, got {}",
                num_shards
            )));
        }

        let base_dir = base_config.storage_dir.clone();
        std::fs::create_dir_all(&base_dir).map_err(|e| EngineError::Durability(e.to_string()))?;

        let (decision_log, committed) = DecisionLog::open(&base_dir.join(DECISION_LOG_FILE))?;

        // Drive decided-but-undelivered commits into participant WALs before
        // the engines replay them
        let mut max_seen_txn = COORDINATOR_TXN_BASE;
        for shard_id in 0..num_shards {
            let dir = shard_dir(&base_dir, shard_id);
            max_seen_txn = max_seen_txn.max(recover_shard_wal(&dir, &committed)?);
        }

        let shards: Vec<Arc<Engine>> = (0..num_shards)
            .map(|shard_id| {
                let config = EngineConfig {
                    storage_dir: shard_dir(&base_dir, shard_id),
                    ..base_config.clone()
                };
                Engine::open(config).map(Arc::new)
            })
            .collect::<Result<_>>()?;

        tracing::info!("Sharded engine opened: {} shards", num_shards);

        Ok(Self {
            num_shards,
            shards,
            decision_log: Mutex::new(decision_log),
            next_txn_id: AtomicU64::new(max_seen_txn + 1),
            prepare_timeout: PREPARE_TIMEOUT,
        })
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    fn shard(&self, id: &ConceptId) -> &Arc<Engine> {
        &self.shards[shard_of(id, self.num_shards) as usize]
    }

    pub fn shard_id(&self, id: &ConceptId) -> u32 {
        shard_of(id, self.num_shards)
    }

    // ========================
    // WRITE API
    // ========================

    /// Create an association; runs 2PC when source and target live on
    /// different shards.
    pub fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Result<u64> {
        let source_shard = shard_of(&source, self.num_shards);
        let target_shard = shard_of(&target, self.num_shards);

        if source_shard == target_shard {
            return self.shards[source_shard as usize]
                .learn_association(source, target, assoc_type, confidence);
        }

        let ops: HashMap<u32, Vec<ShardOp>> = [
            (
                source_shard,
                vec![ShardOp::Association {
                    source,
                    target,
                    assoc_type,
                    confidence,
                }],
            ),
            // The target shard participates with framing only; atomicity of
            // the decision is what it is signing up for
            (target_shard, Vec::new()),
        ]
        .into_iter()
        .collect();

        self.run_two_phase_commit(ops)?;
        Ok(0)
    }

    /// Run prepare/commit over the given per-shard operations
    fn run_two_phase_commit(&self, ops_by_shard: HashMap<u32, Vec<ShardOp>>) -> Result<()> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let participants: Vec<u32> = ops_by_shard.keys().copied().collect();

        // Phase 1: prepare every participant; any refusal or timeout aborts
        let mut prepared: Vec<u32> = Vec::new();
        for (&shard_id, ops) in &ops_by_shard {
            if started.elapsed() > self.prepare_timeout {
                self.rollback_participants(txn_id, &prepared);
                return Err(EngineError::TransactionAborted(format!(
                    "transaction {} timed out during prepare",
                    txn_id
                )));
            }
            match self.shards[shard_id as usize].prepare_txn(txn_id, ops.clone()) {
                Ok(()) => prepared.push(shard_id),
                Err(e) => {
                    self.rollback_participants(txn_id, &prepared);
                    return Err(EngineError::TransactionAborted(format!(
                        "shard {} refused prepare: {}",
                        shard_id, e
                    )));
                }
            }
        }

        // Global commit record; after this the transaction must complete,
        // on recovery if necessary
        self.decision_log.lock().record_commit(txn_id)?;

        // Phase 2
        for &shard_id in &participants {
            if let Err(e) = self.shards[shard_id as usize].commit_txn(txn_id) {
                // The decision is durable; recovery finishes this delivery
                tracing::error!(
                    "Shard {} commit delivery for txn {} failed: {}",
                    shard_id,
                    txn_id,
                    e
                );
            }
        }

        tracing::debug!("2PC transaction {} committed", txn_id);
        Ok(())
    }

    fn rollback_participants(&self, txn_id: u64, prepared: &[u32]) {
        for &shard_id in prepared {
            if let Err(e) = self.shards[shard_id as usize].rollback_txn(txn_id) {
                tracing::warn!("Shard {} rollback for txn {} failed: {}", shard_id, txn_id, e);
            }
        }
    }

    // ========================
    // READ API
    // ========================

    pub fn query_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.shard(id).query_concept(id)
    }

    pub fn get_neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        self.shard(id).get_neighbors(id)
    }

    pub fn get_association(
        &self,
        source: &ConceptId,
        target: &ConceptId,
    ) -> Option<AssociationEdge> {
        self.shard(source).get_association(source, target)
    }

    /// Path search within the source's shard. Paths that leave the shard
    /// terminate at the dangling reference.
    pub fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<(Vec<ConceptId>, f32)> {
        self.shard(&start).find_path(start, end, max_depth)
    }

    /// Vector search fans out to every shard in parallel and merges
    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        let per_shard_k = (k / self.num_shards as usize).max(10);

        let mut results: Vec<(ConceptId, f32)> = self
            .shards
            .par_iter()
            .map(|shard| shard.vector_search(query, per_shard_k))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        results.sort_by(|a, b| b.1.total_cmp(&a.1));
        results.truncate(k);
        Ok(results)
    }

    /// Reason on every shard in parallel; the most confident shard-local
    /// result wins and absorbs the others' alternatives.
    pub fn reason(
        &self,
        query: &str,
        query_vector: Option<&[f32]>,
        opts: &ReasonOptions,
    ) -> ReasoningResult {
        let mut results: Vec<ReasoningResult> = self
            .shards
            .par_iter()
            .map(|shard| shard.reason(query, query_vector, opts))
            .collect();

        results.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut best = results.remove(0);
        for other in results {
            for alt in other.alternatives {
                if best.alternatives.len() < 4 && !best.alternatives.contains(&alt) {
                    best.alternatives.push(alt);
                }
            }
        }
        best
    }

    // ========================
    // SYSTEM API
    // ========================

    pub fn stats(&self) -> ShardedStats {
        let shard_stats: Vec<EngineStats> = self.shards.iter().map(|s| s.stats()).collect();
        ShardedStats {
            num_shards: self.num_shards,
            total_concepts: shard_stats.iter().map(|s| s.snapshot.concept_count).sum(),
            total_edges: shard_stats.iter().map(|s| s.snapshot.edge_count).sum(),
            total_vectors: shard_stats.iter().map(|s| s.indexed_vectors).sum(),
            shard_stats,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.shards.iter().all(|s| s.is_healthy())
    }

    /// Run the decay-and-prune sweep on every shard
    pub fn decay_and_prune(&self) -> Result<(usize, usize)> {
        let mut decayed = 0;
        let mut pruned = 0;
        for shard in &self.shards {
            let (d, p) = shard.decay_and_prune()?;
            decayed += d;
            pruned += p;
        }
        Ok((decayed, pruned))
    }

    pub fn flush(&self) -> Result<()> {
        self.shards
            .par_iter()
            .map(|shard| shard.flush())
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown();
        }
    }

    #[cfg(test)]
    pub(crate) fn shard_engine(&self, shard_id: u32) -> &Arc<Engine> {
        &self.shards[shard_id as usize]
    }
}

impl ConceptSink for ShardedEngine {
    /// Learning writes span shards when extracted subjects hash elsewhere:
    /// partition the operations by owning shard and commit with 2PC when
    /// more than one shard is involved.
    fn commit_learn(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticType>,
        auxiliary_concepts: Vec<(ConceptId, Vec<u8>, f32)>,
        associations: Vec<(ConceptId, ConceptId, AssociationType, f32)>,
    ) -> Result<u64> {
        let mut ops_by_shard: HashMap<u32, Vec<ShardOp>> = HashMap::new();

        ops_by_shard
            .entry(shard_of(&id, self.num_shards))
            .or_default()
            .push(ShardOp::Concept {
                id,
                content,
                vector,
                strength,
                confidence,
                semantic,
            });

        for (aux_id, aux_content, aux_confidence) in auxiliary_concepts {
            ops_by_shard
                .entry(shard_of(&aux_id, self.num_shards))
                .or_default()
                .push(ShardOp::Concept {
                    id: aux_id,
                    content: aux_content,
                    vector: None,
                    strength: crate::types::STRENGTH_MIN,
                    confidence: aux_confidence,
                    semantic: None,
                });
        }

        for (source, target, assoc_type, assoc_confidence) in associations {
            // Edges live with their source concept
            ops_by_shard
                .entry(shard_of(&source, self.num_shards))
                .or_default()
                .push(ShardOp::Association {
                    source,
                    target,
                    assoc_type,
                    confidence: assoc_confidence,
                });
        }

        if ops_by_shard.len() == 1 {
            // Single shard: a plain local transaction suffices
            let (shard_id, ops) = ops_by_shard.into_iter().next().expect("one entry");
            let engine = &self.shards[shard_id as usize];
            let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
            engine.prepare_txn(txn_id, ops)?;
            engine.commit_txn(txn_id)?;
            return Ok(0);
        }

        self.run_two_phase_commit(ops_by_shard)?;
        Ok(0)
    }
}

fn shard_dir(base: &Path, shard_id: u32) -> PathBuf {
    base.join(format!("shard_{:04}", shard_id))
}

/// Finish commit delivery for transactions the decision log recorded but a
/// participant WAL still shows open. Runs before the shard engines replay.
fn recover_shard_wal(dir: &Path, committed: &HashSet<u64>) -> Result<u64> {
    let wal_path = dir.join("wal.log");
    let mut max_txn = 0u64;
    if !wal_path.exists() {
        return Ok(max_txn);
    }

    let entries = WriteAheadLog::read_entries(&wal_path)
        .map_err(|e| EngineError::Corruption(e.to_string()))?;

    let mut open: HashSet<u64> = HashSet::new();
    for entry in &entries {
        match entry.operation {
            Operation::BeginTxn { txn_id } => {
                open.insert(txn_id);
                max_txn = max_txn.max(txn_id);
            }
            Operation::CommitTxn { txn_id } | Operation::RollbackTxn { txn_id } => {
                open.remove(&txn_id);
            }
            _ => {}
        }
    }

    let to_commit: Vec<u64> = open
        .into_iter()
        .filter(|txn_id| committed.contains(txn_id))
        .collect();

    if !to_commit.is_empty() {
        let mut wal = WriteAheadLog::open(&wal_path, true)
            .map_err(|e| EngineError::Durability(e.to_string()))?;
        for txn_id in to_commit {
            tracing::info!("Completing decided transaction {} in {:?}", txn_id, wal_path);
            wal.commit(txn_id)
                .map_err(|e| EngineError::Durability(e.to_string()))?;
        }
        wal.sync().map_err(|e| EngineError::Durability(e.to_string()))?;
    }

    Ok(max_txn)
}
