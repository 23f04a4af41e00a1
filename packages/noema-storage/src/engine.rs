/// Engine coordinator: the single value that owns every moving part
///
/// Writes go WAL-first, then into the WriteLog; the background reconciler
/// folds them into published snapshots and the vector index. Reads never
/// block. There is no ambient global state: configuration and counters are
/// fields of this struct, and tests construct an engine per test.
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::read_view::{ConceptNode, GraphSnapshot, ReadView};
use crate::reasoning::{self, ReasonOptions, ReasoningResult};
use crate::reconciler::{self, FaultState, Reconciler, ReconcilerConfig, ReconcilerStats};
use crate::semantic::SemanticType;
use crate::store;
use crate::types::{
    clamp_confidence, clamp_strength, current_timestamp_us, AssociationEdge, AssociationType,
    ConceptId,
};
use crate::vector_index::{VectorIndex, VectorIndexConfig};
use crate::wal::{Operation, WriteAheadLog};
use crate::write_log::{OverflowPolicy, WriteEntry, WriteLog, WriteLogStats};
use parking_lot::Mutex as PlMutex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// WAL file name inside the storage directory
const WAL_FILE: &str = "wal.log";

/// Strength decay per maintenance sweep
const DECAY_RATE: f32 = 0.05;

/// Concepts idle longer than this are eligible for decay (microseconds)
const DECAY_IDLE_US: u64 = 60 * 60 * 1_000_000;

/// Prune requires floor strength and this much idle time (microseconds)
const PRUNE_AGE_US: u64 = 30 * 24 * 60 * 60 * 1_000_000;

/// One shard-local operation inside a distributed transaction
#[derive(Debug, Clone)]
pub enum ShardOp {
    Concept {
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticType>,
    },
    Association {
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotInfo {
    pub sequence: u64,
    pub timestamp: u64,
    pub concept_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub write_log: WriteLogStats,
    pub reconciler: ReconcilerStats,
    pub snapshot: SnapshotInfo,
    pub indexed_vectors: usize,
}

/// The reasoning storage engine for one shard
pub struct Engine {
    config: EngineConfig,
    write_log: Arc<WriteLog>,
    read_view: Arc<ReadView>,
    vector_index: Arc<VectorIndex>,
    wal: Arc<Mutex<WriteAheadLog>>,
    reconciler: PlMutex<Reconciler>,
    fault: Arc<FaultState>,
    /// Entries buffered between a 2PC prepare and its commit
    prepared: PlMutex<HashMap<u64, Vec<WriteEntry>>>,
}

impl Engine {
    /// Open an engine: load the checkpoint if present, replay the WAL for
    /// crash recovery, start the reconciler.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        std::fs::create_dir_all(&config.storage_dir)
            .map_err(|e| EngineError::Durability(e.to_string()))?;

        // Checkpoint first: it covers everything the WAL has already dropped
        let loaded = store::load_snapshot(&config.storage_dir, config.vector_dimension)?;
        let (mut snapshot, mut vectors) = match loaded {
            Some((snapshot, vectors)) => (snapshot, vectors),
            None => (GraphSnapshot::new(0), HashMap::new()),
        };

        // WAL replay: committed operations newer than the checkpoint
        let wal_path = config.storage_dir.join(WAL_FILE);
        let wal = WriteAheadLog::open(&wal_path, config.wal_fsync)
            .map_err(|e| EngineError::Durability(e.to_string()))?;

        let mut committed = WriteAheadLog::replay(&wal_path)
            .map_err(|e| EngineError::Corruption(e.to_string()))?;
        // Replay strictly in sequence order, whatever the commit order was
        committed.sort_by_key(|e| e.sequence);
        let replayed = committed.len();
        let mut vector_updates = Vec::new();
        for entry in committed {
            if let Some(write) = log_entry_to_write(entry) {
                reconciler::apply_entry(&mut snapshot, &write, &mut vector_updates);
            }
        }
        for (id, vector) in vector_updates {
            match vector {
                Some(v) => {
                    vectors.insert(id, v.to_vec());
                }
                None => {
                    vectors.remove(&id);
                }
            }
        }

        snapshot.update_stats();
        snapshot.sequence = wal.sequence();
        snapshot.timestamp = current_timestamp_us();
        if replayed > 0 {
            tracing::info!("Recovered {} committed WAL operations", replayed);
        }
        tracing::info!(
            "Engine opened: {} concepts, {} edges, sequence {}",
            snapshot.concept_count,
            snapshot.edge_count,
            snapshot.sequence
        );

        let read_view = Arc::new(ReadView::from_snapshot(snapshot));

        // Vector index: mmap-load if persisted, else build from the vectors
        let vector_index = Arc::new(VectorIndex::new(
            config.storage_dir.join("vectors"),
            VectorIndexConfig::for_dimension(config.vector_dimension),
        ));
        vector_index
            .load_or_build(&vectors)
            .map_err(|e| EngineError::Corruption(e.to_string()))?;

        let write_log = Arc::new(WriteLog::new(OverflowPolicy::Block));
        let wal = Arc::new(Mutex::new(wal));
        let fault = Arc::new(FaultState::default());

        let mut reconciler = Reconciler::new(
            ReconcilerConfig {
                interval_low_ms: config.reconcile_interval_ms_low,
                interval_high_ms: config.reconcile_interval_ms_high,
                interval_max_ms: config.reconcile_interval_ms_max,
                checkpoint_every_n_writes: config.checkpoint_every_n_writes,
                storage_dir: config.storage_dir.clone(),
            },
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            Arc::clone(&vector_index),
            Arc::clone(&wal),
            Arc::clone(&fault),
        );
        reconciler.start();

        Ok(Self {
            config,
            write_log,
            read_view,
            vector_index,
            wal,
            reconciler: PlMutex::new(reconciler),
            fault,
            prepared: PlMutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn check_writable(&self) -> Result<()> {
        if self.fault.is_failed() {
            return Err(EngineError::Durability(
                self.fault
                    .message()
                    .unwrap_or_else(|| "background durability fault".to_string()),
            ));
        }
        Ok(())
    }

    fn check_vector(&self, vector: &Option<Vec<f32>>) -> Result<()> {
        if let Some(v) = vector {
            if v.len() != self.config.vector_dimension {
                return Err(EngineError::DimensionMismatch {
                    expected: self.config.vector_dimension,
                    actual: v.len(),
                });
            }
        }
        Ok(())
    }

    // ========================
    // WRITE API
    // ========================

    /// Learn a concept outside any transaction
    pub fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
    ) -> Result<u64> {
        self.learn_concept_tagged(id, content, vector, strength, confidence, None)
    }

    /// Learn a concept carrying its semantic classification
    pub fn learn_concept_tagged(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticType>,
    ) -> Result<u64> {
        self.check_writable()?;
        self.check_vector(&vector)?;

        let strength = clamp_strength(strength);
        let confidence = clamp_confidence(confidence);

        let seq = {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            wal.append(Operation::LearnConcept {
                id,
                content: content.clone(),
                vector: vector.clone(),
                strength,
                confidence,
                semantic,
            })
            .map_err(|e| EngineError::Durability(e.to_string()))?
        };

        self.write_log.append(WriteEntry::LearnConcept {
            seq,
            id,
            content: content.into_boxed_slice(),
            vector: vector.map(|v| v.into_boxed_slice()),
            strength,
            confidence,
            semantic,
            timestamp: current_timestamp_us(),
        })?;

        Ok(seq)
    }

    /// Learn an association outside any transaction
    pub fn learn_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    ) -> Result<u64> {
        self.check_writable()?;
        let confidence = clamp_confidence(confidence);

        let seq = {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            wal.append(Operation::LearnAssociation {
                source,
                target,
                assoc_type,
                confidence,
            })
            .map_err(|e| EngineError::Durability(e.to_string()))?
        };

        self.write_log.append(WriteEntry::LearnAssociation {
            seq,
            source,
            target,
            assoc_type,
            confidence,
        })?;

        Ok(seq)
    }

    /// Write a concept and its associations atomically: one WAL transaction,
    /// one WriteLog batch. Readers observe all of it or none of it.
    pub fn learn_transaction(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticType>,
        associations: Vec<(ConceptId, ConceptId, AssociationType, f32)>,
    ) -> Result<u64> {
        self.learn_transaction_full(
            id,
            content,
            vector,
            strength,
            confidence,
            semantic,
            Vec::new(),
            associations,
        )
    }

    /// Full transactional learn: auxiliary subject-term concepts, the main
    /// concept, and the extracted associations, committed together.
    #[allow(clippy::too_many_arguments)]
    pub fn learn_transaction_full(
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
        self.check_writable()?;
        self.check_vector(&vector)?;

        let strength = clamp_strength(strength);
        let confidence = clamp_confidence(confidence);
        let timestamp = current_timestamp_us();

        let mut entries = Vec::with_capacity(1 + auxiliary_concepts.len() + associations.len());

        let concept_seq = {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            let txn_id = wal.next_txn_id();

            // If any append fails, the transaction is never committed and
            // replay discards it: the operation never happened.
            let result: anyhow::Result<u64> = (|| {
                wal.begin(txn_id)?;

                let concept_seq = wal.append_in_txn(
                    Operation::LearnConcept {
                        id,
                        content: content.clone(),
                        vector: vector.clone(),
                        strength,
                        confidence,
                        semantic,
                    },
                    txn_id,
                )?;
                entries.push(WriteEntry::LearnConcept {
                    seq: concept_seq,
                    id,
                    content: content.clone().into_boxed_slice(),
                    vector: vector.clone().map(|v| v.into_boxed_slice()),
                    strength,
                    confidence,
                    semantic,
                    timestamp,
                });

                for (aux_id, aux_content, aux_confidence) in &auxiliary_concepts {
                    let aux_confidence = clamp_confidence(*aux_confidence);
                    let seq = wal.append_in_txn(
                        Operation::LearnConcept {
                            id: *aux_id,
                            content: aux_content.clone(),
                            vector: None,
                            strength: crate::types::STRENGTH_MIN,
                            confidence: aux_confidence,
                            semantic: None,
                        },
                        txn_id,
                    )?;
                    entries.push(WriteEntry::LearnConcept {
                        seq,
                        id: *aux_id,
                        content: aux_content.clone().into_boxed_slice(),
                        vector: None,
                        strength: crate::types::STRENGTH_MIN,
                        confidence: aux_confidence,
                        semantic: None,
                        timestamp,
                    });
                }

                for (source, target, assoc_type, assoc_confidence) in &associations {
                    let assoc_confidence = clamp_confidence(*assoc_confidence);
                    let seq = wal.append_in_txn(
                        Operation::LearnAssociation {
                            source: *source,
                            target: *target,
                            assoc_type: *assoc_type,
                            confidence: assoc_confidence,
                        },
                        txn_id,
                    )?;
                    entries.push(WriteEntry::LearnAssociation {
                        seq,
                        source: *source,
                        target: *target,
                        assoc_type: *assoc_type,
                        confidence: assoc_confidence,
                    });
                }

                wal.commit(txn_id)?;
                Ok(concept_seq)
            })();

            match result {
                Ok(seq) => seq,
                Err(e) => {
                    let _ = wal.rollback(txn_id);
                    return Err(EngineError::Durability(e.to_string()));
                }
            }
        };

        self.write_log.append_txn(entries)?;
        Ok(concept_seq)
    }

    /// Bump a concept's strength and access counters
    pub fn strengthen(&self, id: ConceptId) -> Result<u64> {
        self.check_writable()?;

        let seq = {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            wal.append(Operation::Strengthen { id })
                .map_err(|e| EngineError::Durability(e.to_string()))?
        };
        self.write_log.append(WriteEntry::Strengthen { seq, id })?;
        Ok(seq)
    }

    fn set_strength(&self, id: ConceptId, strength: f32) -> Result<u64> {
        self.check_writable()?;
        let strength = clamp_strength(strength);

        let seq = {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            wal.append(Operation::SetStrength { id, strength })
                .map_err(|e| EngineError::Durability(e.to_string()))?
        };
        self.write_log
            .append(WriteEntry::SetStrength { seq, id, strength })?;
        Ok(seq)
    }

    fn remove(&self, id: ConceptId) -> Result<u64> {
        self.check_writable()?;

        let seq = {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            wal.append(Operation::Remove { id })
                .map_err(|e| EngineError::Durability(e.to_string()))?
        };
        self.write_log.append(WriteEntry::Remove { seq, id })?;
        Ok(seq)
    }

    // ========================
    // READ API
    // ========================

    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.read_view.load()
    }

    pub fn query_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.read_view.load().get_concept(id).cloned()
    }

    pub fn get_neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        self.read_view.load().get_neighbors(id)
    }

    pub fn get_association(
        &self,
        source: &ConceptId,
        target: &ConceptId,
    ) -> Option<AssociationEdge> {
        self.read_view.load().get_association(source, target)
    }

    pub fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<(Vec<ConceptId>, f32)> {
        self.read_view.load().find_path(start, end, max_depth)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.read_view.load().contains(id)
    }

    /// k nearest concepts by cosine similarity
    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(ConceptId, f32)>> {
        self.vector_index.search(query, k)
    }

    // ========================
    // REASONING
    // ========================

    /// Select seed concepts for a query: vector candidates unioned with
    /// word-index hits, each scored by content overlap weighted by strength.
    pub fn select_seeds(
        &self,
        query: &str,
        query_vector: Option<&[f32]>,
        seed_k: usize,
    ) -> Vec<(ConceptId, f32)> {
        let snapshot = self.read_view.load();
        let query_tokens: Vec<String> = crate::read_view::tokenize(query);
        let mut candidates: HashMap<ConceptId, f32> = HashMap::new();

        if let Some(vector) = query_vector {
            if let Ok(results) = self.vector_index.search(vector, seed_k) {
                for (id, similarity) in results {
                    candidates
                        .entry(id)
                        .and_modify(|s| *s = s.max(similarity))
                        .or_insert(similarity);
                }
            }
        }

        for token in &query_tokens {
            for id in snapshot.concepts_with_word(token) {
                candidates.entry(id).or_insert(0.0);
            }
        }

        let mut seeds: Vec<(ConceptId, f32)> = candidates
            .into_iter()
            .filter_map(|(id, vector_score)| {
                let node = snapshot.get_concept(&id)?;
                let content = String::from_utf8_lossy(&node.content);
                let content_tokens: std::collections::HashSet<String> =
                    crate::read_view::tokenize(&content).into_iter().collect();
                let overlap = if query_tokens.is_empty() {
                    0.0
                } else {
                    query_tokens
                        .iter()
                        .filter(|t| content_tokens.contains(*t))
                        .count() as f32
                        / query_tokens.len() as f32
                };
                let strength_factor = 0.5 + node.strength / (2.0 * crate::types::STRENGTH_MAX);
                let score = (overlap * strength_factor).max(vector_score * 0.8);
                Some((id, score))
            })
            .collect();

        seeds.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        seeds.truncate(seed_k);
        seeds
    }

    /// Answer a natural-language query with reasoning paths. The caller
    /// supplies the query embedding (or None when the embedding service is
    /// unavailable); seed selection degrades to the word index alone.
    pub fn reason(
        &self,
        query: &str,
        query_vector: Option<&[f32]>,
        opts: &ReasonOptions,
    ) -> ReasoningResult {
        let snapshot = self.read_view.load();
        let seeds = self.select_seeds(query, query_vector, opts.seed_k);
        let result = reasoning::reason_over_seeds(&snapshot, &seeds, opts);

        // Frequently-traversed concepts emerge structurally
        for id in &result.visited {
            if let Err(e) = self.strengthen(*id) {
                tracing::debug!("Strengthen after reasoning skipped for {}: {}", id, e);
                break;
            }
        }

        result
    }

    // ========================
    // 2PC PARTICIPANT API
    // ========================

    /// Prepare phase: write transaction framing plus the shard's operations
    /// to the WAL and buffer the corresponding entries. They enter the
    /// WriteLog only when the coordinator commits.
    pub fn prepare_txn(&self, txn_id: u64, ops: Vec<ShardOp>) -> Result<()> {
        self.check_writable()?;

        let timestamp = current_timestamp_us();
        let mut entries = Vec::with_capacity(ops.len());

        let mut wal = self.wal.lock().expect("WAL lock poisoned");
        let result: anyhow::Result<()> = (|| {
            wal.begin(txn_id)?;
            for op in &ops {
                match op {
                    ShardOp::Concept {
                        id,
                        content,
                        vector,
                        strength,
                        confidence,
                        semantic,
                    } => {
                        let seq = wal.append_in_txn(
                            Operation::LearnConcept {
                                id: *id,
                                content: content.clone(),
                                vector: vector.clone(),
                                strength: *strength,
                                confidence: *confidence,
                                semantic: *semantic,
                            },
                            txn_id,
                        )?;
                        entries.push(WriteEntry::LearnConcept {
                            seq,
                            id: *id,
                            content: content.clone().into_boxed_slice(),
                            vector: vector.clone().map(|v| v.into_boxed_slice()),
                            strength: *strength,
                            confidence: *confidence,
                            semantic: *semantic,
                            timestamp,
                        });
                    }
                    ShardOp::Association {
                        source,
                        target,
                        assoc_type,
                        confidence,
                    } => {
                        let seq = wal.append_in_txn(
                            Operation::LearnAssociation {
                                source: *source,
                                target: *target,
                                assoc_type: *assoc_type,
                                confidence: *confidence,
                            },
                            txn_id,
                        )?;
                        entries.push(WriteEntry::LearnAssociation {
                            seq,
                            source: *source,
                            target: *target,
                            assoc_type: *assoc_type,
                            confidence: *confidence,
                        });
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                drop(wal);
                self.prepared.lock().insert(txn_id, entries);
                Ok(())
            }
            Err(e) => {
                let _ = wal.rollback(txn_id);
                Err(EngineError::TransactionAborted(e.to_string()))
            }
        }
    }

    /// Commit phase: durably record the commit, then admit the buffered
    /// entries atomically.
    pub fn commit_txn(&self, txn_id: u64) -> Result<()> {
        {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            wal.commit(txn_id)
                .map_err(|e| EngineError::Durability(e.to_string()))?;
        }
        if let Some(entries) = self.prepared.lock().remove(&txn_id) {
            self.write_log.append_txn(entries)?;
        }
        Ok(())
    }

    /// Rollback phase: record the rollback and discard buffered entries
    pub fn rollback_txn(&self, txn_id: u64) -> Result<()> {
        {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            wal.rollback(txn_id)
                .map_err(|e| EngineError::Durability(e.to_string()))?;
        }
        self.prepared.lock().remove(&txn_id);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_fault_for_tests(&self, message: &str) {
        self.fault.fail(message.to_string());
    }

    #[cfg(test)]
    pub(crate) fn reconciler_stop_for_tests(&self) {
        self.reconciler.lock().stop();
    }

    // ========================
    // MAINTENANCE
    // ========================

    /// Decay idle concepts toward the strength floor and prune those that
    /// sit at the floor past the prune age. Mutations flow through the
    /// normal write path; removal lands only in the next snapshot, so no
    /// in-flight query loses a concept it can see.
    pub fn decay_and_prune(&self) -> Result<(usize, usize)> {
        let snapshot = self.read_view.load();
        let now = current_timestamp_us();
        let mut decayed = 0;
        let mut pruned = 0;

        for node in snapshot.all_concepts() {
            let idle = now.saturating_sub(node.last_accessed);

            if node.strength <= crate::types::STRENGTH_MIN + 1e-3 && idle > PRUNE_AGE_US {
                self.remove(node.id)?;
                pruned += 1;
            } else if idle > DECAY_IDLE_US && node.strength > crate::types::STRENGTH_MIN {
                let next = node.strength - (node.strength - crate::types::STRENGTH_MIN) * DECAY_RATE;
                self.set_strength(node.id, next)?;
                decayed += 1;
            }
        }

        Ok((decayed, pruned))
    }

    // ========================
    // SYSTEM API
    // ========================

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.read_view.load();
        EngineStats {
            write_log: self.write_log.stats(),
            reconciler: self.reconciler.lock().stats(),
            snapshot: SnapshotInfo {
                sequence: snapshot.sequence,
                timestamp: snapshot.timestamp,
                concept_count: snapshot.concept_count,
                edge_count: snapshot.edge_count,
            },
            indexed_vectors: self.vector_index.len(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.fault.is_failed()
    }

    pub fn fault_message(&self) -> Option<String> {
        self.fault.message()
    }

    /// Persist the current snapshot and index, then drop covered WAL entries
    pub fn flush(&self) -> Result<()> {
        let snapshot = self.read_view.load();
        store::persist_snapshot(&snapshot, &self.config.storage_dir)
            .map_err(|e| EngineError::Durability(e.to_string()))?;
        self.vector_index
            .persist()
            .map_err(|e| EngineError::Durability(e.to_string()))?;

        if snapshot.sequence > 0 {
            let mut wal = self.wal.lock().expect("WAL lock poisoned");
            wal.truncate_before(snapshot.sequence - 1)
                .map_err(|e| EngineError::Durability(e.to_string()))?;
        }
        Ok(())
    }

    /// Stop background work, flushing first
    pub fn shutdown(&self) {
        if let Err(e) = self.flush() {
            tracing::error!("Flush on shutdown failed: {}", e);
        }
        self.reconciler.lock().stop();
    }
}

impl crate::pipeline::ConceptSink for Engine {
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
        self.learn_transaction_full(
            id,
            content,
            vector,
            strength,
            confidence,
            semantic,
            auxiliary_concepts,
            associations,
        )
    }
}

/// Convert a replayed WAL entry into the reconciler's write form
fn log_entry_to_write(entry: crate::wal::LogEntry) -> Option<WriteEntry> {
    let seq = entry.sequence;
    match entry.operation {
        Operation::LearnConcept {
            id,
            content,
            vector,
            strength,
            confidence,
            semantic,
        } => Some(WriteEntry::LearnConcept {
            seq,
            id,
            content: content.into_boxed_slice(),
            vector: vector.map(|v| v.into_boxed_slice()),
            strength,
            confidence,
            semantic,
            timestamp: entry.timestamp,
        }),
        Operation::LearnAssociation {
            source,
            target,
            assoc_type,
            confidence,
        } => Some(WriteEntry::LearnAssociation {
            seq,
            source,
            target,
            assoc_type,
            confidence,
        }),
        Operation::Strengthen { id } => Some(WriteEntry::Strengthen { seq, id }),
        Operation::SetStrength { id, strength } => {
            Some(WriteEntry::SetStrength { seq, id, strength })
        }
        Operation::Remove { id } => Some(WriteEntry::Remove { seq, id }),
        Operation::BeginTxn { .. } | Operation::CommitTxn { .. } | Operation::RollbackTxn { .. } => {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn test_config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            storage_dir: dir.path().to_path_buf(),
            vector_dimension: DIM,
            reconcile_interval_ms_low: 1,
            reconcile_interval_ms_high: 5,
            reconcile_interval_ms_max: 10,
            checkpoint_every_n_writes: 1_000_000,
            wal_fsync: false,
            embedding_service_url: String::new(),
        }
    }

    fn wait_reconcile() {
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn test_learn_and_query() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        let content = b"the sky is blue".to_vec();
        let id = ConceptId::from_content(&content);
        engine
            .learn_concept(id, content.clone(), None, 1.0, 0.9)
            .unwrap();

        wait_reconcile();

        let node = engine.query_concept(&id).unwrap();
        assert_eq!(node.content.as_ref(), content.as_slice());
        engine.shutdown();
    }

    #[test]
    fn test_dimension_mismatch_rejected_before_wal() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        let id = ConceptId::from_content(b"bad vector");
        let err = engine
            .learn_concept(id, b"bad vector".to_vec(), Some(vec![0.1; DIM * 2]), 1.0, 0.9)
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));

        wait_reconcile();
        assert!(!engine.contains(&id));
        engine.shutdown();
    }

    #[test]
    fn test_transaction_visible_atomically() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        let content = b"spark causes fire".to_vec();
        let id = ConceptId::from_content(&content);
        let target = ConceptId::from_content(b"fire");

        engine
            .learn_transaction(
                id,
                content,
                None,
                1.0,
                0.9,
                None,
                vec![(id, target, AssociationType::Causal, 0.8)],
            )
            .unwrap();

        wait_reconcile();

        let node = engine.query_concept(&id).unwrap();
        assert_eq!(node.edges.len(), 1);
        assert_eq!(node.edges[0].target, target);
        engine.shutdown();
    }

    #[test]
    fn test_durability_across_restart() {
        let dir = TempDir::new().unwrap();

        let contents: Vec<Vec<u8>> = (0..50)
            .map(|i| format!("durable fact number {}", i).into_bytes())
            .collect();

        {
            let engine = Engine::open(test_config(&dir)).unwrap();
            for content in &contents {
                let id = ConceptId::from_content(content);
                engine
                    .learn_concept(id, content.clone(), None, 1.0, 0.9)
                    .unwrap();
            }
            wait_reconcile();
            // No flush: the process "crashes" with only the WAL on disk
            engine.reconciler.lock().stop();
        }

        let engine = Engine::open(test_config(&dir)).unwrap();
        for content in &contents {
            let id = ConceptId::from_content(content);
            let node = engine.query_concept(&id).unwrap();
            assert_eq!(node.content.as_ref(), content.as_slice());
        }
        engine.shutdown();
    }

    #[test]
    fn test_flush_then_restart_uses_checkpoint() {
        let dir = TempDir::new().unwrap();

        let content = b"checkpointed fact".to_vec();
        let id = ConceptId::from_content(&content);

        {
            let engine = Engine::open(test_config(&dir)).unwrap();
            engine
                .learn_concept(id, content.clone(), Some(vec![0.25; DIM]), 1.0, 0.9)
                .unwrap();
            wait_reconcile();
            engine.flush().unwrap();
            engine.reconciler.lock().stop();
        }

        // WAL was truncated; the checkpoint alone must restore everything
        let engine = Engine::open(test_config(&dir)).unwrap();
        let node = engine.query_concept(&id).unwrap();
        assert_eq!(node.content.as_ref(), content.as_slice());
        assert!(node.vector.is_some());

        let results = engine.vector_search(&vec![0.25; DIM], 1).unwrap();
        assert_eq!(results[0].0, id);
        engine.shutdown();
    }

    #[test]
    fn test_vector_search_via_engine() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        for i in 0..10u32 {
            let content = format!("vector fact {}", i).into_bytes();
            let id = ConceptId::from_content(&content);
            let vector: Vec<f32> = (0..DIM).map(|j| ((i as usize + j) % 5) as f32).collect();
            engine
                .learn_concept(id, content, Some(vector), 1.0, 0.9)
                .unwrap();
        }

        wait_reconcile();

        let query: Vec<f32> = (0..DIM).map(|j| (j % 5) as f32).collect();
        let results = engine.vector_search(&query, 3).unwrap();
        assert!(!results.is_empty());

        let err = engine.vector_search(&vec![0.0; DIM / 2], 3).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));
        engine.shutdown();
    }

    #[test]
    fn test_reason_end_to_end() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        // Small chain: query tokens hit the seed via the word index
        let c1 = b"france is a country in europe".to_vec();
        let c2 = b"the capital of france".to_vec();
        let c3 = b"Paris".to_vec();
        let (id1, id2, id3) = (
            ConceptId::from_content(&c1),
            ConceptId::from_content(&c2),
            ConceptId::from_content(&c3),
        );

        engine.learn_concept(id1, c1, None, 1.0, 0.9).unwrap();
        engine.learn_concept(id2, c2, None, 1.0, 0.9).unwrap();
        engine.learn_concept(id3, c3, None, 1.0, 0.9).unwrap();
        engine
            .learn_association(id1, id2, AssociationType::Semantic, 0.9)
            .unwrap();
        engine
            .learn_association(id2, id3, AssociationType::Semantic, 0.9)
            .unwrap();

        wait_reconcile();

        let opts = ReasonOptions {
            min_confidence: 0.01,
            ..Default::default()
        };
        let result = engine.reason("capital of france", None, &opts);

        let (answer_id, _) = result.answer.expect("should answer");
        assert_eq!(answer_id, id3);
        assert!(!result.paths.is_empty());

        // Visited concepts get strengthened through the write path
        wait_reconcile();
        let node = engine.query_concept(&id2).unwrap();
        assert!(node.access_count >= 1);
        engine.shutdown();
    }

    #[test]
    fn test_decay_and_prune_through_write_path() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).unwrap();

        let content = b"fading memory".to_vec();
        let id = ConceptId::from_content(&content);
        engine
            .learn_concept(id, content, None, 5.0, 0.9)
            .unwrap();
        wait_reconcile();

        // Nothing is idle yet: sweep is a no-op
        let (decayed, pruned) = engine.decay_and_prune().unwrap();
        assert_eq!(decayed, 0);
        assert_eq!(pruned, 0);
        assert!(engine.contains(&id));
        engine.shutdown();
    }
}
