/// Background reconciler: drains the WriteLog, applies entries to a cloned
/// snapshot, and publishes the successor to the ReadView.
///
/// A single long-lived thread. The loop never holds an exclusive resource
/// across a sleep: it drains, builds, publishes, then updates the vector
/// index and (periodically) persists a checkpoint and truncates the WAL.
///
/// The sleep interval adapts to the observed write rate:
/// below 1,000 writes/sec the idle ceiling applies; between 1,000 and
/// 10,000 the moderate interval; at 10,000 and above the minimal interval,
/// keeping freshness tight during bursts.
use crate::read_view::{ConceptNode, GraphSnapshot, ReadView};
use crate::store;
use crate::types::{clamp_confidence, clamp_strength, current_timestamp_us};
use crate::vector_index::VectorIndex;
use crate::wal::WriteAheadLog;
use crate::write_log::{WriteEntry, WriteLog};
use parking_lot::Mutex as PlMutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Write-rate thresholds (writes/sec) for interval selection
const LOW_RATE_THRESHOLD: f64 = 1_000.0;
const HIGH_RATE_THRESHOLD: f64 = 10_000.0;

/// EMA smoothing for the rate estimate
const RATE_EMA_ALPHA: f64 = 0.3;

/// Strength multiplier applied by a Strengthen entry
const STRENGTH_GROWTH: f32 = 1.1;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Minimal interval, used at and above the high rate threshold
    pub interval_low_ms: u64,
    /// Moderate interval, used between the thresholds
    pub interval_high_ms: u64,
    /// Idle ceiling; the interval never exceeds this
    pub interval_max_ms: u64,
    /// Persist a checkpoint after this many applied writes
    pub checkpoint_every_n_writes: u64,
    pub storage_dir: PathBuf,
}

/// Durability faults raised by the background thread. Once failed, the
/// engine stops accepting writes and the process should exit for its
/// supervisor to restart it.
#[derive(Default)]
pub struct FaultState {
    failed: AtomicBool,
    message: PlMutex<Option<String>>,
}

impl FaultState {
    pub fn fail(&self, message: String) {
        tracing::error!("Reconciler durability fault: {}", message);
        *self.message.lock() = Some(message);
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ReconcilerStats {
    pub reconciliations: u64,
    pub entries_processed: u64,
    pub checkpoints: u64,
    pub current_interval_ms: u64,
    pub running: bool,
}

pub struct Reconciler {
    config: ReconcilerConfig,
    write_log: Arc<WriteLog>,
    read_view: Arc<ReadView>,
    vector_index: Arc<VectorIndex>,
    wal: Arc<Mutex<WriteAheadLog>>,
    fault: Arc<FaultState>,

    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,

    reconciliations: Arc<AtomicU64>,
    entries_processed: Arc<AtomicU64>,
    checkpoints: Arc<AtomicU64>,
    current_interval_ms: Arc<AtomicU64>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        write_log: Arc<WriteLog>,
        read_view: Arc<ReadView>,
        vector_index: Arc<VectorIndex>,
        wal: Arc<Mutex<WriteAheadLog>>,
        fault: Arc<FaultState>,
    ) -> Self {
        let initial_interval = config.interval_max_ms;
        Self {
            config,
            write_log,
            read_view,
            vector_index,
            wal,
            fault,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            reconciliations: Arc::new(AtomicU64::new(0)),
            entries_processed: Arc::new(AtomicU64::new(0)),
            checkpoints: Arc::new(AtomicU64::new(0)),
            current_interval_ms: Arc::new(AtomicU64::new(initial_interval)),
        }
    }

    pub fn start(&mut self) {
        if self.running.load(Ordering::Relaxed) {
            return;
        }
        self.running.store(true, Ordering::Relaxed);

        let config = self.config.clone();
        let write_log = Arc::clone(&self.write_log);
        let read_view = Arc::clone(&self.read_view);
        let vector_index = Arc::clone(&self.vector_index);
        let wal = Arc::clone(&self.wal);
        let fault = Arc::clone(&self.fault);
        let running = Arc::clone(&self.running);
        let reconciliations = Arc::clone(&self.reconciliations);
        let entries_processed = Arc::clone(&self.entries_processed);
        let checkpoints = Arc::clone(&self.checkpoints);
        let current_interval_ms = Arc::clone(&self.current_interval_ms);

        let handle = thread::spawn(move || {
            reconcile_loop(
                config,
                write_log,
                read_view,
                vector_index,
                wal,
                fault,
                running,
                reconciliations,
                entries_processed,
                checkpoints,
                current_interval_ms,
            );
        });
        self.thread_handle = Some(handle);

        tracing::info!(
            "Reconciler started (intervals {}/{}/{} ms)",
            self.config.interval_low_ms,
            self.config.interval_high_ms,
            self.config.interval_max_ms
        );
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.take() {
            handle.join().ok();
        }
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            entries_processed: self.entries_processed.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            current_interval_ms: self.current_interval_ms.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pick_interval(config: &ReconcilerConfig, rate: f64) -> u64 {
    let interval = if rate >= HIGH_RATE_THRESHOLD {
        config.interval_low_ms
    } else if rate >= LOW_RATE_THRESHOLD {
        config.interval_high_ms
    } else {
        config.interval_max_ms
    };
    interval.min(config.interval_max_ms)
}

#[allow(clippy::too_many_arguments)]
fn reconcile_loop(
    config: ReconcilerConfig,
    write_log: Arc<WriteLog>,
    read_view: Arc<ReadView>,
    vector_index: Arc<VectorIndex>,
    wal: Arc<Mutex<WriteAheadLog>>,
    fault: Arc<FaultState>,
    running: Arc<AtomicBool>,
    reconciliations: Arc<AtomicU64>,
    entries_processed: Arc<AtomicU64>,
    checkpoints: Arc<AtomicU64>,
    current_interval_ms: Arc<AtomicU64>,
) {
    let mut rate_ema = 0.0f64;
    let mut last_cycle = Instant::now();
    let mut writes_since_checkpoint = 0u64;

    while running.load(Ordering::Relaxed) {
        let interval = Duration::from_millis(current_interval_ms.load(Ordering::Relaxed));
        thread::sleep(interval);

        let mut batch = write_log.drain();
        let elapsed = last_cycle.elapsed().as_secs_f64().max(1e-6);
        last_cycle = Instant::now();

        let rate = batch.len() as f64 / elapsed;
        rate_ema = if rate_ema == 0.0 {
            rate
        } else {
            RATE_EMA_ALPHA * rate + (1.0 - RATE_EMA_ALPHA) * rate_ema
        };
        current_interval_ms.store(pick_interval(&config, rate_ema), Ordering::Relaxed);

        if batch.is_empty() {
            continue;
        }

        // Apply in sequence order; admission order already matches, the sort
        // is what makes I4 unconditional.
        batch.sort_by_key(|e| e.seq());
        let batch_len = batch.len() as u64;
        let max_seq = batch.last().map(|e| e.seq()).unwrap_or(0);

        let current = read_view.load();
        let mut next = GraphSnapshot {
            concepts: current.concepts.clone(),
            word_index: current.word_index.clone(),
            sequence: current.sequence,
            timestamp: current_timestamp_us(),
            concept_count: current.concept_count,
            edge_count: current.edge_count,
        };

        let mut vector_updates: Vec<(crate::types::ConceptId, Option<Arc<[f32]>>)> = Vec::new();

        for entry in &batch {
            apply_entry(&mut next, entry, &mut vector_updates);
        }

        next.update_stats();
        // Everything below max_seq + 1 is now reflected
        next.sequence = max_seq + 1;
        read_view.store(next);

        reconciliations.fetch_add(1, Ordering::Relaxed);
        entries_processed.fetch_add(batch_len, Ordering::Relaxed);
        writes_since_checkpoint += batch_len;

        // Vector index deltas, applied by this thread only
        for (id, vector) in vector_updates {
            match vector {
                Some(v) => {
                    if let Err(e) = vector_index.insert(id, &v) {
                        tracing::warn!("Vector index insert for {} failed: {}", id, e);
                    }
                }
                None => vector_index.remove(&id),
            }
        }

        if writes_since_checkpoint >= config.checkpoint_every_n_writes {
            let snapshot = read_view.load();
            match checkpoint(&snapshot, &vector_index, &wal, &config.storage_dir, max_seq) {
                Ok(()) => {
                    checkpoints.fetch_add(1, Ordering::Relaxed);
                    writes_since_checkpoint = 0;
                }
                Err(e) => {
                    // Checkpoint failure threatens durability of the WAL
                    // truncation contract; stop taking writes.
                    fault.fail(format!("checkpoint failed: {}", e));
                    return;
                }
            }
        }
    }
}

/// Persist the snapshot and index, then drop WAL entries the checkpoint covers
fn checkpoint(
    snapshot: &GraphSnapshot,
    vector_index: &VectorIndex,
    wal: &Arc<Mutex<WriteAheadLog>>,
    storage_dir: &std::path::Path,
    through_seq: u64,
) -> anyhow::Result<()> {
    store::persist_snapshot(snapshot, storage_dir)?;
    vector_index.persist()?;

    let mut wal = wal.lock().expect("WAL lock poisoned");
    wal.truncate_before(through_seq)?;
    Ok(())
}

/// Apply a single write entry to the snapshot under construction. Also used
/// by engine recovery to fold replayed WAL entries into the initial snapshot.
pub(crate) fn apply_entry(
    snapshot: &mut GraphSnapshot,
    entry: &WriteEntry,
    vector_updates: &mut Vec<(crate::types::ConceptId, Option<Arc<[f32]>>)>,
) {
    match entry {
        WriteEntry::LearnConcept {
            id,
            content,
            vector,
            strength,
            confidence,
            semantic,
            timestamp,
            ..
        } => {
            let timestamp = *timestamp;
            let node = match snapshot.concepts.get(id) {
                Some(existing) => {
                    // Re-learn of known content: strengthen and refresh
                    let mut node = existing.clone();
                    node.strength = clamp_strength(node.strength * STRENGTH_GROWTH);
                    node.confidence = clamp_confidence(node.confidence.max(*confidence));
                    node.last_accessed = timestamp;
                    node.access_count += 1;
                    if let Some(v) = vector {
                        node.vector = Some(Arc::from(v.to_vec()));
                    }
                    if semantic.is_some() {
                        node.semantic = *semantic;
                    }
                    node
                }
                None => {
                    let mut node = ConceptNode::new(
                        *id,
                        content.to_vec(),
                        vector.as_ref().map(|v| v.to_vec()),
                        clamp_strength(*strength),
                        clamp_confidence(*confidence),
                        timestamp,
                    );
                    node.semantic = *semantic;
                    node
                }
            };
            if let Some(v) = &node.vector {
                vector_updates.push((*id, Some(Arc::clone(v))));
            }
            snapshot.upsert_concept(node);
        }

        WriteEntry::LearnAssociation {
            source,
            target,
            assoc_type,
            confidence,
            ..
        } => {
            // The source concept must exist in the snapshot; targets may be
            // forward references and traversal skips them while dangling.
            if let Some(node) = snapshot.concepts.get(source) {
                let mut node = node.clone();
                node.upsert_edge(
                    *target,
                    *assoc_type,
                    clamp_confidence(*confidence),
                    current_timestamp_us(),
                );
                snapshot.concepts.insert(*source, node);
            }
        }

        WriteEntry::Strengthen { id, .. } => {
            if let Some(node) = snapshot.concepts.get(id) {
                let mut node = node.clone();
                node.strength = clamp_strength(node.strength * STRENGTH_GROWTH);
                node.last_accessed = current_timestamp_us();
                node.access_count += 1;
                snapshot.concepts.insert(*id, node);
            }
        }

        WriteEntry::SetStrength { id, strength, .. } => {
            if let Some(node) = snapshot.concepts.get(id) {
                let mut node = node.clone();
                node.strength = clamp_strength(*strength);
                snapshot.concepts.insert(*id, node);
            }
        }

        WriteEntry::Remove { id, .. } => {
            snapshot.remove_concept(id);
            vector_updates.push((*id, None));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssociationType, ConceptId};
    use crate::vector_index::VectorIndexConfig;
    use crate::write_log::OverflowPolicy;
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn setup(dir: &TempDir) -> (Arc<WriteLog>, Arc<ReadView>, Reconciler, Arc<FaultState>) {
        let write_log = Arc::new(WriteLog::new(OverflowPolicy::Block));
        let read_view = Arc::new(ReadView::new());
        let vector_index = Arc::new(VectorIndex::new(
            dir.path().join("vectors"),
            VectorIndexConfig::for_dimension(DIM),
        ));
        vector_index
            .load_or_build(&std::collections::HashMap::new())
            .unwrap();
        let wal = Arc::new(Mutex::new(
            WriteAheadLog::open(dir.path().join("wal.log"), false).unwrap(),
        ));
        let fault = Arc::new(FaultState::default());

        let config = ReconcilerConfig {
            interval_low_ms: 1,
            interval_high_ms: 5,
            interval_max_ms: 10,
            checkpoint_every_n_writes: 1_000_000,
            storage_dir: dir.path().to_path_buf(),
        };

        let reconciler = Reconciler::new(
            config,
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            vector_index,
            wal,
            Arc::clone(&fault),
        );

        (write_log, read_view, reconciler, fault)
    }

    fn concept_entry(seq: u64, content: &str, vector: Option<Vec<f32>>) -> WriteEntry {
        WriteEntry::LearnConcept {
            seq,
            id: ConceptId::from_content(content.as_bytes()),
            content: content.as_bytes().to_vec().into_boxed_slice(),
            vector: vector.map(|v| v.into_boxed_slice()),
            strength: 1.0,
            confidence: 0.9,
            semantic: None,
            timestamp: 1000,
        }
    }

    #[test]
    fn test_applies_and_publishes() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler, _) = setup(&dir);

        reconciler.start();

        write_log.append(concept_entry(0, "alpha", None)).unwrap();
        write_log.append(concept_entry(1, "beta", None)).unwrap();

        thread::sleep(Duration::from_millis(100));

        let snapshot = read_view.load();
        assert_eq!(snapshot.concept_count, 2);
        assert!(snapshot.contains(&ConceptId::from_content(b"alpha")));
        assert_eq!(snapshot.sequence, 2);

        reconciler.stop();
    }

    #[test]
    fn test_relearn_strengthens_single_record() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler, _) = setup(&dir);
        reconciler.start();

        write_log.append(concept_entry(0, "gamma", None)).unwrap();
        write_log.append(concept_entry(1, "gamma", None)).unwrap();

        thread::sleep(Duration::from_millis(100));

        let snapshot = read_view.load();
        assert_eq!(snapshot.concept_count, 1);

        let node = snapshot
            .get_concept(&ConceptId::from_content(b"gamma"))
            .unwrap();
        assert!(node.strength > 1.0);
        assert_eq!(node.access_count, 1);

        reconciler.stop();
    }

    #[test]
    fn test_association_dedup_and_reinforce() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler, _) = setup(&dir);
        reconciler.start();

        let source = ConceptId::from_content(b"src");
        let target = ConceptId::from_content(b"dst");

        write_log.append(concept_entry(0, "src", None)).unwrap();
        for seq in 1..4 {
            write_log
                .append(WriteEntry::LearnAssociation {
                    seq,
                    source,
                    target,
                    assoc_type: AssociationType::Causal,
                    confidence: 0.7,
                })
                .unwrap();
        }

        thread::sleep(Duration::from_millis(100));

        let snapshot = read_view.load();
        let node = snapshot.get_concept(&source).unwrap();
        assert_eq!(node.edges.len(), 1);
        assert_eq!(node.edges[0].reinforcement_count, 3);

        reconciler.stop();
    }

    #[test]
    fn test_strength_clamped_at_cap() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler, _) = setup(&dir);
        reconciler.start();

        let id = ConceptId::from_content(b"hot");
        write_log.append(concept_entry(0, "hot", None)).unwrap();
        for seq in 1..60 {
            write_log
                .append(WriteEntry::Strengthen { seq, id })
                .unwrap();
        }

        thread::sleep(Duration::from_millis(150));

        let snapshot = read_view.load();
        let node = snapshot.get_concept(&id).unwrap();
        assert!(node.strength <= 10.0);
        assert!((node.strength - 10.0).abs() < 1e-3);

        reconciler.stop();
    }

    #[test]
    fn test_remove_drops_concept() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler, _) = setup(&dir);
        reconciler.start();

        let id = ConceptId::from_content(b"ephemeral");
        write_log.append(concept_entry(0, "ephemeral", None)).unwrap();
        write_log.append(WriteEntry::Remove { seq: 1, id }).unwrap();

        thread::sleep(Duration::from_millis(100));

        let snapshot = read_view.load();
        assert!(!snapshot.contains(&id));

        reconciler.stop();
    }

    #[test]
    fn test_interval_selection() {
        let config = ReconcilerConfig {
            interval_low_ms: 1,
            interval_high_ms: 10,
            interval_max_ms: 100,
            checkpoint_every_n_writes: 1000,
            storage_dir: PathBuf::from("."),
        };

        assert_eq!(pick_interval(&config, 100.0), 100);
        assert_eq!(pick_interval(&config, 5_000.0), 10);
        assert_eq!(pick_interval(&config, 50_000.0), 1);
    }

    #[test]
    fn test_snapshot_sequences_monotonic() {
        let dir = TempDir::new().unwrap();
        let (write_log, read_view, mut reconciler, _) = setup(&dir);
        reconciler.start();

        let mut last_seq = 0u64;
        for i in 0..20u64 {
            write_log
                .append(concept_entry(i, &format!("concept {}", i), None))
                .unwrap();
            thread::sleep(Duration::from_millis(15));
            let seq = read_view.load().sequence;
            assert!(seq >= last_seq, "sequence went backwards: {} < {}", seq, last_seq);
            last_seq = seq;
        }

        reconciler.stop();
    }
}
