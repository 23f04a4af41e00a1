/// In-memory write queue between callers and the reconciler
///
/// Append-only, optimized for burst writes: producers contend only on the
/// channel send, the reconciler drains in bulk. Sequence numbers are assigned
/// by the WAL before admission, so WriteLog and WAL share one sequence space.
///
/// A transaction's operations are admitted as a single batch; a drain can
/// therefore never observe half a transaction.
use crate::error::EngineError;
use crate::semantic::SemanticType;
use crate::types::{AssociationType, ConceptId};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Maximum pending entries before backpressure
pub const MAX_WRITE_LOG_SIZE: usize = 100_000;

/// How long a blocked producer waits before surfacing `Overloaded`
const BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Write log entry types. Each carries the WAL-assigned sequence.
#[derive(Debug, Clone)]
pub enum WriteEntry {
    LearnConcept {
        seq: u64,
        id: ConceptId,
        content: Box<[u8]>,
        vector: Option<Box<[f32]>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticType>,
        timestamp: u64,
    },
    LearnAssociation {
        seq: u64,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    },
    Strengthen {
        seq: u64,
        id: ConceptId,
    },
    SetStrength {
        seq: u64,
        id: ConceptId,
        strength: f32,
    },
    Remove {
        seq: u64,
        id: ConceptId,
    },
}

impl WriteEntry {
    pub fn seq(&self) -> u64 {
        match self {
            Self::LearnConcept { seq, .. }
            | Self::LearnAssociation { seq, .. }
            | Self::Strengthen { seq, .. }
            | Self::SetStrength { seq, .. }
            | Self::Remove { seq, .. } => *seq,
        }
    }
}

/// One channel message: a lone entry or a whole committed transaction
#[derive(Debug, Clone)]
enum Admission {
    One(WriteEntry),
    Txn(Vec<WriteEntry>),
}

impl Admission {
    fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Txn(entries) => entries.len(),
        }
    }
}

/// Overflow policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the producer (default); surfaces `Overloaded` after a bounded wait
    Block,
    /// Evict the oldest admission to make room; exposed via the dropped counter
    EvictOldest,
}

/// Write log statistics
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct WriteLogStats {
    pub highest_seq: u64,
    pub written: u64,
    pub dropped: u64,
    pub pending: usize,
    pub capacity: usize,
}

/// Bounded write queue: many producers, one drainer
pub struct WriteLog {
    sender: Sender<Admission>,
    receiver: Receiver<Admission>,
    policy: OverflowPolicy,
    highest_seq: Arc<AtomicU64>,
    pending_entries: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl WriteLog {
    pub fn new(policy: OverflowPolicy) -> Self {
        let (sender, receiver) = bounded(MAX_WRITE_LOG_SIZE);

        Self {
            sender,
            receiver,
            policy,
            highest_seq: Arc::new(AtomicU64::new(0)),
            pending_entries: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Admit a single entry
    pub fn append(&self, entry: WriteEntry) -> Result<u64, EngineError> {
        let seq = entry.seq();
        self.admit(Admission::One(entry))?;
        Ok(seq)
    }

    /// Admit a committed transaction's entries as one atomic batch
    pub fn append_txn(&self, entries: Vec<WriteEntry>) -> Result<(), EngineError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.admit(Admission::Txn(entries))
    }

    fn admit(&self, admission: Admission) -> Result<(), EngineError> {
        let count = admission.len();
        let max_seq = match &admission {
            Admission::One(e) => e.seq(),
            Admission::Txn(es) => es.iter().map(|e| e.seq()).max().unwrap_or(0),
        };

        match self.policy {
            OverflowPolicy::Block => {
                self.sender
                    .send_timeout(admission, BLOCK_TIMEOUT)
                    .map_err(|_| EngineError::Overloaded)?;
            }
            OverflowPolicy::EvictOldest => {
                let mut pending = admission;
                loop {
                    match self.sender.try_send(pending) {
                        Ok(()) => break,
                        Err(TrySendError::Full(returned)) => {
                            if let Ok(evicted) = self.receiver.try_recv() {
                                self.pending_entries
                                    .fetch_sub(evicted.len(), Ordering::Relaxed);
                                self.dropped.fetch_add(evicted.len() as u64, Ordering::Relaxed);
                            }
                            pending = returned;
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            return Err(EngineError::Durability(
                                "write log disconnected".to_string(),
                            ));
                        }
                    }
                }
            }
        }

        self.pending_entries.fetch_add(count, Ordering::Relaxed);
        self.written.fetch_add(count as u64, Ordering::Relaxed);
        self.highest_seq.fetch_max(max_seq, Ordering::Relaxed);
        Ok(())
    }

    /// Atomically extract all entries present at call time
    pub fn drain(&self) -> Vec<WriteEntry> {
        let mut batch = Vec::new();

        while let Ok(admission) = self.receiver.try_recv() {
            let count = admission.len();
            match admission {
                Admission::One(entry) => batch.push(entry),
                Admission::Txn(entries) => batch.extend(entries),
            }
            self.pending_entries.fetch_sub(count, Ordering::Relaxed);
        }

        batch
    }

    pub fn pending_count(&self) -> usize {
        self.pending_entries.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> WriteLogStats {
        WriteLogStats {
            highest_seq: self.highest_seq.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending_count(),
            capacity: MAX_WRITE_LOG_SIZE,
        }
    }
}

impl Default for WriteLog {
    fn default() -> Self {
        Self::new(OverflowPolicy::Block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept_entry(seq: u64, byte: u8) -> WriteEntry {
        WriteEntry::LearnConcept {
            seq,
            id: ConceptId([byte; 16]),
            content: vec![byte].into_boxed_slice(),
            vector: None,
            strength: 1.0,
            confidence: 0.9,
            semantic: None,
            timestamp: 1000,
        }
    }

    #[test]
    fn test_append_and_drain() {
        let log = WriteLog::default();

        for i in 0..10u64 {
            log.append(concept_entry(i, i as u8)).unwrap();
        }

        assert_eq!(log.pending_count(), 10);

        let drained = log.drain();
        assert_eq!(drained.len(), 10);
        assert_eq!(log.pending_count(), 0);

        // Entries come out in admission order
        for (i, entry) in drained.iter().enumerate() {
            assert_eq!(entry.seq(), i as u64);
        }
    }

    #[test]
    fn test_txn_batch_is_atomic_under_drain() {
        let log = WriteLog::default();

        log.append(concept_entry(0, 0)).unwrap();
        log.append_txn(vec![
            concept_entry(1, 1),
            WriteEntry::LearnAssociation {
                seq: 2,
                source: ConceptId([1; 16]),
                target: ConceptId([2; 16]),
                assoc_type: AssociationType::Semantic,
                confidence: 0.8,
            },
        ])
        .unwrap();

        let drained = log.drain();
        assert_eq!(drained.len(), 3);

        // A second drain finds nothing: the txn never splits across drains
        assert!(log.drain().is_empty());
    }

    #[test]
    fn test_stats_track_written_and_pending() {
        let log = WriteLog::default();

        for i in 0..25u64 {
            log.append(concept_entry(i, i as u8)).unwrap();
        }

        let stats = log.stats();
        assert_eq!(stats.written, 25);
        assert_eq!(stats.pending, 25);
        assert_eq!(stats.highest_seq, 24);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn test_evict_oldest_counts_drops() {
        let log = WriteLog::new(OverflowPolicy::EvictOldest);

        for i in 0..(MAX_WRITE_LOG_SIZE as u64 + 100) {
            log.append(concept_entry(i, (i % 256) as u8)).unwrap();
        }

        let stats = log.stats();
        assert!(stats.dropped >= 100, "expected drops, got {}", stats.dropped);
        assert!(stats.pending <= MAX_WRITE_LOG_SIZE);

        // The newest entries survive
        let drained = log.drain();
        let last = drained.last().unwrap().seq();
        assert_eq!(last, MAX_WRITE_LOG_SIZE as u64 + 99);
    }
}
