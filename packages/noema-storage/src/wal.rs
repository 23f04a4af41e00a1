/// Write-Ahead Log (WAL) for durability and crash recovery
///
/// Every mutation is logged before any in-memory state advances. On restart
/// the log is replayed to restore state: operations inside a transaction are
/// buffered and surface only when the matching commit record is seen;
/// uncommitted operations at end-of-file are discarded. A torn final record
/// is tolerated and truncated away.
///
/// Record format: u32 little-endian length prefix + MessagePack entry.
use crate::semantic::SemanticType;
use crate::types::{AssociationType, ConceptId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// WAL operation type
///
/// Concept writes carry the full content and vector so that replay alone
/// reconstructs every acknowledged operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Operation {
    LearnConcept {
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        semantic: Option<SemanticType>,
    },
    LearnAssociation {
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        confidence: f32,
    },
    Strengthen {
        id: ConceptId,
    },
    SetStrength {
        id: ConceptId,
        strength: f32,
    },
    Remove {
        id: ConceptId,
    },
    BeginTxn {
        txn_id: u64,
    },
    CommitTxn {
        txn_id: u64,
    },
    RollbackTxn {
        txn_id: u64,
    },
}

/// WAL entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number (monotonically increasing)
    pub sequence: u64,
    /// Timestamp (microseconds since epoch)
    pub timestamp: u64,
    /// Operation
    pub operation: Operation,
    /// Transaction this entry belongs to, if any
    pub transaction_id: Option<u64>,
}

impl LogEntry {
    pub fn new(sequence: u64, operation: Operation, transaction_id: Option<u64>) -> Self {
        Self {
            sequence,
            timestamp: crate::types::current_timestamp_us(),
            operation,
            transaction_id,
        }
    }
}

/// Write-Ahead Log
pub struct WriteAheadLog {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Next sequence number; shared so WriteLog entries carry the same space
    next_sequence: Arc<AtomicU64>,
    /// Whether to fsync after each write
    fsync: bool,
    /// Next transaction ID
    next_transaction_id: Arc<AtomicU64>,
}

impl WriteAheadLog {
    /// Open the WAL at `path`, creating it if absent. Existing entries set
    /// the next sequence number; a torn tail is truncated away.
    pub fn open<P: AsRef<Path>>(path: P, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_sequence, next_txn) = if path.exists() {
            let (entries, valid_len) = Self::read_entries_tolerant(&path)?;
            let file_len = std::fs::metadata(&path)?.len();
            if valid_len < file_len {
                tracing::warn!(
                    "Truncating torn WAL tail: {} -> {} bytes",
                    file_len,
                    valid_len
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
                file.sync_all().context("Failed to sync truncated WAL")?;
            }
            let next_seq = entries.last().map(|e| e.sequence + 1).unwrap_or(0);
            let next_txn = entries
                .iter()
                .filter_map(|e| match e.operation {
                    Operation::BeginTxn { txn_id } => Some(txn_id + 1),
                    _ => None,
                })
                .max()
                .unwrap_or(1);
            (next_seq, next_txn)
        } else {
            (0, 1)
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open WAL file")?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence: Arc::new(AtomicU64::new(next_sequence)),
            fsync,
            next_transaction_id: Arc::new(AtomicU64::new(next_txn)),
        })
    }

    /// Append an operation outside any transaction
    pub fn append(&mut self, operation: Operation) -> Result<u64> {
        self.append_entry(operation, None)
    }

    /// Append an operation tagged with a transaction id
    pub fn append_in_txn(&mut self, operation: Operation, txn_id: u64) -> Result<u64> {
        self.append_entry(operation, Some(txn_id))
    }

    fn append_entry(&mut self, operation: Operation, txn_id: Option<u64>) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let entry = LogEntry::new(sequence, operation, txn_id);

        let bytes = rmp_serde::to_vec(&entry).context("Failed to serialize entry")?;

        let len_bytes = (bytes.len() as u32).to_le_bytes();
        self.writer
            .write_all(&len_bytes)
            .context("Failed to write length")?;
        self.writer
            .write_all(&bytes)
            .context("Failed to write entry")?;

        // The entry must at least reach the OS page cache before returning
        self.writer.flush().context("Failed to flush")?;
        if self.fsync {
            self.writer
                .get_ref()
                .sync_all()
                .context("Failed to fsync")?;
        }

        Ok(sequence)
    }

    /// Allocate a fresh transaction id
    pub fn next_txn_id(&self) -> u64 {
        self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Write a BeginTxn framing entry
    pub fn begin(&mut self, txn_id: u64) -> Result<u64> {
        self.append_in_txn(Operation::BeginTxn { txn_id }, txn_id)
    }

    /// Write a CommitTxn framing entry
    pub fn commit(&mut self, txn_id: u64) -> Result<u64> {
        self.append_in_txn(Operation::CommitTxn { txn_id }, txn_id)
    }

    /// Write a RollbackTxn framing entry
    pub fn rollback(&mut self, txn_id: u64) -> Result<u64> {
        self.append_in_txn(Operation::RollbackTxn { txn_id }, txn_id)
    }

    /// Flush buffered writes and sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush WAL")?;
        self.writer
            .get_ref()
            .sync_all()
            .context("Failed to sync WAL")?;
        Ok(())
    }

    /// Read entries, stopping at the first torn or corrupt record.
    /// Returns the parsed entries and the byte length of the valid prefix.
    fn read_entries_tolerant(path: &Path) -> Result<(Vec<LogEntry>, u64)> {
        let mut file = File::open(path).context("Failed to open WAL file")?;

        let mut entries = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).context("Failed to read length prefix"),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut entry_buf = vec![0u8; len];
            match file.read_exact(&mut entry_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Partial final record: tolerate and stop
                    break;
                }
                Err(e) => return Err(e).context("Failed to read entry data"),
            }

            match rmp_serde::from_slice::<LogEntry>(&entry_buf) {
                Ok(entry) => {
                    entries.push(entry);
                    valid_len += 4 + len as u64;
                }
                Err(_) => {
                    // Corrupt trailing bytes: stop at the last good record
                    break;
                }
            }
        }

        Ok((entries, valid_len))
    }

    /// Read all parseable entries from the log
    pub fn read_entries<P: AsRef<Path>>(path: P) -> Result<Vec<LogEntry>> {
        Self::read_entries_tolerant(path.as_ref()).map(|(entries, _)| entries)
    }

    /// Replay the log and return committed operations in sequence order.
    ///
    /// Operations inside an open transaction are buffered; CommitTxn flushes
    /// them in original order, RollbackTxn discards them. Entries outside any
    /// transaction are emitted immediately. Transactions still open at
    /// end-of-file are discarded.
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<Vec<LogEntry>> {
        let entries = Self::read_entries(path)?;

        let mut committed = Vec::new();
        let mut transaction_ops: std::collections::HashMap<u64, Vec<LogEntry>> =
            std::collections::HashMap::new();

        for entry in entries {
            match &entry.operation {
                Operation::BeginTxn { txn_id } => {
                    transaction_ops.insert(*txn_id, Vec::new());
                }
                Operation::CommitTxn { txn_id } => {
                    if let Some(ops) = transaction_ops.remove(txn_id) {
                        committed.extend(ops);
                    }
                }
                Operation::RollbackTxn { txn_id } => {
                    transaction_ops.remove(txn_id);
                }
                _ => {
                    if let Some(txn_id) = entry.transaction_id {
                        transaction_ops.entry(txn_id).or_default().push(entry);
                    } else {
                        committed.push(entry);
                    }
                }
            }
        }

        Ok(committed)
    }

    /// Remove entries with sequence <= `seq` after a checkpoint has been
    /// persisted. The retained suffix is rewritten atomically.
    pub fn truncate_before(&mut self, seq: u64) -> Result<()> {
        self.writer.flush().context("Failed to flush WAL")?;

        let (entries, _) = Self::read_entries_tolerant(&self.path)?;
        let retained: Vec<&LogEntry> = entries.iter().filter(|e| e.sequence > seq).collect();

        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let file = File::create(&tmp_path).context("Failed to create WAL rewrite file")?;
            let mut writer = BufWriter::new(file);
            for entry in &retained {
                let bytes = rmp_serde::to_vec(entry).context("Failed to serialize entry")?;
                writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
                writer.write_all(&bytes)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all().context("Failed to sync WAL rewrite")?;
        }
        std::fs::rename(&tmp_path, &self.path).context("Failed to swap WAL file")?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to reopen WAL file")?;
        self.writer = BufWriter::new(file);

        Ok(())
    }

    /// Get current sequence number
    pub fn sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
