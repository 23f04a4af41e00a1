/// Flat binary checkpoint file (storage.dat)
///
/// Layout, little-endian throughout:
/// ```text
/// Header (64 bytes): magic "SUTRADAT" (8) | version (4) | concept_count (4) |
///                    edge_count (4) | vector_count (4) | reserved (40)
/// Concepts section:  repeated { id(16) | content_len(4) | strength(4 f32) |
///                               confidence(4 f32) | access_count(4) |
///                               created(4) | content(content_len bytes) }
/// Edges section:     repeated { source(16) | target(16) | confidence(4 f32) }
/// Vectors section:   repeated { id(16) | dim(4) | dim x 4 bytes f32 }
/// ```
///
/// The edge section carries no association type; edges rehydrate as Semantic
/// with unit weight. Exact types live in the WAL between checkpoints.
use anyhow::{Context, Result};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::EngineError;
use crate::read_view::{ConceptNode, GraphSnapshot};
use crate::types::{AssociationType, ConceptId};

/// Magic bytes for checkpoint files
pub const MAGIC_BYTES: &[u8; 8] = b"SUTRADAT";

/// Version of the checkpoint format
pub const STORAGE_VERSION: u32 = 1;

const HEADER_SIZE: usize = 64;

/// File name inside the storage directory
pub const CHECKPOINT_FILE: &str = "storage.dat";

/// Persist a snapshot to `dir/storage.dat`. The file is written to a
/// temporary path and atomically renamed over the old checkpoint.
pub fn persist_snapshot(snapshot: &GraphSnapshot, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(CHECKPOINT_FILE);
    let tmp_path = dir.join("storage.dat.tmp");

    let concept_count = snapshot.concepts.len() as u32;
    let edge_count: u32 = snapshot
        .concepts
        .values()
        .map(|n| n.edges.len() as u32)
        .sum();
    let vector_count: u32 = snapshot
        .concepts
        .values()
        .filter(|n| n.vector.is_some())
        .count() as u32;

    {
        let file = File::create(&tmp_path).context("Failed to create checkpoint file")?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0..8].copy_from_slice(MAGIC_BYTES);
        header[8..12].copy_from_slice(&STORAGE_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&concept_count.to_le_bytes());
        header[16..20].copy_from_slice(&edge_count.to_le_bytes());
        header[20..24].copy_from_slice(&vector_count.to_le_bytes());
        writer.write_all(&header)?;

        // Concepts section
        for node in snapshot.concepts.values() {
            writer.write_all(&node.id.0)?;
            writer.write_all(&(node.content.len() as u32).to_le_bytes())?;
            writer.write_all(&node.strength.to_le_bytes())?;
            writer.write_all(&node.confidence.to_le_bytes())?;
            writer.write_all(&node.access_count.to_le_bytes())?;
            let created_secs = (node.created / 1_000_000) as u32;
            writer.write_all(&created_secs.to_le_bytes())?;
            writer.write_all(&node.content)?;
        }

        // Edges section
        for node in snapshot.concepts.values() {
            for edge in &node.edges {
                writer.write_all(&node.id.0)?;
                writer.write_all(&edge.target.0)?;
                writer.write_all(&edge.confidence.to_le_bytes())?;
            }
        }

        // Vectors section
        for node in snapshot.concepts.values() {
            if let Some(vector) = &node.vector {
                writer.write_all(&node.id.0)?;
                writer.write_all(&(vector.len() as u32).to_le_bytes())?;
                for value in vector.iter() {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
        }

        writer.flush()?;
        writer
            .get_ref()
            .sync_all()
            .context("Failed to sync checkpoint")?;
    }

    std::fs::rename(&tmp_path, &final_path).context("Failed to swap checkpoint file")?;

    tracing::info!(
        "Checkpoint written: {} concepts, {} edges, {} vectors",
        concept_count,
        edge_count,
        vector_count
    );

    Ok(())
}

/// A little-endian cursor over the mapped checkpoint
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], EngineError> {
        if self.pos + n > self.data.len() {
            return Err(EngineError::Corruption(format!(
                "checkpoint truncated at byte {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> std::result::Result<u32, EngineError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f32(&mut self) -> std::result::Result<f32, EngineError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_id(&mut self) -> std::result::Result<ConceptId, EngineError> {
        let bytes = self.take(16)?;
        let mut id = [0u8; 16];
        id.copy_from_slice(bytes);
        Ok(ConceptId(id))
    }
}

/// Load `dir/storage.dat` into a snapshot plus the vectors it carried.
/// Returns Ok(None) when no checkpoint exists.
pub fn load_snapshot(
    dir: &Path,
    expected_dimension: usize,
) -> std::result::Result<Option<(GraphSnapshot, HashMap<ConceptId, Vec<f32>>)>, EngineError> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(&path).map_err(|e| EngineError::Corruption(e.to_string()))?;
    // Read-only mapping; the file is exclusive to this process
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| EngineError::Corruption(e.to_string()))?;

    if mmap.len() < HEADER_SIZE {
        return Err(EngineError::Corruption("checkpoint smaller than header".to_string()));
    }

    let mut cursor = Cursor {
        data: &mmap,
        pos: 0,
    };

    let magic = cursor.take(8)?;
    if magic != MAGIC_BYTES {
        return Err(EngineError::Corruption(
            "bad checkpoint magic, expected SUTRADAT".to_string(),
        ));
    }

    let version = cursor.read_u32()?;
    if version != STORAGE_VERSION {
        return Err(EngineError::IncompatibleFormat(format!(
            "checkpoint version {} (expected {})",
            version, STORAGE_VERSION
        )));
    }

    let concept_count = cursor.read_u32()? as usize;
    let edge_count = cursor.read_u32()? as usize;
    let vector_count = cursor.read_u32()? as usize;
    cursor.take(40)?; // reserved

    let mut snapshot = GraphSnapshot::new(0);
    let now = crate::types::current_timestamp_us();

    // Concepts section
    for _ in 0..concept_count {
        let id = cursor.read_id()?;
        let content_len = cursor.read_u32()? as usize;
        let strength = cursor.read_f32()?;
        let confidence = cursor.read_f32()?;
        let access_count = cursor.read_u32()?;
        let created_secs = cursor.read_u32()?;
        let content = cursor.take(content_len)?.to_vec();

        let mut node = ConceptNode::new(
            id,
            content,
            None,
            strength,
            confidence,
            created_secs as u64 * 1_000_000,
        );
        node.access_count = access_count;
        node.last_accessed = now;
        snapshot.upsert_concept(node);
    }

    // Edges section
    for _ in 0..edge_count {
        let source = cursor.read_id()?;
        let target = cursor.read_id()?;
        let confidence = cursor.read_f32()?;

        if let Some(node) = snapshot.concepts.get(&source) {
            let mut node = node.clone();
            node.upsert_edge(target, AssociationType::Semantic, confidence, now);
            snapshot.concepts.insert(source, node);
        }
    }

    // Vectors section
    let mut vectors = HashMap::with_capacity(vector_count);
    for _ in 0..vector_count {
        let id = cursor.read_id()?;
        let dim = cursor.read_u32()? as usize;

        let bytes = cursor.take(dim * 4)?;
        if dim != expected_dimension {
            tracing::warn!(
                "Skipping checkpoint vector for {}: dimension {} != {}",
                id,
                dim,
                expected_dimension
            );
            continue;
        }

        let mut vector = Vec::with_capacity(dim);
        for chunk in bytes.chunks_exact(4) {
            vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }

        if let Some(node) = snapshot.concepts.get(&id) {
            let mut node = node.clone();
            node.vector = Some(vector.clone().into());
            snapshot.concepts.insert(id, node);
        }
        vectors.insert(id, vector);
    }

    snapshot.update_stats();
    tracing::info!(
        "Checkpoint loaded: {} concepts, {} edges, {} vectors",
        snapshot.concept_count,
        snapshot.edge_count,
        vectors.len()
    );

    Ok(Some((snapshot, vectors)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_snapshot() -> GraphSnapshot {
        let mut snapshot = GraphSnapshot::new(7);

        let id1 = ConceptId::from_content(b"water boils at 100 degrees");
        let id2 = ConceptId::from_content(b"steam is water vapor");

        let mut n1 = ConceptNode::new(
            id1,
            b"water boils at 100 degrees".to_vec(),
            Some(vec![0.5; 8]),
            2.5,
            0.9,
            1_700_000_000_000_000,
        );
        n1.access_count = 3;
        n1.upsert_edge(id2, AssociationType::Semantic, 0.8, 1000);

        let n2 = ConceptNode::new(
            id2,
            b"steam is water vapor".to_vec(),
            None,
            1.0,
            0.7,
            1_700_000_000_000_000,
        );

        snapshot.upsert_concept(n1);
        snapshot.upsert_concept(n2);
        snapshot.update_stats();
        snapshot
    }

    #[test]
    fn test_persist_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let snapshot = build_snapshot();

        persist_snapshot(&snapshot, dir.path()).unwrap();

        let (loaded, vectors) = load_snapshot(dir.path(), 8).unwrap().unwrap();

        assert_eq!(loaded.concept_count, 2);
        assert_eq!(loaded.edge_count, 1);
        assert_eq!(vectors.len(), 1);

        let id1 = ConceptId::from_content(b"water boils at 100 degrees");
        let node = loaded.get_concept(&id1).unwrap();
        assert_eq!(node.content.as_ref(), b"water boils at 100 degrees");
        assert_eq!(node.strength, 2.5);
        assert_eq!(node.access_count, 3);
        assert!(node.vector.is_some());
        assert_eq!(node.edges.len(), 1);
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_snapshot(dir.path(), 8).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CHECKPOINT_FILE), vec![0u8; 128]).unwrap();

        let err = load_snapshot(dir.path(), 8).unwrap_err();
        assert!(matches!(err, EngineError::Corruption(_)));
    }

    #[test]
    fn test_version_mismatch_is_incompatible() {
        let dir = TempDir::new().unwrap();

        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(MAGIC_BYTES);
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        std::fs::write(dir.path().join(CHECKPOINT_FILE), bytes).unwrap();

        let err = load_snapshot(dir.path(), 8).unwrap_err();
        assert!(matches!(err, EngineError::IncompatibleFormat(_)));
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let snapshot = build_snapshot();
        persist_snapshot(&snapshot, dir.path()).unwrap();

        let path = dir.path().join(CHECKPOINT_FILE);
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 10]).unwrap();

        let err = load_snapshot(dir.path(), 8).unwrap_err();
        assert!(matches!(err, EngineError::Corruption(_)));
    }
}
