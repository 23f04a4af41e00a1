/// Core types for the Noema storage engine
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Concept ID: 16-byte identifier derived deterministically from content.
///
/// The identifying bits are the first 8 bytes of SHA-256 over the content;
/// the remaining 8 bytes are zero. The textual form is the 16 lowercase hex
/// characters of the identifying half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct ConceptId(pub [u8; 16]);

/// Number of hex characters in the textual id form
pub const CONCEPT_ID_HEX_LEN: usize = 16;

impl ConceptId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive the id from content. Pure function: same content, same id.
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&digest[..8]);
        Self(bytes)
    }

    /// Parse the 16-hex-char textual form
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != CONCEPT_ID_HEX_LEN {
            return None;
        }
        let decoded = hex::decode(s).ok()?;
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&decoded);
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Association type enum. Integer encoding is part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AssociationType {
    Semantic = 0,
    Causal = 1,
    Temporal = 2,
    Hierarchical = 3,
    Compositional = 4,
}

impl AssociationType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Semantic),
            1 => Some(Self::Causal),
            2 => Some(Self::Temporal),
            3 => Some(Self::Hierarchical),
            4 => Some(Self::Compositional),
            _ => None,
        }
    }

    /// Per-type traversal weight used in confidence propagation.
    /// Fixed constants, part of the algorithmic contract.
    pub fn traversal_weight(&self) -> f32 {
        match self {
            Self::Semantic => 1.0,
            Self::Causal => 1.1,
            Self::Temporal => 0.7,
            Self::Hierarchical => 0.9,
            Self::Compositional => 0.8,
        }
    }
}

/// Strength bounds for concepts
pub const STRENGTH_MIN: f32 = 1.0;
pub const STRENGTH_MAX: f32 = 10.0;

/// Weight soft cap for associations
pub const WEIGHT_CAP: f32 = 10.0;

/// Clamp strength into [1.0, 10.0]
pub fn clamp_strength(s: f32) -> f32 {
    s.clamp(STRENGTH_MIN, STRENGTH_MAX)
}

/// Clamp a confidence into [0.0, 1.0]
pub fn clamp_confidence(c: f32) -> f32 {
    c.clamp(0.0, 1.0)
}

/// Directed edge record as held in snapshots
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssociationEdge {
    pub target: ConceptId,
    pub assoc_type: AssociationType,
    pub confidence: f32,
    pub weight: f32,
    pub last_used: u64,
    pub reinforcement_count: u32,
}

impl AssociationEdge {
    pub fn new(target: ConceptId, assoc_type: AssociationType, confidence: f32, timestamp: u64) -> Self {
        Self {
            target,
            assoc_type,
            confidence: clamp_confidence(confidence),
            weight: 1.0,
            last_used: timestamp,
            reinforcement_count: 1,
        }
    }

    /// Reinforce an existing edge: weight grows toward the soft cap,
    /// confidence toward 1.0, and the reuse counter advances.
    pub fn reinforce(&mut self, confidence: f32, timestamp: u64) {
        self.weight += (WEIGHT_CAP - self.weight) * 0.1;
        let bumped = self.confidence.max(clamp_confidence(confidence));
        self.confidence = clamp_confidence(bumped + (1.0 - bumped) * 0.1);
        self.last_used = timestamp;
        self.reinforcement_count += 1;
    }
}

/// Get current timestamp in microseconds
pub fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_id_deterministic() {
        let a = ConceptId::from_content(b"Mount Everest is the tallest mountain on Earth.");
        let b = ConceptId::from_content(b"Mount Everest is the tallest mountain on Earth.");
        assert_eq!(a, b);

        let c = ConceptId::from_content(b"K2 is the second tallest mountain.");
        assert_ne!(a, c);
    }

    #[test]
    fn test_concept_id_hex_round_trip() {
        let id = ConceptId::from_content(b"some content");
        let hex = id.to_hex();
        assert_eq!(hex.len(), CONCEPT_ID_HEX_LEN);
        assert_eq!(ConceptId::from_hex(&hex), Some(id));
    }

    #[test]
    fn test_concept_id_rejects_bad_hex() {
        assert_eq!(ConceptId::from_hex("zz"), None);
        assert_eq!(ConceptId::from_hex("0123456789abcdef0"), None);
        assert_eq!(ConceptId::from_hex("not-hex-chars-16"), None);
    }

    #[test]
    fn test_association_type_codes() {
        assert_eq!(AssociationType::Semantic as u8, 0);
        assert_eq!(AssociationType::Causal as u8, 1);
        assert_eq!(AssociationType::Temporal as u8, 2);
        assert_eq!(AssociationType::Hierarchical as u8, 3);
        assert_eq!(AssociationType::Compositional as u8, 4);
        assert_eq!(AssociationType::from_u8(5), None);
    }

    #[test]
    fn test_clamping() {
        assert_eq!(clamp_strength(0.2), 1.0);
        assert_eq!(clamp_strength(15.0), 10.0);
        assert_eq!(clamp_confidence(-0.5), 0.0);
        assert_eq!(clamp_confidence(1.5), 1.0);
    }

    #[test]
    fn test_edge_reinforce_bounded() {
        let target = ConceptId::from_content(b"t");
        let mut edge = AssociationEdge::new(target, AssociationType::Semantic, 0.8, 1000);

        for _ in 0..1000 {
            edge.reinforce(0.9, 2000);
        }

        assert!(edge.weight <= WEIGHT_CAP);
        assert!(edge.confidence <= 1.0);
        assert_eq!(edge.reinforcement_count, 1001);
    }
}
