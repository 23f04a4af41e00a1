//! Request and response messages for the storage server
//!
//! Requests map one-to-one onto engine operations; responses mirror them with
//! an `Ok`-suffixed variant plus a single `Error` variant. Concept ids travel
//! as 16 lowercase hex characters.

use serde::{Deserialize, Serialize};

/// Options for the unified learning path (`LearnConceptV2` / `LearnBatch`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnOptionsMsg {
    pub generate_embedding: bool,
    pub extract_associations: bool,
    pub analyze_semantics: bool,
    pub min_association_confidence: f32,
    pub max_associations_per_concept: u32,
    pub strength: f32,
    pub confidence: f32,
}

impl Default for LearnOptionsMsg {
    fn default() -> Self {
        Self {
            generate_embedding: true,
            extract_associations: true,
            analyze_semantics: true,
            min_association_confidence: 0.5,
            max_associations_per_concept: 10,
            strength: 1.0,
            confidence: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageRequest {
    LearnConceptV2 {
        content: String,
        options: LearnOptionsMsg,
    },
    LearnBatch {
        contents: Vec<String>,
        options: LearnOptionsMsg,
    },
    QueryConcept {
        concept_id: String,
    },
    GetNeighbors {
        concept_id: String,
    },
    GetAssociation {
        source: String,
        target: String,
    },
    FindPath {
        start_id: String,
        end_id: String,
        max_depth: u32,
    },
    VectorSearch {
        query_vector: Vec<f32>,
        k: u32,
    },
    Reason {
        query: String,
        num_paths: u32,
        strategy: String,
    },
    GetStats,
    HealthCheck,
    Flush,
}

/// One hop of a reasoning path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathStepMsg {
    pub source: String,
    pub target: String,
    pub assoc_type: u8,
    pub edge_confidence: f32,
    pub hop_confidence: f32,
}

/// A full reasoning path with per-hop confidences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMsg {
    pub concepts: Vec<String>,
    pub steps: Vec<PathStepMsg>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptInfo {
    pub concept_id: String,
    pub content: String,
    pub strength: f32,
    pub confidence: f32,
    pub access_count: u32,
    pub semantic_type: Option<String>,
    pub has_vector: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationInfo {
    pub source: String,
    pub target: String,
    pub assoc_type: u8,
    pub confidence: f32,
    pub weight: f32,
    pub reinforcement_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageResponse {
    LearnConceptV2Ok {
        concept_id: String,
    },
    LearnBatchOk {
        concept_ids: Vec<String>,
    },
    QueryConceptOk {
        found: bool,
        concept: Option<ConceptInfo>,
    },
    GetNeighborsOk {
        neighbor_ids: Vec<String>,
    },
    GetAssociationOk {
        found: bool,
        association: Option<AssociationInfo>,
    },
    FindPathOk {
        found: bool,
        path: Vec<String>,
        confidence: f32,
    },
    VectorSearchOk {
        results: Vec<(String, f32)>,
    },
    ReasonOk {
        answer: Option<String>,
        answer_id: Option<String>,
        confidence: f32,
        paths: Vec<PathMsg>,
        alternatives: Vec<(String, f32)>,
        explanation: String,
        partial: bool,
    },
    StatsOk {
        concepts: u64,
        edges: u64,
        vectors: u64,
        written: u64,
        dropped: u64,
        pending: u64,
        reconciliations: u64,
        sequence: u64,
        uptime_seconds: u64,
    },
    HealthCheckOk {
        healthy: bool,
        status: String,
        uptime_seconds: u64,
    },
    FlushOk,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learn_options_defaults() {
        let opts = LearnOptionsMsg::default();
        assert!(opts.generate_embedding);
        assert!(opts.extract_associations);
        assert!(opts.analyze_semantics);
        assert_eq!(opts.min_association_confidence, 0.5);
        assert_eq!(opts.max_associations_per_concept, 10);
    }

    #[test]
    fn test_request_msgpack_round_trip() {
        let req = StorageRequest::Reason {
            query: "capital of France".to_string(),
            num_paths: 4,
            strategy: "best_first".to_string(),
        };

        let bytes = rmp_serde::to_vec_named(&req).unwrap();
        let back: StorageRequest = rmp_serde::from_slice(&bytes).unwrap();

        match back {
            StorageRequest::Reason {
                query, num_paths, ..
            } => {
                assert_eq!(query, "capital of France");
                assert_eq!(num_paths, 4);
            }
            other => panic!("Unexpected variant: {:?}", other),
        }
    }
}
