//! Noema storage - explainable reasoning over a typed concept graph
//!
//! A storage engine purpose-built for continuously-learning knowledge
//! graphs: durable WAL-first writes, lock-free read snapshots, a persistent
//! HNSW vector index, and a multi-path reasoning core that returns answers
//! together with the paths that produced them.
//!
//! Architecture:
//! - Writes -> WAL, then WriteLog (bounded queue, never blocks readers)
//! - Reads -> ReadView (immutable snapshot, atomic swap)
//! - A background reconciler merges continuously at an adaptive interval
//! - Optional sharding with 2PC for cross-shard association writes

mod config;
mod embedding;
mod engine;
mod error;
mod extractor;
mod pipeline;
mod read_view;
mod reasoning;
mod reconciler;
mod semantic;
mod server;
mod shard;
mod store;
mod types;
mod vector_index;
mod wal;
mod write_log;

pub use config::{EngineConfig, ServerConfig};
pub use embedding::{EmbeddingConfig, EmbeddingProvider, HttpEmbeddingClient};
pub use engine::{Engine, EngineStats, ShardOp, SnapshotInfo};
pub use error::{EngineError, Result};
pub use pipeline::{ConceptSink, LearnOptions, LearningPipeline};
pub use read_view::{ConceptNode, GraphSnapshot, ReadView};
pub use reasoning::{
    AnswerCluster, PathStep, ReasonOptions, ReasonedPath, ReasoningResult, SearchStrategy,
};
pub use reconciler::ReconcilerStats;
pub use semantic::SemanticType;
pub use server::{Backend, StorageServer};
pub use shard::{shard_of, ShardedEngine, ShardedStats};
pub use store::{CHECKPOINT_FILE, MAGIC_BYTES, STORAGE_VERSION};
pub use types::{AssociationEdge, AssociationType, ConceptId};
pub use vector_index::{VectorIndex, VectorIndexConfig};
pub use wal::{LogEntry, Operation, WriteAheadLog};
pub use write_log::{OverflowPolicy, WriteEntry, WriteLog, WriteLogStats};
