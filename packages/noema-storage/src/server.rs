//! TCP storage server speaking the length-prefixed binary protocol
//!
//! One task per connection, strict request/response ordering. Oversized or
//! malformed frames get a single `Error` response and the connection closes.
//! Learning requests flow through the unified pipeline; reasoning requests
//! run under a hard deadline on the blocking pool.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::pipeline::{ConceptSink, LearnOptions, LearningPipeline};
use crate::reasoning::{ReasonOptions, SearchStrategy};
use crate::shard::ShardedEngine;
use crate::types::ConceptId;
use noema_protocol::{
    recv_message, send_message, AssociationInfo, ConceptInfo, LearnOptionsMsg, PathMsg,
    PathStepMsg, ProtocolError, StorageRequest, StorageResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tracing::{error, info, warn};

/// Content above this size is refused (bounded UTF-8 per concept)
const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Maximum LearnBatch size
const MAX_BATCH_SIZE: usize = 1_000;

/// Maximum FindPath depth accepted from the wire
const MAX_PATH_DEPTH: u32 = 20;

/// Maximum k for vector search
const MAX_SEARCH_K: u32 = 1_000;

/// Hard deadline for a reasoning request
const REASON_HARD_DEADLINE: Duration = Duration::from_secs(30);

/// How often the decay-and-prune sweep runs
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Single or sharded deployment behind one dispatch surface
#[derive(Clone)]
pub enum Backend {
    Single(Arc<Engine>),
    Sharded(Arc<ShardedEngine>),
}

impl Backend {
    fn sink(&self) -> &dyn ConceptSink {
        match self {
            Backend::Single(engine) => engine.as_ref(),
            Backend::Sharded(sharded) => sharded.as_ref(),
        }
    }

    fn query_concept(&self, id: &ConceptId) -> Option<crate::read_view::ConceptNode> {
        match self {
            Backend::Single(e) => e.query_concept(id),
            Backend::Sharded(s) => s.query_concept(id),
        }
    }

    fn get_neighbors(&self, id: &ConceptId) -> Vec<ConceptId> {
        match self {
            Backend::Single(e) => e.get_neighbors(id),
            Backend::Sharded(s) => s.get_neighbors(id),
        }
    }

    fn get_association(
        &self,
        source: &ConceptId,
        target: &ConceptId,
    ) -> Option<crate::types::AssociationEdge> {
        match self {
            Backend::Single(e) => e.get_association(source, target),
            Backend::Sharded(s) => s.get_association(source, target),
        }
    }

    fn find_path(
        &self,
        start: ConceptId,
        end: ConceptId,
        max_depth: usize,
    ) -> Option<(Vec<ConceptId>, f32)> {
        match self {
            Backend::Single(e) => e.find_path(start, end, max_depth),
            Backend::Sharded(s) => s.find_path(start, end, max_depth),
        }
    }

    fn vector_search(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(ConceptId, f32)>, EngineError> {
        match self {
            Backend::Single(e) => e.vector_search(query, k),
            Backend::Sharded(s) => s.vector_search(query, k),
        }
    }

    fn reason(
        &self,
        query: &str,
        query_vector: Option<&[f32]>,
        opts: &ReasonOptions,
    ) -> crate::reasoning::ReasoningResult {
        match self {
            Backend::Single(e) => e.reason(query, query_vector, opts),
            Backend::Sharded(s) => s.reason(query, query_vector, opts),
        }
    }

    fn flush(&self) -> Result<(), EngineError> {
        match self {
            Backend::Single(e) => e.flush(),
            Backend::Sharded(s) => s.flush(),
        }
    }

    fn is_healthy(&self) -> bool {
        match self {
            Backend::Single(e) => e.is_healthy(),
            Backend::Sharded(s) => s.is_healthy(),
        }
    }

    fn shutdown(&self) {
        match self {
            Backend::Single(e) => e.shutdown(),
            Backend::Sharded(s) => s.shutdown(),
        }
    }

    fn decay_and_prune(&self) -> Result<(usize, usize), EngineError> {
        match self {
            Backend::Single(e) => e.decay_and_prune(),
            Backend::Sharded(s) => s.decay_and_prune(),
        }
    }

    fn stats_tuple(&self) -> (u64, u64, u64, u64, u64, u64, u64, u64) {
        match self {
            Backend::Single(e) => {
                let stats = e.stats();
                (
                    stats.snapshot.concept_count as u64,
                    stats.snapshot.edge_count as u64,
                    stats.indexed_vectors as u64,
                    stats.write_log.written,
                    stats.write_log.dropped,
                    stats.write_log.pending as u64,
                    stats.reconciler.reconciliations,
                    stats.snapshot.sequence,
                )
            }
            Backend::Sharded(s) => {
                let stats = s.stats();
                let (written, dropped, pending, reconciliations, sequence) =
                    stats.shard_stats.iter().fold(
                        (0u64, 0u64, 0u64, 0u64, 0u64),
                        |(w, d, p, r, seq), shard| {
                            (
                                w + shard.write_log.written,
                                d + shard.write_log.dropped,
                                p + shard.write_log.pending as u64,
                                r + shard.reconciler.reconciliations,
                                seq.max(shard.snapshot.sequence),
                            )
                        },
                    );
                (
                    stats.total_concepts as u64,
                    stats.total_edges as u64,
                    stats.total_vectors as u64,
                    written,
                    dropped,
                    pending,
                    reconciliations,
                    sequence,
                )
            }
        }
    }
}

impl From<LearnOptionsMsg> for LearnOptions {
    fn from(m: LearnOptionsMsg) -> Self {
        LearnOptions {
            generate_embedding: m.generate_embedding,
            extract_associations: m.extract_associations,
            analyze_semantics: m.analyze_semantics,
            min_association_confidence: m.min_association_confidence,
            max_associations_per_concept: m.max_associations_per_concept as usize,
            strength: m.strength,
            confidence: m.confidence,
        }
    }
}

fn error_response(e: impl std::fmt::Display) -> StorageResponse {
    StorageResponse::Error {
        message: e.to_string(),
    }
}

fn parse_id(hex: &str) -> Result<ConceptId, EngineError> {
    ConceptId::from_hex(hex)
        .ok_or_else(|| EngineError::InvalidRequest(format!("malformed concept id: {:?}", hex)))
}

/// Storage server state
pub struct StorageServer {
    backend: Backend,
    pipeline: LearningPipeline,
    embedding: Arc<dyn crate::embedding::EmbeddingProvider>,
    start_time: Instant,
}

impl StorageServer {
    pub fn new(
        backend: Backend,
        embedding: Arc<dyn crate::embedding::EmbeddingProvider>,
    ) -> Self {
        Self {
            backend,
            pipeline: LearningPipeline::new(Arc::clone(&embedding)),
            embedding,
            start_time: Instant::now(),
        }
    }

    /// Bind and accept connections until ctrl-c; flush on the way out
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Accept connections on an already-bound listener
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(
            "Storage server listening on {}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );

        let shutdown = signal::ctrl_c();
        tokio::pin!(shutdown);

        // Hourly maintenance sweep: decay idle concepts, prune the faded
        let maintenance_backend = self.backend.clone();
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let backend = maintenance_backend.clone();
                let swept =
                    tokio::task::spawn_blocking(move || backend.decay_and_prune()).await;
                match swept {
                    Ok(Ok((decayed, pruned))) => {
                        if decayed > 0 || pruned > 0 {
                            info!("Maintenance: decayed {}, pruned {}", decayed, pruned);
                        }
                    }
                    Ok(Err(e)) => warn!("Maintenance sweep failed: {}", e),
                    Err(e) => warn!("Maintenance task failed: {}", e),
                }
            }
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_client(stream, peer_addr).await {
                                    warn!("Client error ({}): {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, flushing storage");
                    if let Err(e) = self.backend.flush() {
                        error!("Flush on shutdown failed: {}", e);
                    }
                    self.backend.shutdown();
                    break;
                }
            }
        }

        maintenance.abort();
        Ok(())
    }

    /// Handle one connection: strict request/response until EOF or a
    /// protocol error
    async fn handle_client(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> noema_protocol::Result<()> {
        stream.set_nodelay(true).map_err(ProtocolError::Io)?;
        let mut request_count = 0u64;

        loop {
            let request: StorageRequest = match recv_message(&mut stream).await {
                Ok(request) => request,
                Err(ProtocolError::ConnectionClosed) => {
                    // Client went away
                    break;
                }
                Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Torn frame at disconnect
                    break;
                }
                Err(e @ (ProtocolError::MessageTooLarge(..) | ProtocolError::Serialization(_))) => {
                    // Oversize or undecodable frame: one Error, then close
                    let response = error_response(EngineError::InvalidRequest(e.to_string()));
                    let _ = send_message(&mut stream, &response).await;
                    break;
                }
                Err(e) => return Err(e),
            };

            let request_start = Instant::now();
            let response = self.dispatch(request).await;
            send_message(&mut stream, &response).await?;

            request_count += 1;
            let elapsed = request_start.elapsed();
            if elapsed.as_millis() > 1000 {
                warn!(
                    "Slow request from {}: {}ms (request #{})",
                    peer_addr,
                    elapsed.as_millis(),
                    request_count
                );
            }
        }

        Ok(())
    }

    async fn dispatch(&self, request: StorageRequest) -> StorageResponse {
        match request {
            StorageRequest::LearnConceptV2 { content, options } => {
                if content.len() > MAX_CONTENT_SIZE {
                    return error_response(EngineError::InvalidRequest(format!(
                        "content too large: {} bytes (max {})",
                        content.len(),
                        MAX_CONTENT_SIZE
                    )));
                }
                match self
                    .pipeline
                    .learn_concept(self.backend.sink(), &content, &options.into())
                    .await
                {
                    Ok(id) => StorageResponse::LearnConceptV2Ok {
                        concept_id: id.to_hex(),
                    },
                    Err(e) => error_response(e),
                }
            }

            StorageRequest::LearnBatch { contents, options } => {
                if contents.len() > MAX_BATCH_SIZE {
                    return error_response(EngineError::InvalidRequest(format!(
                        "batch too large: {} items (max {})",
                        contents.len(),
                        MAX_BATCH_SIZE
                    )));
                }
                if let Some(oversize) = contents.iter().position(|c| c.len() > MAX_CONTENT_SIZE) {
                    return error_response(EngineError::InvalidRequest(format!(
                        "batch item {} too large (max {} bytes)",
                        oversize, MAX_CONTENT_SIZE
                    )));
                }
                match self
                    .pipeline
                    .learn_batch(self.backend.sink(), &contents, &options.into())
                    .await
                {
                    Ok(ids) => StorageResponse::LearnBatchOk {
                        concept_ids: ids.iter().map(|id| id.to_hex()).collect(),
                    },
                    Err(e) => error_response(e),
                }
            }

            StorageRequest::QueryConcept { concept_id } => {
                let id = match parse_id(&concept_id) {
                    Ok(id) => id,
                    Err(e) => return error_response(e),
                };
                match self.backend.query_concept(&id) {
                    Some(node) => StorageResponse::QueryConceptOk {
                        found: true,
                        concept: Some(ConceptInfo {
                            concept_id: id.to_hex(),
                            content: String::from_utf8_lossy(&node.content).to_string(),
                            strength: node.strength,
                            confidence: node.confidence,
                            access_count: node.access_count,
                            semantic_type: node.semantic.map(|s| s.as_str().to_string()),
                            has_vector: node.vector.is_some(),
                        }),
                    },
                    None => StorageResponse::QueryConceptOk {
                        found: false,
                        concept: None,
                    },
                }
            }

            StorageRequest::GetNeighbors { concept_id } => {
                let id = match parse_id(&concept_id) {
                    Ok(id) => id,
                    Err(e) => return error_response(e),
                };
                StorageResponse::GetNeighborsOk {
                    neighbor_ids: self
                        .backend
                        .get_neighbors(&id)
                        .iter()
                        .map(|n| n.to_hex())
                        .collect(),
                }
            }

            StorageRequest::GetAssociation { source, target } => {
                let (source, target) = match (parse_id(&source), parse_id(&target)) {
                    (Ok(s), Ok(t)) => (s, t),
                    (Err(e), _) | (_, Err(e)) => return error_response(e),
                };
                match self.backend.get_association(&source, &target) {
                    Some(edge) => StorageResponse::GetAssociationOk {
                        found: true,
                        association: Some(AssociationInfo {
                            source: source.to_hex(),
                            target: target.to_hex(),
                            assoc_type: edge.assoc_type as u8,
                            confidence: edge.confidence,
                            weight: edge.weight,
                            reinforcement_count: edge.reinforcement_count,
                        }),
                    },
                    None => StorageResponse::GetAssociationOk {
                        found: false,
                        association: None,
                    },
                }
            }

            StorageRequest::FindPath {
                start_id,
                end_id,
                max_depth,
            } => {
                if max_depth > MAX_PATH_DEPTH {
                    return error_response(EngineError::InvalidRequest(format!(
                        "path depth too large: {} (max {})",
                        max_depth, MAX_PATH_DEPTH
                    )));
                }
                let (start, end) = match (parse_id(&start_id), parse_id(&end_id)) {
                    (Ok(s), Ok(t)) => (s, t),
                    (Err(e), _) | (_, Err(e)) => return error_response(e),
                };
                match self.backend.find_path(start, end, max_depth as usize) {
                    Some((path, confidence)) => StorageResponse::FindPathOk {
                        found: true,
                        path: path.iter().map(|id| id.to_hex()).collect(),
                        confidence,
                    },
                    None => StorageResponse::FindPathOk {
                        found: false,
                        path: Vec::new(),
                        confidence: 0.0,
                    },
                }
            }

            StorageRequest::VectorSearch { query_vector, k } => {
                if k > MAX_SEARCH_K {
                    return error_response(EngineError::InvalidRequest(format!(
                        "k too large: {} (max {})",
                        k, MAX_SEARCH_K
                    )));
                }
                match self.backend.vector_search(&query_vector, k as usize) {
                    Ok(results) => StorageResponse::VectorSearchOk {
                        results: results
                            .into_iter()
                            .map(|(id, similarity)| (id.to_hex(), similarity))
                            .collect(),
                    },
                    Err(e) => error_response(e),
                }
            }

            StorageRequest::Reason {
                query,
                num_paths,
                strategy,
            } => {
                let Some(strategy) = SearchStrategy::parse(&strategy) else {
                    return error_response(EngineError::InvalidRequest(format!(
                        "unknown strategy: {:?}",
                        strategy
                    )));
                };
                self.handle_reason(query, num_paths as usize, strategy).await
            }

            StorageRequest::GetStats => {
                let (concepts, edges, vectors, written, dropped, pending, reconciliations, sequence) =
                    self.backend.stats_tuple();
                StorageResponse::StatsOk {
                    concepts,
                    edges,
                    vectors,
                    written,
                    dropped,
                    pending,
                    reconciliations,
                    sequence,
                    uptime_seconds: self.start_time.elapsed().as_secs(),
                }
            }

            StorageRequest::HealthCheck => {
                let healthy = self.backend.is_healthy();
                StorageResponse::HealthCheckOk {
                    healthy,
                    status: if healthy {
                        "ok".to_string()
                    } else {
                        "degraded: writes disabled".to_string()
                    },
                    uptime_seconds: self.start_time.elapsed().as_secs(),
                }
            }

            StorageRequest::Flush => match self.backend.flush() {
                Ok(()) => StorageResponse::FlushOk,
                Err(e) => error_response(e),
            },
        }
    }

    async fn handle_reason(
        &self,
        query: String,
        num_paths: usize,
        strategy: SearchStrategy,
    ) -> StorageResponse {
        // Query embedding is best-effort: on outage, seed selection falls
        // back to the word index
        let query_vector = match self.embedding.embed(&query).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("Query embedding unavailable, word-index seeds only: {}", e);
                None
            }
        };

        let opts = ReasonOptions {
            strategy,
            num_paths: num_paths.clamp(1, 16),
            ..Default::default()
        };

        let backend = self.backend.clone();
        let reason_task = tokio::task::spawn_blocking(move || {
            backend.reason(&query, query_vector.as_deref(), &opts)
        });

        let result = match tokio::time::timeout(REASON_HARD_DEADLINE, reason_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return error_response(EngineError::Timeout(e.to_string())),
            Err(_) => {
                return error_response(EngineError::Timeout(format!(
                    "reasoning exceeded {:?}",
                    REASON_HARD_DEADLINE
                )))
            }
        };

        let paths = result
            .paths
            .iter()
            .map(|p| PathMsg {
                concepts: p.concepts.iter().map(|id| id.to_hex()).collect(),
                steps: p
                    .steps
                    .iter()
                    .map(|s| PathStepMsg {
                        source: s.source.to_hex(),
                        target: s.target.to_hex(),
                        assoc_type: s.assoc_type as u8,
                        edge_confidence: s.edge_confidence,
                        hop_confidence: s.hop_confidence,
                    })
                    .collect(),
                confidence: p.confidence,
            })
            .collect();

        let (answer_id, answer) = match result.answer {
            Some((id, text)) => (Some(id.to_hex()), Some(text)),
            None => (None, None),
        };

        StorageResponse::ReasonOk {
            answer,
            answer_id,
            confidence: result.confidence,
            paths,
            alternatives: result.alternatives,
            explanation: result.explanation,
            partial: result.partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::embedding::EmbeddingProvider;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const DIM: usize = 8;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
            let mut v = vec![0.1f32; DIM];
            for (i, b) in text.bytes().enumerate() {
                v[i % DIM] += b as f32 / 255.0;
            }
            Ok(v)
        }

        async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await.ok());
            }
            out
        }
    }

    fn test_server(dir: &TempDir) -> StorageServer {
        let config = EngineConfig {
            storage_dir: dir.path().to_path_buf(),
            vector_dimension: DIM,
            reconcile_interval_ms_low: 1,
            reconcile_interval_ms_high: 5,
            reconcile_interval_ms_max: 10,
            checkpoint_every_n_writes: 1_000_000,
            wal_fsync: false,
            embedding_service_url: String::new(),
        };
        let engine = Arc::new(Engine::open(config).unwrap());
        StorageServer::new(Backend::Single(engine), Arc::new(StubEmbedder))
    }

    fn wait_reconcile() {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_learn_then_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        let content = "Mount Everest is the tallest mountain on Earth.";
        let response = server
            .dispatch(StorageRequest::LearnConceptV2 {
                content: content.to_string(),
                options: LearnOptionsMsg::default(),
            })
            .await;

        let StorageResponse::LearnConceptV2Ok { concept_id } = response else {
            panic!("unexpected response: {:?}", response);
        };
        assert_eq!(concept_id.len(), 16);
        assert_eq!(concept_id, ConceptId::from_content(content.as_bytes()).to_hex());

        wait_reconcile();

        let response = server
            .dispatch(StorageRequest::QueryConcept {
                concept_id: concept_id.clone(),
            })
            .await;
        let StorageResponse::QueryConceptOk { found, concept } = response else {
            panic!("unexpected response");
        };
        assert!(found);
        assert_eq!(concept.unwrap().content, content);
    }

    #[tokio::test]
    async fn test_learn_twice_same_id_single_record() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        let content = "Mount Everest is the tallest mountain on Earth.";
        let mut ids = Vec::new();
        for _ in 0..2 {
            let response = server
                .dispatch(StorageRequest::LearnConceptV2 {
                    content: content.to_string(),
                    options: LearnOptionsMsg::default(),
                })
                .await;
            let StorageResponse::LearnConceptV2Ok { concept_id } = response else {
                panic!("learn failed");
            };
            ids.push(concept_id);
        }
        assert_eq!(ids[0], ids[1]);

        wait_reconcile();

        let response = server
            .dispatch(StorageRequest::QueryConcept {
                concept_id: ids[0].clone(),
            })
            .await;
        let StorageResponse::QueryConceptOk { concept, .. } = response else {
            panic!("query failed");
        };
        let info = concept.unwrap();
        // The second learn strengthened the single record
        assert!(info.access_count >= 1);
    }

    #[tokio::test]
    async fn test_vector_search_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        let response = server
            .dispatch(StorageRequest::VectorSearch {
                query_vector: vec![0.1; DIM / 2],
                k: 5,
            })
            .await;

        let StorageResponse::Error { message } = response else {
            panic!("expected error, got {:?}", response);
        };
        assert!(message.contains("Dimension mismatch"), "{}", message);
    }

    #[tokio::test]
    async fn test_unknown_strategy_rejected() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        let response = server
            .dispatch(StorageRequest::Reason {
                query: "anything".to_string(),
                num_paths: 3,
                strategy: "dijkstra".to_string(),
            })
            .await;

        assert!(matches!(response, StorageResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_malformed_id_rejected() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        let response = server
            .dispatch(StorageRequest::QueryConcept {
                concept_id: "not-a-hex-id".to_string(),
            })
            .await;
        assert!(matches!(response, StorageResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        server
            .dispatch(StorageRequest::LearnConceptV2 {
                content: "a fact for stats".to_string(),
                options: LearnOptionsMsg::default(),
            })
            .await;
        wait_reconcile();

        let response = server.dispatch(StorageRequest::GetStats).await;
        let StorageResponse::StatsOk { concepts, written, .. } = response else {
            panic!("stats failed");
        };
        assert!(concepts >= 1);
        assert!(written >= 1);

        let response = server.dispatch(StorageRequest::HealthCheck).await;
        let StorageResponse::HealthCheckOk { healthy, .. } = response else {
            panic!("health failed");
        };
        assert!(healthy);
    }

    #[tokio::test]
    async fn test_batch_learn() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        let response = server
            .dispatch(StorageRequest::LearnBatch {
                contents: vec!["batch one".to_string(), "batch two".to_string()],
                options: LearnOptionsMsg::default(),
            })
            .await;

        let StorageResponse::LearnBatchOk { concept_ids } = response else {
            panic!("batch failed");
        };
        assert_eq!(concept_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_reason_over_learned_graph() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);

        // Associations extracted from these sentences connect the terms
        for content in [
            "paris is the capital of france",
            "france is a country",
        ] {
            server
                .dispatch(StorageRequest::LearnConceptV2 {
                    content: content.to_string(),
                    options: LearnOptionsMsg::default(),
                })
                .await;
        }
        wait_reconcile();

        let response = server
            .dispatch(StorageRequest::Reason {
                query: "capital of france".to_string(),
                num_paths: 4,
                strategy: "best_first".to_string(),
            })
            .await;

        let StorageResponse::ReasonOk { explanation, .. } = response else {
            panic!("reason failed");
        };
        assert!(!explanation.is_empty());
    }
}
