//! Durability and recovery scenarios: acknowledged writes survive process
//! death, checkpoints round-trip, embedding outages degrade gracefully.

use noema_storage::{
    ConceptId, ConceptSink, EmbeddingProvider, Engine, EngineConfig, EngineError, LearnOptions,
    LearningPipeline,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DIM: usize = 16;

fn test_config(dir: &Path, fsync: bool) -> EngineConfig {
    EngineConfig {
        storage_dir: dir.to_path_buf(),
        vector_dimension: DIM,
        reconcile_interval_ms_low: 1,
        reconcile_interval_ms_high: 5,
        reconcile_interval_ms_max: 10,
        checkpoint_every_n_writes: 1_000_000,
        wal_fsync: fsync,
        embedding_service_url: String::new(),
    }
}

fn wait_reconcile() {
    std::thread::sleep(Duration::from_millis(150));
}

struct StubEmbedder {
    fail: bool,
}

#[async_trait::async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        if self.fail {
            return Err(EngineError::ServiceUnavailable("stub outage".to_string()));
        }
        let mut v = vec![0.05f32; DIM];
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

#[test]
fn acknowledged_learns_survive_crash() {
    let dir = TempDir::new().unwrap();

    let facts: Vec<String> = (0..300)
        .map(|i| format!("distinct fact number {} about the world", i))
        .collect();

    {
        let engine = Engine::open(test_config(dir.path(), true)).unwrap();
        for fact in &facts {
            let id = ConceptId::from_content(fact.as_bytes());
            engine
                .learn_concept(id, fact.clone().into_bytes(), None, 1.0, 0.9)
                .unwrap();
        }
        // Process dies here: no flush, no shutdown. The fsynced WAL is all
        // that remains.
        drop(engine);
    }

    let engine = Engine::open(test_config(dir.path(), true)).unwrap();
    let stats = engine.stats();
    assert!(
        stats.snapshot.concept_count >= 300,
        "expected >= 300 concepts after recovery, got {}",
        stats.snapshot.concept_count
    );

    for fact in &facts {
        let id = ConceptId::from_content(fact.as_bytes());
        let node = engine
            .query_concept(&id)
            .unwrap_or_else(|| panic!("lost concept for {:?}", fact));
        assert_eq!(node.content.as_ref(), fact.as_bytes());
    }
    engine.shutdown();
}

#[test]
fn content_round_trips_through_learn_and_query() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(dir.path(), false)).unwrap();

    let content = "Ada Lovelace wrote the first published algorithm.";
    let id = ConceptId::from_content(content.as_bytes());
    engine
        .learn_concept(id, content.as_bytes().to_vec(), None, 1.0, 0.9)
        .unwrap();

    wait_reconcile();

    let node = engine.query_concept(&id).unwrap();
    assert_eq!(node.content.as_ref(), content.as_bytes());
    engine.shutdown();
}

#[test]
fn checkpoint_round_trip_preserves_graph() {
    let dir = TempDir::new().unwrap();

    let (concepts_before, edges_before) = {
        let engine = Engine::open(test_config(dir.path(), false)).unwrap();

        for i in 0..20u32 {
            let content = format!("checkpoint fact {}", i);
            let id = ConceptId::from_content(content.as_bytes());
            let vector: Vec<f32> = (0..DIM).map(|j| ((i as usize + j) % 9) as f32).collect();
            engine
                .learn_concept(id, content.into_bytes(), Some(vector), 1.0, 0.9)
                .unwrap();
        }
        let a = ConceptId::from_content(b"checkpoint fact 0");
        let b = ConceptId::from_content(b"checkpoint fact 1");
        engine
            .learn_association(a, b, noema_storage::AssociationType::Semantic, 0.8)
            .unwrap();

        wait_reconcile();
        engine.flush().unwrap();

        let stats = engine.stats();
        engine.shutdown();
        (stats.snapshot.concept_count, stats.snapshot.edge_count)
    };

    let engine = Engine::open(test_config(dir.path(), false)).unwrap();
    let stats = engine.stats();
    assert_eq!(stats.snapshot.concept_count, concepts_before);
    assert_eq!(stats.snapshot.edge_count, edges_before);

    // Vectors came back and the index serves them
    let query: Vec<f32> = (0..DIM).map(|j| (j % 9) as f32).collect();
    let results = engine.vector_search(&query, 5).unwrap();
    assert!(!results.is_empty());
    engine.shutdown();
}

#[tokio::test]
async fn embedding_outage_stores_concept_without_vector() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(Engine::open(test_config(dir.path(), false)).unwrap());

    let content = "the moon orbits the earth";
    let id = ConceptId::from_content(content.as_bytes());

    // Outage: learn succeeds, vector absent
    {
        let pipeline = LearningPipeline::new(Arc::new(StubEmbedder { fail: true }));
        let learned = pipeline
            .learn_concept(
                engine.as_ref() as &dyn ConceptSink,
                content,
                &LearnOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(learned, id);
    }

    tokio::time::sleep(Duration::from_millis(150)).await;

    let node = engine.query_concept(&id).unwrap();
    assert!(node.vector.is_none());

    // Vector search cannot find it
    let probe = vec![0.05f32; DIM];
    let results = engine.vector_search(&probe, 10).unwrap();
    assert!(!results.iter().any(|(found, _)| *found == id));

    // Service recovers; re-learning the same content fills the vector in
    {
        let pipeline = LearningPipeline::new(Arc::new(StubEmbedder { fail: false }));
        pipeline
            .learn_concept(
                engine.as_ref() as &dyn ConceptSink,
                content,
                &LearnOptions::default(),
            )
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(150)).await;

    let node = engine.query_concept(&id).unwrap();
    assert!(node.vector.is_some());

    let results = engine.vector_search(&probe, 10).unwrap();
    assert!(results.iter().any(|(found, _)| *found == id));
    engine.shutdown();
}

#[test]
fn relearn_after_recovery_keeps_single_record() {
    let dir = TempDir::new().unwrap();
    let content = "a fact learned on both sides of a restart";
    let id = ConceptId::from_content(content.as_bytes());

    {
        let engine = Engine::open(test_config(dir.path(), true)).unwrap();
        engine
            .learn_concept(id, content.as_bytes().to_vec(), None, 1.0, 0.9)
            .unwrap();
        drop(engine);
    }

    let engine = Engine::open(test_config(dir.path(), true)).unwrap();
    engine
        .learn_concept(id, content.as_bytes().to_vec(), None, 1.0, 0.9)
        .unwrap();
    wait_reconcile();

    let stats = engine.stats();
    assert_eq!(stats.snapshot.concept_count, 1);
    engine.shutdown();
}
