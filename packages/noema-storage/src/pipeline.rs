//! Unified learning pipeline: embedding + classification + association
//! extraction + storage
//!
//! This is the only write path for new content. Clients submit raw text;
//! the pipeline derives the deterministic concept id, fetches the embedding
//! from the external service, classifies semantics, extracts associations,
//! and commits everything as one transaction. Clients never supply vectors.

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::extractor;
use crate::semantic::{self, SemanticType};
use crate::types::{AssociationType, ConceptId};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LearnOptions {
    pub generate_embedding: bool,
    pub extract_associations: bool,
    pub analyze_semantics: bool,
    pub min_association_confidence: f32,
    pub max_associations_per_concept: usize,
    pub strength: f32,
    pub confidence: f32,
}

impl Default for LearnOptions {
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

/// Storage seam for the pipeline: a single engine or a sharded deployment
pub trait ConceptSink: Send + Sync {
    /// Commit a concept plus its extracted associations atomically.
    /// Auxiliary concepts are subject-term records written in the same
    /// transaction so every association source exists.
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
    ) -> Result<u64>;
}

pub struct LearningPipeline {
    embedding: Arc<dyn EmbeddingProvider>,
}

impl LearningPipeline {
    pub fn new(embedding: Arc<dyn EmbeddingProvider>) -> Self {
        Self { embedding }
    }

    /// Learn a single concept end-to-end; returns its id
    pub async fn learn_concept(
        &self,
        sink: &dyn ConceptSink,
        content: &str,
        options: &LearnOptions,
    ) -> Result<ConceptId> {
        let embedding = if options.generate_embedding {
            match self.embedding.embed(content).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    // Non-fatal: the concept is stored without a vector and
                    // re-learning after recovery fills it in
                    warn!("Embedding failed, storing without vector: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.store(sink, content, embedding, options)
    }

    /// Learn a batch: one upstream embedding call, then the per-item path
    pub async fn learn_batch(
        &self,
        sink: &dyn ConceptSink,
        contents: &[String],
        options: &LearnOptions,
    ) -> Result<Vec<ConceptId>> {
        let embeddings: Vec<Option<Vec<f32>>> = if options.generate_embedding {
            self.embedding.embed_batch(contents).await
        } else {
            vec![None; contents.len()]
        };

        let mut ids = Vec::with_capacity(contents.len());
        for (content, embedding) in contents.iter().zip(embeddings) {
            ids.push(self.store(sink, content, embedding, options)?);
        }
        Ok(ids)
    }

    fn store(
        &self,
        sink: &dyn ConceptSink,
        content: &str,
        embedding: Option<Vec<f32>>,
        options: &LearnOptions,
    ) -> Result<ConceptId> {
        let id = ConceptId::from_content(content.as_bytes());

        let semantic = if options.analyze_semantics {
            Some(semantic::classify(content))
        } else {
            None
        };

        let mut auxiliary = Vec::new();
        let mut associations = Vec::new();

        if options.extract_associations {
            let tuples = extractor::extract(
                content,
                options.min_association_confidence,
                options.max_associations_per_concept,
            );

            for tuple in tuples {
                let subject_id = ConceptId::from_content(tuple.subject.as_bytes());
                let object_id = ConceptId::from_content(tuple.object.as_bytes());

                // The subject record rides in the same transaction so the
                // edge source always exists; the object stays a forward
                // reference until its own content is learned.
                if subject_id != id {
                    auxiliary.push((
                        subject_id,
                        tuple.subject.clone().into_bytes(),
                        tuple.confidence,
                    ));
                }
                associations.push((subject_id, object_id, tuple.assoc_type, tuple.confidence));
            }
            debug!("Extracted {} associations", associations.len());
        }

        sink.commit_learn(
            id,
            content.as_bytes().to_vec(),
            embedding,
            options.strength,
            options.confidence,
            semantic,
            auxiliary,
            associations,
        )?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use parking_lot::Mutex;

    struct StubEmbedder {
        fail: bool,
        dimension: usize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EngineError> {
            if self.fail {
                return Err(EngineError::ServiceUnavailable("stub outage".to_string()));
            }
            let mut v = vec![0.0f32; self.dimension];
            for (i, b) in text.bytes().enumerate() {
                v[i % self.dimension] += b as f32 / 255.0;
            }
            Ok(v)
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> Vec<Option<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await.ok());
            }
            out
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        committed: Mutex<Vec<(ConceptId, Vec<u8>, Option<Vec<f32>>, usize, usize)>>,
    }

    impl ConceptSink for RecordingSink {
        #[allow(clippy::too_many_arguments)]
        fn commit_learn(
            &self,
            id: ConceptId,
            content: Vec<u8>,
            vector: Option<Vec<f32>>,
            _strength: f32,
            _confidence: f32,
            _semantic: Option<SemanticType>,
            auxiliary_concepts: Vec<(ConceptId, Vec<u8>, f32)>,
            associations: Vec<(ConceptId, ConceptId, AssociationType, f32)>,
        ) -> Result<u64> {
            self.committed.lock().push((
                id,
                content,
                vector,
                auxiliary_concepts.len(),
                associations.len(),
            ));
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_learn_generates_deterministic_id() {
        let pipeline = LearningPipeline::new(Arc::new(StubEmbedder {
            fail: false,
            dimension: 8,
        }));
        let sink = RecordingSink::default();

        let content = "Mount Everest is the tallest mountain on Earth.";
        let id1 = pipeline
            .learn_concept(&sink, content, &LearnOptions::default())
            .await
            .unwrap();
        let id2 = pipeline
            .learn_concept(&sink, content, &LearnOptions::default())
            .await
            .unwrap();

        assert_eq!(id1, id2);
        assert_eq!(id1, ConceptId::from_content(content.as_bytes()));
    }

    #[tokio::test]
    async fn test_embedding_outage_is_nonfatal() {
        let pipeline = LearningPipeline::new(Arc::new(StubEmbedder {
            fail: true,
            dimension: 8,
        }));
        let sink = RecordingSink::default();

        let id = pipeline
            .learn_concept(&sink, "resilient fact", &LearnOptions::default())
            .await
            .unwrap();

        let committed = sink.committed.lock();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].0, id);
        // Stored without a vector
        assert!(committed[0].2.is_none());
    }

    #[tokio::test]
    async fn test_associations_extracted_and_capped() {
        let pipeline = LearningPipeline::new(Arc::new(StubEmbedder {
            fail: false,
            dimension: 8,
        }));
        let sink = RecordingSink::default();

        let options = LearnOptions {
            max_associations_per_concept: 2,
            ..Default::default()
        };
        pipeline
            .learn_concept(
                &sink,
                "A causes B. C causes D. E causes F.",
                &options,
            )
            .await
            .unwrap();

        let committed = sink.committed.lock();
        assert_eq!(committed[0].4, 2);
    }

    #[tokio::test]
    async fn test_extraction_disabled() {
        let pipeline = LearningPipeline::new(Arc::new(StubEmbedder {
            fail: false,
            dimension: 8,
        }));
        let sink = RecordingSink::default();

        let options = LearnOptions {
            extract_associations: false,
            ..Default::default()
        };
        pipeline
            .learn_concept(&sink, "Smoking causes cancer", &options)
            .await
            .unwrap();

        let committed = sink.committed.lock();
        assert_eq!(committed[0].3, 0);
        assert_eq!(committed[0].4, 0);
    }

    #[tokio::test]
    async fn test_batch_learns_all() {
        let pipeline = LearningPipeline::new(Arc::new(StubEmbedder {
            fail: false,
            dimension: 8,
        }));
        let sink = RecordingSink::default();

        let contents = vec![
            "first fact".to_string(),
            "second fact".to_string(),
            "third fact".to_string(),
        ];
        let ids = pipeline
            .learn_batch(&sink, &contents, &LearnOptions::default())
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(sink.committed.lock().len(), 3);
    }
}
