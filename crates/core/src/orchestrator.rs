use crate::embeddings::{embed_with_retry, RetryPolicy};
use crate::error::{IngestError, QueryError};
use crate::generation::GenerationBackend;
use crate::ingest::{IngestionCoordinator, IngestionReport};
use crate::models::{AnswerOutcome, CorpusStats, QueryAnswer};
use crate::retriever::Retriever;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Returned without calling the backend when retrieval found nothing usable.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "Sorry, I couldn't find relevant information in the knowledge base. Please rephrase the question or contact a manager.";

/// Returned when the generation backend fails or times out.
pub const GENERATION_FAILURE_ANSWER: &str =
    "Sorry, I couldn't prepare an answer right now. Please try again later or contact a manager.";

pub struct QueryOrchestrator<G>
where
    G: GenerationBackend,
{
    coordinator: Arc<IngestionCoordinator>,
    generator: G,
    retriever: Retriever,
    retry: RetryPolicy,
    generation_timeout: Duration,
}

impl<G> QueryOrchestrator<G>
where
    G: GenerationBackend,
{
    pub fn new(coordinator: Arc<IngestionCoordinator>, generator: G) -> Self {
        let config = coordinator.config();
        let retriever = Retriever::from(config.retrieval);
        let retry = config.network.retry_policy();
        let generation_timeout = config.network.request_timeout();
        Self {
            coordinator,
            generator,
            retriever,
            retry,
            generation_timeout,
        }
    }

    pub fn coordinator(&self) -> &Arc<IngestionCoordinator> {
        &self.coordinator
    }

    pub fn stats(&self) -> CorpusStats {
        self.coordinator.stats()
    }

    pub async fn rebuild(&self) -> Result<IngestionReport, IngestError> {
        self.coordinator.rebuild().await
    }

    /// Answers `question` from the corpus that is live when the call starts.
    /// A rebuild that finishes mid-question does not affect this answer.
    pub async fn ask(&self, question: &str) -> Result<QueryAnswer, QueryError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(QueryError::EmptyQuestion);
        }
        if !self.coordinator.is_initialized() {
            return Err(QueryError::NotInitialized);
        }

        let snapshot = self.coordinator.index().snapshot();
        let embedder = self.coordinator.embedder().as_ref();
        let query = [question.to_string()];
        let mut vectors = embed_with_retry(embedder, &query, &self.retry).await?;
        let query_vector = vectors.pop().unwrap_or_default();

        let hits = snapshot.search(&query_vector, self.retriever.top_k())?;
        let retrieved = self.retriever.retrieve(&hits);
        debug!(
            candidates = hits.len(),
            retained = retrieved.hit_count,
            "retrieval finished"
        );

        if retrieved.is_empty() {
            info!("no context above the similarity threshold");
            return Ok(QueryAnswer {
                answer: INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
                hit_count: 0,
                outcome: AnswerOutcome::InsufficientContext,
            });
        }

        let generated = tokio::time::timeout(
            self.generation_timeout,
            self.generator.generate(question, &retrieved.context),
        )
        .await;

        let (answer, outcome) = match generated {
            Ok(Ok(answer)) => (answer, AnswerOutcome::Answered),
            Ok(Err(error)) => {
                warn!(backend = self.generator.name(), %error, "answer generation failed");
                (GENERATION_FAILURE_ANSWER.to_string(), AnswerOutcome::GenerationFailed)
            }
            Err(_) => {
                warn!(
                    backend = self.generator.name(),
                    timeout_ms = self.generation_timeout.as_millis() as u64,
                    "answer generation timed out"
                );
                (GENERATION_FAILURE_ANSWER.to_string(), AnswerOutcome::GenerationFailed)
            }
        };

        Ok(QueryAnswer {
            answer,
            sources: retrieved.sources,
            hit_count: retrieved.hit_count,
            outcome,
        })
    }
}
