use crate::config::RetrievalConfig;
use crate::models::{RetrievedContext, SearchHit};
use std::collections::HashSet;

const CONTEXT_SEPARATOR: &str = "\n\n";

/// Turns ranked index hits into grounding context.
///
/// The top-K cut happens first and the threshold prunes what is left, so fewer
/// than K hits may survive even when more qualifying entries exist deeper in the
/// index.
#[derive(Debug, Clone, Copy)]
pub struct Retriever {
    top_k: usize,
    threshold: f32,
}

impl Retriever {
    pub fn new(top_k: usize, threshold: f32) -> Self {
        Self { top_k, threshold }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Expects `hits` in index rank order.
    pub fn retrieve(&self, hits: &[SearchHit]) -> RetrievedContext {
        let retained: Vec<&SearchHit> = hits
            .iter()
            .take(self.top_k)
            .filter(|hit| hit.score >= self.threshold)
            .collect();

        let context = retained
            .iter()
            .map(|hit| hit.record.content.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR);

        let mut seen = HashSet::new();
        let sources = retained
            .iter()
            .map(|hit| hit.record.source_label())
            .filter(|label| seen.insert(label.clone()))
            .collect();

        RetrievedContext {
            context,
            sources,
            hit_count: retained.len(),
        }
    }
}

impl From<RetrievalConfig> for Retriever {
    fn from(value: RetrievalConfig) -> Self {
        Self::new(value.top_k, value.similarity_threshold)
    }
}
