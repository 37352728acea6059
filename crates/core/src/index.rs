use crate::error::IndexConsistencyError;
use crate::models::{CorpusStats, IndexEntry, SearchHit};
use parking_lot::RwLock;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Immutable, fully built corpus: entries plus the stats that describe them.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    entries: Vec<IndexEntry>,
    dimensions: Option<usize>,
    stats: CorpusStats,
}

impl IndexSnapshot {
    pub fn build(
        entries: Vec<IndexEntry>,
        mut stats: CorpusStats,
    ) -> Result<Self, IndexConsistencyError> {
        let dimensions = entries.first().map(|entry| entry.vector.len());
        if let Some(expected) = dimensions {
            if let Some(bad) = entries.iter().find(|entry| entry.vector.len() != expected) {
                return Err(IndexConsistencyError {
                    expected,
                    found: bad.vector.len(),
                });
            }
        }
        stats.total_units = entries.len();
        Ok(Self {
            entries,
            dimensions,
            stats,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn stats(&self) -> &CorpusStats {
        &self.stats
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Exhaustive cosine scan keeping the `limit` best entries. Hits come back in
    /// descending score order; equal scores keep insertion order.
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexConsistencyError> {
        let Some(expected) = self.dimensions else {
            return Ok(Vec::new());
        };
        if query.len() != expected {
            return Err(IndexConsistencyError {
                expected,
                found: query.len(),
            });
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut kept: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(limit + 1);
        for (position, entry) in self.entries.iter().enumerate() {
            let candidate = Candidate {
                score: cosine_similarity(query, &entry.vector),
                position,
            };
            if kept.len() < limit {
                kept.push(Reverse(candidate));
            } else if kept.peek().is_some_and(|worst| candidate > worst.0) {
                kept.pop();
                kept.push(Reverse(candidate));
            }
        }

        let mut ranked: Vec<Candidate> =
            kept.into_iter().map(|Reverse(candidate)| candidate).collect();
        ranked.sort_by(|left, right| right.cmp(left));

        Ok(ranked
            .into_iter()
            .enumerate()
            .map(|(rank, candidate)| SearchHit {
                record: self.entries[candidate.position].record.clone(),
                score: candidate.score,
                rank,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f32,
    position: usize,
}

// Higher score is greater; on equal scores the earlier insertion is greater.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.position.cmp(&self.position))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Cosine similarity in [-1, 1]. Zero-magnitude inputs score 0.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let mut dot = 0f64;
    let mut left_norm = 0f64;
    let mut right_norm = 0f64;
    for (a, b) in left.iter().zip(right) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    let magnitude = left_norm.sqrt() * right_norm.sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return 0.0;
    }
    let score = (dot / magnitude).clamp(-1.0, 1.0);
    if score.is_nan() {
        0.0
    } else {
        score as f32
    }
}

/// Shared in-memory index. Every write swaps in a new snapshot; readers clone the
/// current `Arc` and never observe a half-applied write.
#[derive(Debug, Default)]
pub struct VectorIndex {
    current: RwLock<Arc<IndexSnapshot>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&*self.current.read())
    }

    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, IndexConsistencyError> {
        self.snapshot().search(query, limit)
    }

    pub fn stats(&self) -> CorpusStats {
        self.snapshot().stats().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Appends entries. Duplicate content is kept so each source stays visible.
    pub fn insert(&self, entries: Vec<IndexEntry>) -> Result<(), IndexConsistencyError> {
        let mut current = self.current.write();
        let mut combined = Vec::with_capacity(current.len() + entries.len());
        combined.extend(current.entries().iter().cloned());
        combined.extend(entries);
        let next = IndexSnapshot::build(combined, current.stats().clone())?;
        *current = Arc::new(next);
        Ok(())
    }

    pub fn clear(&self) {
        let mut current = self.current.write();
        let stats = CorpusStats {
            total_source_files: 0,
            total_units: 0,
            last_updated: current.stats().last_updated,
        };
        *current = Arc::new(IndexSnapshot {
            stats,
            ..IndexSnapshot::default()
        });
    }

    /// Clear-then-insert as a single swap, publishing `stats` with the entries.
    pub fn replace(&self, snapshot: IndexSnapshot) -> Arc<IndexSnapshot> {
        let next = Arc::new(snapshot);
        *self.current.write() = Arc::clone(&next);
        next
    }
}
