use crate::error::IngestError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum characters per chunk, overlap included.
    pub chunk_size: usize,
    /// Characters repeated at the start of every chunk after the first.
    pub chunk_overlap: usize,
    /// Tried coarsest first. An empty string means "cut between characters".
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
            separators: ["\n\n", "\n", ". ", ".", " ", ""]
                .iter()
                .map(|separator| separator.to_string())
                .collect(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Recursive separator splitter with character-exact overlap.
///
/// Chunks are contiguous windows over the input: chunk `n + 1` starts
/// `chunk_overlap` characters before chunk `n` ends, so dropping that prefix from
/// every chunk but the first and concatenating gives back the input.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let boundaries = char_boundaries(text);
        let total_chars = boundaries.len() - 1;

        if total_chars == 0 {
            return Vec::new();
        }
        if total_chars <= self.config.chunk_size {
            return vec![text.to_string()];
        }

        // Pieces must leave room for the overlap seeded into every later chunk.
        let piece_limit = self.config.chunk_size - self.config.chunk_overlap;
        let mut pieces = Vec::new();
        split_recursive(
            text,
            &boundaries,
            0..total_chars,
            &self.config.separators,
            piece_limit,
            &mut pieces,
        );

        self.pack(text, &boundaries, &pieces)
    }

    fn pack(&self, text: &str, boundaries: &[usize], pieces: &[(usize, usize)]) -> Vec<String> {
        let slice = |start: usize, end: usize| text[boundaries[start]..boundaries[end]].to_string();

        let mut chunks = Vec::new();
        let mut chunk_start = 0usize;
        let mut body_start = 0usize;
        let mut cursor = 0usize;

        for &(_, piece_end) in pieces {
            if piece_end - chunk_start > self.config.chunk_size && cursor > body_start {
                chunks.push(slice(chunk_start, cursor));
                chunk_start = cursor.saturating_sub(self.config.chunk_overlap);
                body_start = cursor;
            }
            cursor = piece_end;
        }

        if cursor > body_start {
            chunks.push(slice(chunk_start, cursor));
        }

        chunks
    }
}

fn char_boundaries(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .collect()
}

/// Emits contiguous char ranges covering `range`, each at most `limit` long.
/// Separators stay attached to the end of the piece they terminate.
fn split_recursive(
    text: &str,
    boundaries: &[usize],
    range: std::ops::Range<usize>,
    separators: &[String],
    limit: usize,
    out: &mut Vec<(usize, usize)>,
) {
    if range.end - range.start <= limit {
        out.push((range.start, range.end));
        return;
    }

    let Some((separator, finer)) = separators.split_first() else {
        let mut start = range.start;
        while start < range.end {
            let end = (start + limit).min(range.end);
            out.push((start, end));
            start = end;
        }
        return;
    };

    if separator.is_empty() {
        out.extend((range.start..range.end).map(|index| (index, index + 1)));
        return;
    }

    let base = boundaries[range.start];
    let segment = &text[base..boundaries[range.end]];
    let mut piece_start = range.start;

    for (offset, matched) in segment.match_indices(separator.as_str()) {
        let cut_byte = base + offset + matched.len();
        let Ok(cut) = boundaries.binary_search(&cut_byte) else {
            continue;
        };
        if cut > piece_start {
            split_recursive(text, boundaries, piece_start..cut, finer, limit, out);
            piece_start = cut;
        }
    }

    if piece_start < range.end {
        split_recursive(text, boundaries, piece_start..range.end, finer, limit, out);
    }
}
