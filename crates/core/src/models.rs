use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Row,
    Chunk,
}

impl UnitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::Row => "row",
            UnitKind::Chunk => "chunk",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Int(i64),
    Text(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(text) => Some(text),
            MetadataValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(value) => Some(*value),
            MetadataValue::Text(_) => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Int(value) => write!(f, "{value}"),
            MetadataValue::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        MetadataValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// Metadata keys written by the loaders.
pub mod keys {
    pub const SOURCE: &str = "source";
    pub const FILE_NAME: &str = "file_name";
    pub const FILE_TYPE: &str = "file_type";
    pub const TABLE_NAME: &str = "table_name";
    pub const DOCUMENT_NAME: &str = "document_name";
    pub const DESCRIPTION: &str = "description";
    pub const UNIT_KIND: &str = "unit_kind";
    pub const ROW_INDEX: &str = "row_index";
    pub const TOTAL_ROWS: &str = "total_rows";
    pub const CHUNK_INDEX: &str = "chunk_index";
    pub const TOTAL_CHUNKS: &str = "total_chunks";
}

/// One atomic retrievable unit of knowledge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
}

impl Record {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetadataValue::as_str)
    }

    pub fn meta_int(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(MetadataValue::as_int)
    }

    pub fn unit_kind(&self) -> Option<UnitKind> {
        match self.meta_str(keys::UNIT_KIND)? {
            "row" => Some(UnitKind::Row),
            "chunk" => Some(UnitKind::Chunk),
            _ => None,
        }
    }

    /// `"<file name> (<table or document name>)"`, the label shown next to answers.
    pub fn source_label(&self) -> String {
        let file_name = self.meta_str(keys::FILE_NAME).unwrap_or("unknown");
        let display_name = self
            .meta_str(keys::TABLE_NAME)
            .or_else(|| self.meta_str(keys::DOCUMENT_NAME))
            .unwrap_or("unknown");
        format!("{file_name} ({display_name})")
    }
}

/// A record paired with its embedding. Only the vector index holds these.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub record: Record,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: Record,
    pub score: f32,
    pub rank: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorpusStats {
    pub total_source_files: usize,
    pub total_units: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

impl fmt::Display for CorpusStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let updated = self
            .last_updated
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        write!(
            f,
            "source files: {}\nindexed units: {}\nlast updated: {}",
            self.total_source_files, self.total_units, updated
        )
    }
}

/// Retriever output: context in rank order plus unique source labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievedContext {
    pub context: String,
    pub sources: Vec<String>,
    pub hit_count: usize,
}

impl RetrievedContext {
    /// True when nothing usable survived retrieval.
    pub fn is_empty(&self) -> bool {
        self.hit_count == 0 || self.context.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOutcome {
    Answered,
    InsufficientContext,
    GenerationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub sources: Vec<String>,
    pub hit_count: usize,
    pub outcome: AnswerOutcome,
}

/// Human-readable catalog entry for a source file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub description: String,
}
