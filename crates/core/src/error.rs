use std::path::PathBuf;
use thiserror::Error;

/// Per-file failure. Recovered locally by the ingestion run: the file is skipped.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid utf-8")]
    Encoding { path: PathBuf },

    #[error("malformed table in {path}: {details}")]
    Table { path: PathBuf, details: String },

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("loader task failed for {path}: {details}")]
    Task { path: PathBuf, details: String },
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("{backend} rejected the request: {details}")]
    Rejected { backend: String, details: String },

    #[error("embedding has dimension {found}, provider declares {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("embedding provider returned {returned} vectors for {requested} inputs")]
    LengthMismatch { requested: usize, returned: usize },

    #[error("embedding failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<EmbeddingError> },
}

impl EmbeddingError {
    /// Whether a retry may succeed. Rejections and shape errors are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Http(_)
                | EmbeddingError::Timeout(_)
                | EmbeddingError::BackendResponse { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generation request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("documents directory not found: {0}")]
    MissingDirectory(PathBuf),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    IndexConsistency(#[from] IndexConsistencyError),

    #[error("a rebuild is already running")]
    RebuildInProgress,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("knowledge base is not initialized yet")]
    NotInitialized,

    #[error("question is empty")]
    EmptyQuestion,

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    IndexConsistency(#[from] IndexConsistencyError),
}

impl QueryError {
    /// Text suitable for showing to the person who asked the question.
    pub fn user_message(&self) -> &'static str {
        match self {
            QueryError::NotInitialized => {
                "The knowledge base is still loading. Please try again in a moment."
            }
            QueryError::EmptyQuestion => "Please type a question.",
            QueryError::Embedding(_) | QueryError::IndexConsistency(_) => {
                "Sorry, something went wrong while processing your request. Try rephrasing the question."
            }
        }
    }
}

/// A vector whose dimension disagrees with the index. Unreachable while every
/// write goes through a whole-snapshot swap built from one provider.
#[derive(Debug, Error)]
#[error("vector dimension {found} does not match index dimension {expected}")]
pub struct IndexConsistencyError {
    pub expected: usize,
    pub found: usize,
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
