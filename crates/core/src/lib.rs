pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod retriever;

pub use chunking::{Chunker, ChunkingConfig};
pub use config::{
    EmbeddingConfig, GenerationConfig, IngestionConfig, NetworkConfig, RagConfig, RetrievalConfig,
};
pub use embeddings::{
    embed_with_retry, CharacterNgramEmbedder, EmbeddingProvider, HttpEmbeddingProvider,
    RetryPolicy, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    EmbeddingError, GenerationError, IndexConsistencyError, IngestError, LoadError, QueryError,
};
pub use generation::{
    build_prompt, encode_client_credentials, ChatCompletionBackend, Credential, GenerationBackend,
};
pub use index::{cosine_similarity, IndexSnapshot, VectorIndex};
pub use ingest::{discover_source_files, IngestionCoordinator, IngestionReport, SkippedFile};
pub use loader::{chunk_records, load_table, load_text, tabular_records, FileKind, SourceFile};
pub use models::{
    AnswerOutcome, CorpusStats, FileDescriptor, IndexEntry, Metadata, MetadataValue, QueryAnswer,
    Record, RetrievedContext, SearchHit, UnitKind,
};
pub use orchestrator::{QueryOrchestrator, GENERATION_FAILURE_ANSWER, INSUFFICIENT_CONTEXT_ANSWER};
pub use retriever::Retriever;
