use crate::chunking::Chunker;
use crate::config::RagConfig;
use crate::embeddings::{embed_with_retry, EmbeddingProvider, RetryPolicy};
use crate::error::{EmbeddingError, IndexConsistencyError, IngestError, LoadError};
use crate::index::{IndexSnapshot, VectorIndex};
use crate::loader::{chunk_records, load_text, tabular_records, FileKind, SourceFile};
use crate::models::{CorpusStats, FileDescriptor, IndexEntry, Record};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub stats: CorpusStats,
    pub skipped_files: Vec<SkippedFile>,
}

/// Recognized source files under `folder`, sorted by path. Files whose names
/// cannot be represented are reported as skipped.
pub fn discover_source_files(
    folder: &Path,
    recursive: bool,
) -> Result<(Vec<SourceFile>, Vec<SkippedFile>), IngestError> {
    if !folder.is_dir() {
        return Err(IngestError::MissingDirectory(folder.to_path_buf()));
    }

    let mut walker = WalkDir::new(folder).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    let mut skipped = Vec::new();

    for entry in walker.into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        match SourceFile::from_path(entry.path()) {
            Ok(Some(source)) => files.push(source),
            Ok(None) => debug!(path = %entry.path().display(), "ignoring unrecognized file"),
            Err(error) => skipped.push(SkippedFile {
                path: entry.path().to_path_buf(),
                reason: error.to_string(),
            }),
        }
    }

    files.sort_unstable_by(|left, right| left.path.cmp(&right.path));
    Ok((files, skipped))
}

fn load_source(
    source: &SourceFile,
    descriptor: &FileDescriptor,
    chunker: &Chunker,
) -> Result<Vec<Record>, LoadError> {
    match source.kind {
        FileKind::Tabular { delimiter } => tabular_records(source, descriptor, delimiter),
        FileKind::Text => {
            let text = load_text(&source.path)?;
            Ok(chunk_records(source, descriptor, chunker.split(&text)))
        }
    }
}

/// Drives full corpus rebuilds and publishes them to the shared index.
pub struct IngestionCoordinator {
    config: RagConfig,
    chunker: Chunker,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<VectorIndex>,
    initialized: AtomicBool,
    rebuild_lock: Mutex<()>,
}

impl IngestionCoordinator {
    pub fn new(
        config: RagConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<VectorIndex>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        let chunker = Chunker::new(config.chunking.clone())?;
        Ok(Self {
            config,
            chunker,
            embedder,
            index,
            initialized: AtomicBool::new(false),
            rebuild_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// True once a rebuild has been published.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CorpusStats {
        self.index.stats()
    }

    /// Loads, chunks and embeds every source file, then swaps the new corpus in.
    /// On error the previously published corpus stays in place.
    pub async fn rebuild(&self) -> Result<IngestionReport, IngestError> {
        let _writer = self
            .rebuild_lock
            .try_lock()
            .map_err(|_| IngestError::RebuildInProgress)?;
        let started = Instant::now();

        let (files, mut skipped_files) =
            discover_source_files(&self.config.documents_dir, self.config.recursive_scan)?;
        if files.is_empty() {
            warn!(
                folder = %self.config.documents_dir.display(),
                "no recognized source files found"
            );
        }

        let (loaded, load_failures) = self.load_all(files).await;
        skipped_files.extend(load_failures);

        let total_source_files = loaded.len();
        let records: Vec<Record> = loaded.into_iter().flat_map(|(_, records)| records).collect();
        info!(
            files = total_source_files,
            skipped = skipped_files.len(),
            units = records.len(),
            "source files loaded, embedding"
        );

        let entries = self.embed_all(records).await?;
        let stats = CorpusStats {
            total_source_files,
            total_units: entries.len(),
            last_updated: Some(Utc::now()),
        };
        let published = self.index.replace(IndexSnapshot::build(entries, stats)?);
        self.initialized.store(true, Ordering::Release);

        info!(
            files = published.stats().total_source_files,
            units = published.stats().total_units,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "knowledge base rebuilt"
        );

        Ok(IngestionReport {
            stats: published.stats().clone(),
            skipped_files,
        })
    }

    async fn load_all(
        &self,
        files: Vec<SourceFile>,
    ) -> (Vec<(PathBuf, Vec<Record>)>, Vec<SkippedFile>) {
        let jobs = files.into_iter().map(|source| {
            let descriptor =
                self.config
                    .describe_file(&source.file_name, &source.stem, source.kind.is_tabular());
            let chunker = self.chunker.clone();
            async move {
                let path = source.path.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || load_source(&source, &descriptor, &chunker))
                        .await
                        .unwrap_or_else(|error| {
                            Err(LoadError::Task {
                                path: path.clone(),
                                details: error.to_string(),
                            })
                        });
                (path, outcome)
            }
        });

        let outcomes: Vec<_> = stream::iter(jobs)
            .buffer_unordered(self.config.ingestion.max_concurrent_files)
            .collect()
            .await;

        let mut loaded = Vec::new();
        let mut skipped = Vec::new();
        for (path, outcome) in outcomes {
            match outcome {
                Ok(records) => {
                    debug!(path = %path.display(), units = records.len(), "loaded source file");
                    loaded.push((path, records));
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping source file");
                    skipped.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        loaded.sort_unstable_by(|left, right| left.0.cmp(&right.0));
        skipped.sort_unstable_by(|left, right| left.path.cmp(&right.path));
        (loaded, skipped)
    }

    async fn embed_all(&self, records: Vec<Record>) -> Result<Vec<IndexEntry>, IngestError> {
        let policy = self.config.network.retry_policy();
        let embedder = self.embedder.as_ref();
        let batches: Vec<Vec<String>> = records
            .chunks(self.config.ingestion.embedding_batch_size)
            .map(|batch| batch.iter().map(|record| record.content.clone()).collect())
            .collect();

        let embedded: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| embed_batch(embedder, batch, policy))
            .buffered(self.config.ingestion.embedding_concurrency)
            .try_collect()
            .await?;

        let expected = embedder.dimensions();
        let vectors = embedded.into_iter().flatten();
        records
            .into_iter()
            .zip(vectors)
            .map(|(record, vector)| {
                if vector.len() != expected {
                    return Err(IngestError::IndexConsistency(IndexConsistencyError {
                        expected,
                        found: vector.len(),
                    }));
                }
                Ok(IndexEntry { record, vector })
            })
            .collect()
    }
}

async fn embed_batch(
    embedder: &dyn EmbeddingProvider,
    batch: Vec<String>,
    policy: RetryPolicy,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    embed_with_retry(embedder, &batch, &policy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{keys, UnitKind};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};

    /// Offline embedder that counts calls, records batch sizes and can be told to fail.
    #[derive(Default)]
    struct ScriptedEmbedder {
        inner: CharacterNgramEmbedder,
        calls: AtomicUsize,
        largest_batch: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedEmbedder {
        fn dimensions(&self) -> usize {
            self.inner.dimensions
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.largest_batch.fetch_max(texts.len(), Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbeddingError::BackendResponse {
                    backend: "scripted".to_string(),
                    details: "503 Service Unavailable".to_string(),
                });
            }
            self.inner.embed(texts).await
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn test_config(dir: &Path) -> RagConfig {
        let mut config = RagConfig::default();
        config.documents_dir = dir.to_path_buf();
        config.chunking = ChunkingConfig {
            chunk_size: 60,
            chunk_overlap: 10,
            ..ChunkingConfig::default()
        };
        config.ingestion.embedding_batch_size = 3;
        config.network.retry_attempts = 2;
        config.network.retry_backoff_ms = 1;
        config
    }

    fn seeded_dir() -> Result<TempDir, Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(
            dir.path().join("people.csv"),
            "name,city\nA,Moscow\nB,SPB\nC,\nD,Kazan\n",
        )?;
        fs::write(
            dir.path().join("faq.txt"),
            "Payment is accepted by card or cash.\n\nKeratin straightening takes three hours.\n\nColour products are professional only.",
        )?;
        fs::write(dir.path().join("broken.csv"), "a,b\n1,2,3\n")?;
        fs::write(dir.path().join("logo.png"), [0u8, 1, 2])?;
        Ok(dir)
    }

    fn coordinator(
        config: RagConfig,
        embedder: Arc<ScriptedEmbedder>,
    ) -> Result<IngestionCoordinator, IngestError> {
        IngestionCoordinator::new(config, embedder, Arc::new(VectorIndex::new()))
    }

    #[tokio::test]
    async fn rebuild_indexes_rows_and_chunks_and_skips_bad_files(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = seeded_dir()?;
        let embedder = Arc::new(ScriptedEmbedder::default());
        let coordinator = coordinator(test_config(dir.path()), Arc::clone(&embedder))?;
        assert!(!coordinator.is_initialized());

        let report = coordinator.rebuild().await?;

        assert!(coordinator.is_initialized());
        assert_eq!(report.stats.total_source_files, 2);
        assert_eq!(report.skipped_files.len(), 1);
        assert!(report.skipped_files[0].path.ends_with("broken.csv"));

        let snapshot = coordinator.index().snapshot();
        let rows = snapshot
            .entries()
            .iter()
            .filter(|entry| entry.record.unit_kind() == Some(UnitKind::Row))
            .count();
        let chunks = snapshot
            .entries()
            .iter()
            .filter(|entry| entry.record.unit_kind() == Some(UnitKind::Chunk))
            .count();
        assert_eq!(rows, 4);
        assert!(chunks >= 2);
        assert_eq!(report.stats.total_units, rows + chunks);
        assert_eq!(coordinator.stats(), report.stats);
        assert!(report.stats.last_updated.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn record_order_within_a_file_is_preserved() -> Result<(), Box<dyn std::error::Error>> {
        let dir = seeded_dir()?;
        let mut config = test_config(dir.path());
        config.ingestion.max_concurrent_files = 3;
        config.ingestion.embedding_concurrency = 4;
        let coordinator = coordinator(config, Arc::new(ScriptedEmbedder::default()))?;
        coordinator.rebuild().await?;

        let snapshot = coordinator.index().snapshot();
        let positions = |file: &str, key: &str| -> Vec<i64> {
            snapshot
                .entries()
                .iter()
                .filter(|entry| entry.record.meta_str(keys::FILE_NAME) == Some(file))
                .filter_map(|entry| entry.record.meta_int(key))
                .collect()
        };

        let rows = positions("people.csv", keys::ROW_INDEX);
        assert_eq!(rows, vec![0, 1, 2, 3]);
        let chunks = positions("faq.txt", keys::CHUNK_INDEX);
        assert_eq!(chunks, (0..chunks.len() as i64).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn embedding_calls_are_batched() -> Result<(), Box<dyn std::error::Error>> {
        let dir = seeded_dir()?;
        let embedder = Arc::new(ScriptedEmbedder::default());
        let coordinator = coordinator(test_config(dir.path()), Arc::clone(&embedder))?;
        let report = coordinator.rebuild().await?;

        let units = report.stats.total_units;
        assert!(embedder.largest_batch.load(Ordering::SeqCst) <= 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), units.div_ceil(3));
        Ok(())
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_the_previous_corpus() -> Result<(), Box<dyn std::error::Error>> {
        let dir = seeded_dir()?;
        let embedder = Arc::new(ScriptedEmbedder::default());
        let coordinator = coordinator(test_config(dir.path()), Arc::clone(&embedder))?;
        let first = coordinator.rebuild().await?;

        fs::write(dir.path().join("extra.csv"), "name\nE\n")?;
        embedder.fail.store(true, Ordering::SeqCst);
        let second = coordinator.rebuild().await;

        assert!(matches!(second, Err(IngestError::Embedding(_))));
        assert_eq!(coordinator.stats(), first.stats);
        assert!(coordinator.is_initialized());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rebuild_runs_on_its_own_task() -> Result<(), Box<dyn std::error::Error>> {
        let dir = seeded_dir()?;
        let coordinator = Arc::new(coordinator(
            test_config(dir.path()),
            Arc::new(ScriptedEmbedder::default()),
        )?);

        let background = Arc::clone(&coordinator);
        let report = tokio::spawn(async move { background.rebuild().await }).await??;

        assert!(coordinator.is_initialized());
        assert_eq!(coordinator.stats(), report.stats);
        Ok(())
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = test_config(&dir.path().join("absent"));
        let coordinator = coordinator(config, Arc::new(ScriptedEmbedder::default()))?;

        let result = coordinator.rebuild().await;
        assert!(matches!(result, Err(IngestError::MissingDirectory(_))));
        assert!(!coordinator.is_initialized());
        Ok(())
    }

    #[tokio::test]
    async fn empty_directory_builds_an_empty_corpus() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator =
            coordinator(test_config(dir.path()), Arc::new(ScriptedEmbedder::default()))?;

        let report = coordinator.rebuild().await?;
        assert_eq!(report.stats.total_units, 0);
        assert_eq!(report.stats.total_source_files, 0);
        assert!(coordinator.is_initialized());
        Ok(())
    }

    #[test]
    fn discovery_is_flat_unless_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("a.csv"), "x\n1\n")?;
        fs::write(nested.join("b.txt"), "text")?;
        fs::write(dir.path().join("c.json"), "{}")?;

        let (flat, _) = discover_source_files(dir.path(), false)?;
        assert_eq!(flat.len(), 1);

        let (deep, _) = discover_source_files(dir.path(), true)?;
        assert_eq!(deep.len(), 2);
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = RagConfig::default();
        config.chunking.chunk_overlap = 5_000;
        let result = IngestionCoordinator::new(
            config,
            Arc::new(ScriptedEmbedder::default()),
            Arc::new(VectorIndex::new()),
        );
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }
}
