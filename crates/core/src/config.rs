use crate::chunking::ChunkingConfig;
use crate::embeddings::RetryPolicy;
use crate::error::IngestError;
use crate::models::FileDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Process-wide settings, built once at startup and handed to each component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub documents_dir: PathBuf,
    /// Reserved for a durable index; the index is memory-resident today.
    pub vector_db_path: PathBuf,
    pub recursive_scan: bool,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub ingestion: IngestionConfig,
    pub network: NetworkConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub file_catalog: BTreeMap<String, FileDescriptor>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub max_concurrent_files: usize,
    pub embedding_batch_size: usize,
    pub embedding_concurrency: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub request_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible embeddings endpoint. `None` selects the offline trigram embedder.
    pub endpoint: Option<String>,
    pub model: String,
    pub dimensions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub auth_url: String,
    pub scope: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            documents_dir: data_dir.join("documents"),
            vector_db_path: data_dir.join("vector_db"),
            recursive_scan: false,
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingestion: IngestionConfig::default(),
            network: NetworkConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            file_catalog: default_file_catalog(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.7,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: 4,
            embedding_batch_size: 32,
            embedding_concurrency: 2,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2".to_string(),
            dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gigachat.devices.sberbank.ru/api/v1".to_string(),
            auth_url: "https://ngw.devices.sberbank.ru:9443/api/v2/oauth".to_string(),
            scope: "GIGACHAT_API_PERS".to_string(),
            model: "GigaChat".to_string(),
            temperature: 0.1,
            max_tokens: 1_000,
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            timeout: self.request_timeout(),
        }
    }
}

impl RagConfig {
    /// Reads a JSON config file; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, IngestError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            IngestError::InvalidArgument(format!("cannot read config {}: {error}", path.display()))
        })?;
        let config: RagConfig = serde_json::from_str(&raw).map_err(|error| {
            IngestError::InvalidArgument(format!("cannot parse config {}: {error}", path.display()))
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        self.chunking.validate()?;

        if self.retrieval.top_k == 0 {
            return Err(IngestError::InvalidArgument("top_k must be at least 1".to_string()));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(IngestError::InvalidArgument(format!(
                "similarity_threshold {} is outside [-1, 1]",
                self.retrieval.similarity_threshold
            )));
        }
        if self.ingestion.max_concurrent_files == 0
            || self.ingestion.embedding_batch_size == 0
            || self.ingestion.embedding_concurrency == 0
        {
            return Err(IngestError::InvalidArgument(
                "ingestion concurrency and batch sizes must be non-zero".to_string(),
            ));
        }
        if self.embedding.dimensions == 0 {
            return Err(IngestError::InvalidArgument(
                "embedding dimensions must be non-zero".to_string(),
            ));
        }

        let mut urls = vec![
            ("generation.base_url", self.generation.base_url.as_str()),
            ("generation.auth_url", self.generation.auth_url.as_str()),
        ];
        if let Some(endpoint) = &self.embedding.endpoint {
            urls.push(("embedding.endpoint", endpoint.as_str()));
        }
        for (field, value) in urls {
            Url::parse(value).map_err(|error| {
                IngestError::InvalidArgument(format!(
                    "{field} is not a valid url ({value}): {error}"
                ))
            })?;
        }

        Ok(())
    }

    /// Catalog entry for a file, or a name/description derived from the file name.
    pub fn describe_file(&self, file_name: &str, stem: &str, tabular: bool) -> FileDescriptor {
        if let Some(known) = self.file_catalog.get(file_name) {
            return known.clone();
        }
        let description = if tabular {
            format!("Data from file {file_name}")
        } else {
            format!("Text information from file {file_name}")
        };
        FileDescriptor {
            name: stem.to_string(),
            description,
        }
    }
}

fn default_file_catalog() -> BTreeMap<String, FileDescriptor> {
    const ENTRIES: [(&str, &str, &str); 10] = [
        (
            "capsulahair_portfolio_v2-links.csv",
            "CAPSULAhair портфолио",
            "Ссылки портфолио специалистов сети CAPSULAhair с разбивкой по студиям и категориям",
        ),
        (
            "free.csv",
            "Бесплатные услуги",
            "Информация об учете и контроле предоставления бесплатных услуг клиентам",
        ),
        (
            "certificates_studio_certif.csv",
            "Сертификаты студийные",
            "Сертификаты, проданные в студиях",
        ),
        (
            "certificates-certif_online.csv",
            "Сертификаты онлайн",
            "Сертификаты, проданные онлайн",
        ),
        (
            "certificates-partner_certif.csv",
            "Партнерские сертификаты",
            "Партнерские сертификаты",
        ),
        (
            "new-spd.csv",
            "NEW СПб",
            "Специалисты и услуги в Санкт-Петербурге",
        ),
        (
            "new-moscow.csv",
            "NEW Москва",
            "Специалисты и услуги в Москве",
        ),
        (
            "new-nizhny_novgorod.csv",
            "NEW Нижний Новгород",
            "Специалисты и услуги в Нижнем Новгороде",
        ),
        (
            "docs вопрос-ответ.txt",
            "Вопросы и ответы",
            "Дополнительная информация о работе студий: краски, оплата, процедуры",
        ),
        (
            "frv-list_1.csv",
            "Система мотивации",
            "Рейтинг стилистов и система мотивации менеджеров",
        ),
    ];

    ENTRIES
        .iter()
        .map(|(file, name, description)| {
            (
                file.to_string(),
                FileDescriptor {
                    name: name.to_string(),
                    description: description.to_string(),
                },
            )
        })
        .collect()
}
