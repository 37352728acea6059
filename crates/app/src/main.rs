use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use knowledge_search_core::{
    discover_source_files, encode_client_credentials, AnswerOutcome, CharacterNgramEmbedder,
    ChatCompletionBackend, EmbeddingProvider, HttpEmbeddingProvider, IngestError,
    IngestionCoordinator, IngestionReport, QueryAnswer, QueryOrchestrator, RagConfig, VectorIndex,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "knowledge-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file; keys left out keep their defaults.
    #[arg(long, env = "KNOWLEDGE_SEARCH_CONFIG")]
    config: Option<PathBuf>,

    /// Folder with the source files (csv, tsv, txt, md).
    #[arg(long, env = "DOCUMENTS_DIR")]
    documents_dir: Option<PathBuf>,

    /// Scan sub-folders of the documents folder too.
    #[arg(long, default_value_t = false)]
    recursive: bool,

    /// OpenAI-compatible embeddings endpoint. The offline trigram embedder is used without it.
    #[arg(long, env = "EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    /// Bearer key for the embeddings endpoint
    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Base64 authorization key for the chat backend
    #[arg(long, env = "GIGACHAT_TOKEN", hide_env_values = true)]
    gigachat_token: Option<String>,

    /// Client id, used with --client-secret when no authorization key is given
    #[arg(long, env = "GIGACHAT_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, env = "GIGACHAT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data folders and report what is missing.
    Setup,
    /// Build the knowledge base once and print statistics.
    Ingest,
    /// Ask a single question.
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Line-oriented chat on stdin.
    Chat,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<RagConfig> {
        let mut config = match &self.config {
            Some(path) => RagConfig::from_json_file(path)?,
            None => RagConfig::default(),
        };
        if let Some(dir) = &self.documents_dir {
            config.documents_dir = dir.clone();
        }
        if self.recursive {
            config.recursive_scan = true;
        }
        if let Some(endpoint) = &self.embedding_endpoint {
            config.embedding.endpoint = Some(endpoint.clone());
        }
        config.validate()?;
        Ok(config)
    }

    fn authorization_key(&self) -> Option<String> {
        if let Some(token) = &self.gigachat_token {
            return Some(token.clone());
        }
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => Some(encode_client_credentials(id, secret)),
            _ => None,
        }
    }
}

fn build_embedder(cli: &Cli, config: &RagConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let embedder: Arc<dyn EmbeddingProvider> = match &config.embedding.endpoint {
        Some(endpoint) => Arc::new(HttpEmbeddingProvider::new(
            endpoint.as_str(),
            config.embedding.model.as_str(),
            cli.embedding_api_key.clone(),
            config.embedding.dimensions,
            config.network.request_timeout(),
        )?),
        None => Arc::new(CharacterNgramEmbedder {
            dimensions: config.embedding.dimensions,
        }),
    };
    info!(
        embedder = embedder.name(),
        dimensions = embedder.dimensions(),
        "embedding provider ready"
    );
    Ok(embedder)
}

fn build_coordinator(cli: &Cli, config: RagConfig) -> anyhow::Result<Arc<IngestionCoordinator>> {
    let embedder = build_embedder(cli, &config)?;
    let coordinator = IngestionCoordinator::new(config, embedder, Arc::new(VectorIndex::new()))?;
    Ok(Arc::new(coordinator))
}

fn build_orchestrator(
    cli: &Cli,
    config: RagConfig,
) -> anyhow::Result<QueryOrchestrator<ChatCompletionBackend>> {
    let key = cli
        .authorization_key()
        .context("GIGACHAT_TOKEN (or client id and secret) is required to answer questions")?;
    let backend = ChatCompletionBackend::new(
        config.generation.clone(),
        key,
        config.network.request_timeout(),
    )?;
    Ok(QueryOrchestrator::new(build_coordinator(cli, config)?, backend))
}

fn print_report(report: &IngestionReport) {
    println!("{}", report.stats);
    if !report.skipped_files.is_empty() {
        println!("skipped files: {}", report.skipped_files.len());
        for skipped in &report.skipped_files {
            println!("  {}: {}", skipped.path.display(), skipped.reason);
        }
    }
}

fn print_answer(answer: &QueryAnswer) {
    println!("{}", answer.answer);
    if answer.outcome == AnswerOutcome::Answered && !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &answer.sources {
            println!("  - {source}");
        }
        println!("(context fragments used: {})", answer.hit_count);
    }
}

async fn run_setup(cli: &Cli, config: &RagConfig) -> anyhow::Result<()> {
    for dir in [&config.documents_dir, &config.vector_db_path] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create {}", dir.display()))?;
        println!("folder ready: {}", dir.display());
    }

    let (files, skipped) = discover_source_files(&config.documents_dir, config.recursive_scan)?;
    println!("recognized source files: {}", files.len());
    for file in &files {
        println!("  {}", file.file_name);
    }
    for file in &skipped {
        println!("  unreadable: {} ({})", file.path.display(), file.reason);
    }

    let present: BTreeSet<&str> = files.iter().map(|file| file.file_name.as_str()).collect();
    let missing: Vec<&String> = config
        .file_catalog
        .keys()
        .filter(|name| !present.contains(name.as_str()))
        .collect();
    if !missing.is_empty() {
        println!("catalog files not found in {}:", config.documents_dir.display());
        for name in missing {
            println!("  {name}");
        }
    }

    if cli.authorization_key().is_none() {
        println!("GIGACHAT_TOKEN is not set; `ask` and `chat` will not start without it.");
    }
    Ok(())
}

const HELP_TEXT: &str = "Ask any question about services, prices, certificates or studios.\n\
Commands:\n  /start    greeting\n  /help     this message\n  /stats    knowledge base statistics\n  /rebuild  reload the source files\n  /quit     exit";

async fn run_chat(
    orchestrator: Arc<QueryOrchestrator<ChatCompletionBackend>>,
) -> anyhow::Result<()> {
    let warmup = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        match warmup.rebuild().await {
            Ok(report) => info!(units = report.stats.total_units, "knowledge base ready"),
            Err(error) => error!(%error, "initial build failed"),
        }
    });

    println!("Knowledge base assistant. Type /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/start" => {
                println!("Hello! I answer questions from the company knowledge base.\n{HELP_TEXT}")
            }
            "/help" => println!("{HELP_TEXT}"),
            "/stats" => {
                if orchestrator.coordinator().is_initialized() {
                    println!("{}", orchestrator.stats());
                } else {
                    println!("The knowledge base is still loading.");
                }
            }
            "/rebuild" => match orchestrator.rebuild().await {
                Ok(report) => print_report(&report),
                Err(IngestError::RebuildInProgress) => println!("A rebuild is already running."),
                Err(error) => {
                    warn!(%error, "rebuild failed");
                    println!(
                        "Rebuild failed, the previous knowledge base is still in use: {error}"
                    );
                }
            },
            question => match orchestrator.ask(question).await {
                Ok(answer) => print_answer(&answer),
                Err(error) => {
                    warn!(%error, "question failed");
                    println!("{}", error.user_message());
                }
            },
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        documents_dir = %config.documents_dir.display(),
        "knowledge-search boot"
    );

    match cli.command {
        Command::Setup => run_setup(&cli, &config).await?,
        Command::Ingest => {
            let coordinator = build_coordinator(&cli, config)?;
            let report = coordinator.rebuild().await?;
            print_report(&report);
        }
        Command::Ask { ref question } => {
            let orchestrator = build_orchestrator(&cli, config)?;
            orchestrator.rebuild().await?;
            match orchestrator.ask(question).await {
                Ok(answer) => print_answer(&answer),
                Err(error) => anyhow::bail!("{}: {error}", error.user_message()),
            }
        }
        Command::Chat => {
            let orchestrator = Arc::new(build_orchestrator(&cli, config)?);
            run_chat(orchestrator).await?;
        }
    }

    Ok(())
}
