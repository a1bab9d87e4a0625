use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use meddoc_rag_core::{
    chunk_line_file, discover_json_files, extract_patient_record, ingest_folder,
    load_chunk_records, AnswerPayload, Analyzer, Assistant, CharacterNgramEmbedder,
    ChunkingOptions, ConversationContext, ConversationOptions, Embedder, HeuristicAnalyzer,
    HttpEmbedder, HttpGenerator, LineChunker, PatientRegistry, ResolvedQuestion, RetryPolicy,
    Retriever, SessionManager, SessionOptions, VectorStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "meddoc-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the persisted vector index and metadata.
    #[arg(long, env = "MEDDOC_STORE_DIR", default_value = "vectorstore")]
    store_dir: PathBuf,

    /// Remote embedding endpoint; the local n-gram embedder is used when absent.
    #[arg(long, env = "MEDDOC_EMBED_URL")]
    embed_url: Option<String>,

    /// Vector width produced by the embedder.
    #[arg(long, env = "MEDDOC_EMBED_DIMENSIONS", default_value_t = meddoc_rag_core::DEFAULT_EMBEDDING_DIMENSIONS)]
    embed_dimensions: usize,

    /// Answer-generation endpoint, required by `ask`.
    #[arg(long, env = "MEDDOC_LLM_URL")]
    llm_url: Option<String>,

    /// Bearer token sent to both remote services.
    #[arg(long, env = "MEDDOC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Attempts per throttled service call before giving up.
    #[arg(long, default_value = "5")]
    max_attempts: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Turn a JSON file of positioned lines into chunk records.
    Chunk {
        /// Line records as produced by the text extractor.
        #[arg(long)]
        input: PathBuf,
        /// Where to write the chunk records.
        #[arg(long)]
        output: PathBuf,
        /// Document name used in chunk locators; defaults to the input file stem.
        #[arg(long)]
        source: Option<String>,
        /// Document category stored with every chunk.
        #[arg(long, default_value = "documents")]
        kind: String,
        #[arg(long, default_value = "1500")]
        max_chars: usize,
        #[arg(long, default_value = "100")]
        overlap: usize,
        #[arg(long, default_value = "1000")]
        min_size: usize,
    },
    /// Embed chunk JSON files and append them to the vector store.
    Ingest {
        /// Folder searched recursively for chunk JSON files.
        #[arg(long)]
        folder: PathBuf,
    },
    /// Hybrid retrieval without conversation state.
    Search {
        #[arg(long)]
        query: String,
        /// Overrides the query-length based result count.
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Ask one question, or start an interactive session when none is given.
    Ask {
        #[arg(long)]
        question: Option<String>,
        /// Id to tag this run's session with. Sessions live in memory only, so
        /// history carries across questions inside the interactive loop but not
        /// across separate invocations.
        #[arg(long)]
        session: Option<String>,
        /// Print the full answer payload as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Extract structured patient records from chunk JSON files.
    Patients {
        #[arg(long)]
        folder: PathBuf,
        /// Registry file the records are merged into.
        #[arg(long, default_value = "structured/patients.json")]
        registry: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        store = %cli.store_dir.display(),
        "meddoc-rag boot"
    );

    let retry = RetryPolicy {
        max_attempts: cli.max_attempts,
        base_delay: Duration::from_secs(1),
    };

    match &cli.command {
        Command::Chunk {
            input,
            output,
            source,
            kind,
            max_chars,
            overlap,
            min_size,
        } => {
            let chunker = LineChunker::new(ChunkingOptions {
                max_chars: *max_chars,
                overlap: *overlap,
                min_size: *min_size,
                ..ChunkingOptions::default()
            })?;
            let source = match source {
                Some(source) => source.clone(),
                None => input
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
                    .context("input path has no file name")?,
            };

            let loaded = chunk_line_file(input, &chunker, &source, kind)?;
            if loaded.malformed > 0 {
                warn!(malformed = loaded.malformed, "skipped malformed line records");
            }
            tokio::fs::write(output, serde_json::to_vec_pretty(&loaded.records)?)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("{} chunks written to {}", loaded.records.len(), output.display());
        }
        Command::Ingest { folder } => {
            let store = VectorStore::open(&cli.store_dir)?;
            let embedder = build_embedder(&cli)?;
            let report = ingest_folder(&store, &embedder, &retry, folder).await?;

            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
            }
            println!(
                "{} records added, {} duplicates, {} malformed, {} files skipped at {}",
                report.added(),
                report.duplicates(),
                report.malformed(),
                report.skipped_files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Search { query, top_k } => {
            let store = Arc::new(VectorStore::open(&cli.store_dir)?);
            let analyzer: Arc<dyn Analyzer> = Arc::new(HeuristicAnalyzer::new()?);
            let retriever = Retriever::new(store.clone(), store, build_embedder(&cli)?, analyzer)
                .with_retry(retry);

            let retrieval = retriever
                .search(&ResolvedQuestion::standalone(query), *top_k)
                .await?;

            println!("query: {}", retrieval.resolved_query);
            for record in &retrieval.records {
                println!(
                    "[{}#{}] page={} source={}",
                    record.file,
                    record.chunk_id,
                    record.page.map_or_else(|| "-".to_string(), |page| page.to_string()),
                    record.source.as_deref().unwrap_or("-"),
                );
                println!("  chunk_text:\n{}", record.text);
            }
        }
        Command::Ask {
            question,
            session,
            json,
        } => {
            let Some(llm_url) = &cli.llm_url else {
                bail!("ask needs an answer-generation endpoint (--llm-url or MEDDOC_LLM_URL)");
            };

            let store = Arc::new(VectorStore::open(&cli.store_dir)?);
            let analyzer: Arc<dyn Analyzer> = Arc::new(HeuristicAnalyzer::new()?);
            let options = ConversationOptions::default();
            let sessions = SessionManager::new(SessionOptions::default(), options.history_capacity);
            let conversation = ConversationContext::new(analyzer.clone(), options)?;
            let retriever = Retriever::new(store.clone(), store, build_embedder(&cli)?, analyzer)
                .with_retry(retry);
            let generator = HttpGenerator::new(llm_url, cli.api_key.clone())?;
            let assistant =
                Assistant::new(sessions, conversation, retriever, generator).with_retry(retry);

            let session_id = match session {
                Some(session_id) => session_id.clone(),
                None => assistant.sessions().create_session(),
            };

            if let Some(question) = question {
                let payload = assistant.ask(&session_id, question).await?;
                print_answer(&payload, *json)?;
                return Ok(());
            }

            println!("session {session_id}; empty line or EOF to quit");
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut stdout = tokio::io::stdout();
            loop {
                stdout.write_all(b"> ").await?;
                stdout.flush().await?;
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let question = line.trim();
                if question.is_empty() {
                    break;
                }
                match assistant.ask(&session_id, question).await {
                    Ok(payload) => print_answer(&payload, *json)?,
                    Err(error) => warn!(%error, "question failed"),
                }
            }
        }
        Command::Patients { folder, registry } => {
            let registry = PatientRegistry::new(registry);
            let records = extract_patients(folder)?;
            let added = registry.upsert(records)?;
            println!("{added} new patients written to {}", registry.path().display());
        }
    }

    Ok(())
}

fn build_embedder(cli: &Cli) -> anyhow::Result<Box<dyn Embedder>> {
    Ok(match &cli.embed_url {
        Some(url) => Box::new(HttpEmbedder::new(url, cli.api_key.clone(), cli.embed_dimensions)?),
        None => Box::new(CharacterNgramEmbedder {
            dimensions: cli.embed_dimensions,
        }),
    })
}

fn extract_patients(folder: &Path) -> anyhow::Result<Vec<meddoc_rag_core::PatientRecord>> {
    let mut patients = Vec::new();

    for path in discover_json_files(folder) {
        let loaded = match load_chunk_records(&path) {
            Ok(loaded) => loaded,
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping file");
                continue;
            }
        };

        let mut record =
            extract_patient_record(loaded.records.iter().map(|chunk| chunk.text.as_str()))?;
        if record.is_empty() {
            continue;
        }
        record.source_file = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string);
        patients.push(record);
    }

    info!(folder = %folder.display(), patients = patients.len(), "patient extraction finished");
    Ok(patients)
}

fn print_answer(payload: &AnswerPayload, as_json: bool) -> anyhow::Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(payload)?);
        return Ok(());
    }

    println!("{}", payload.answer);
    for source in &payload.sources {
        println!(
            "  - {} page={} {}",
            source.source.as_deref().unwrap_or(&source.file),
            source.page.map_or_else(|| "-".to_string(), |page| page.to_string()),
            source.highlight
        );
    }
    for suggestion in &payload.suggestions {
        println!("  ? {suggestion}");
    }
    Ok(())
}
