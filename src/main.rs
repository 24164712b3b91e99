//! # Onboarding RAG CLI (`orag`)
//!
//! Command-line interface over the RAG core. Provides database
//! initialization, PDF ingestion, question answering, document management,
//! knowledge-base statistics, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! orag --config ./config/orag.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `orag init` | Create the SQLite database and run schema migrations |
//! | `orag ingest <file.pdf>` | Ingest a PDF into the knowledge base |
//! | `orag ask "<question>"` | Ask a question and print the cited answer |
//! | `orag list` | List documents with chunk and embedding counts |
//! | `orag delete <id>` | Delete a document and its chunks |
//! | `orag reprocess <id>` / `--all` | Rebuild chunks from stored text |
//! | `orag stats` | Show knowledge-base statistics and readiness |
//! | `orag serve` | Start the JSON HTTP server |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use onboarding_rag::{answer, config, db, ingest, migrate, model_client, stats, store};

/// Onboarding RAG — ingest onboarding PDFs and answer questions grounded in
/// them.
#[derive(Parser)]
#[command(
    name = "orag",
    about = "RAG service core for onboarding documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults are used if the file does
    /// not exist.
    #[arg(long, global = true, default_value = "./config/orag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a PDF file into the knowledge base.
    Ingest {
        /// Path to the PDF file.
        file: PathBuf,

        /// Document title. Falls back to PDF metadata, then the filename.
        #[arg(long)]
        title: Option<String>,

        /// Optional tag id to associate with the document.
        #[arg(long)]
        tag: Option<String>,
    },

    /// Ask a question against the ingested corpus.
    Ask {
        /// The question text.
        question: String,

        /// Optional user identifier, recorded in logs only.
        #[arg(long)]
        user: Option<String>,
    },

    /// List documents with chunk and embedding counts.
    List,

    /// Delete a document and all of its chunks.
    Delete {
        /// Document id.
        id: String,
    },

    /// Rebuild a document's chunks from its stored text.
    Reprocess {
        /// Document id. Omit with --all to reprocess everything.
        id: Option<String>,

        /// Reprocess every document; failures are reported, not fatal.
        #[arg(long)]
        all: bool,
    },

    /// Show knowledge-base statistics and readiness.
    Stats,

    /// Start the JSON HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        tracing::info!(path = %cli.config.display(), "config file not found; using defaults");
        config::Config::with_db_path(PathBuf::from("./data/orag.sqlite"))
    };

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }

        Commands::Ingest { file, title, tag } => {
            let bytes = std::fs::read(&file)?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string);

            let (store, client) = open(&cfg).await?;
            let report = ingest::process_document(
                &store,
                &client,
                &cfg,
                &bytes,
                title,
                tag,
                filename.as_deref(),
            )
            .await?;

            println!("ingest {}", file.display());
            println!("  document id: {}", report.document_id);
            println!("  title: {}", report.title);
            println!("  pages: {}  words: {}", report.page_count, report.word_count);
            println!(
                "  chunks: {} ({} embedded)",
                report.chunk_count, report.embedded_chunk_count
            );
            println!("  seconds: {:.2}", report.processing_seconds);
            for warning in &report.warnings {
                println!("  warning: {warning}");
            }
            println!("ok");
        }

        Commands::Ask { question, user } => {
            let (store, client) = open(&cfg).await?;
            let result =
                answer::answer_question(&store, &client, &cfg, &question, user.as_deref()).await?;
            let response = answer::QueryResponse::from_answer(result);

            println!("{}", response.answer);
            println!();
            println!(
                "confidence: {:.2}   sources: {}   time: {:.2}s",
                response.confidence,
                response.metadata.source_count,
                response.response_time_seconds
            );
            for (i, source) in response.sources.iter().enumerate() {
                println!(
                    "  {}. [{:.2}] {} #{} — \"{}\"",
                    i + 1,
                    source.relevance_score,
                    source.document_title,
                    source.chunk_index,
                    source.excerpt.replace('\n', " ")
                );
            }
        }

        Commands::List => {
            let (store, _) = open(&cfg).await?;
            let documents = store.list_documents_with_stats().await?;
            if documents.is_empty() {
                println!("No documents.");
            }
            for doc in documents {
                println!(
                    "{}  {}  chunks: {}/{} embedded  pages: {}  uploaded: {}",
                    doc.id,
                    doc.title,
                    doc.embedded_chunk_count,
                    doc.chunk_count,
                    doc.page_count,
                    doc.uploaded_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        Commands::Delete { id } => {
            let (store, _) = open(&cfg).await?;
            store.delete_document(&id).await?;
            println!("deleted {id}");
        }

        Commands::Reprocess { id, all } => {
            let (store, client) = open(&cfg).await?;
            if all {
                let report = ingest::reprocess_all_documents(&store, &client, &cfg).await?;
                println!(
                    "reprocess all: {} processed, {} errors",
                    report.processed, report.errors
                );
            } else {
                let id = id.ok_or_else(|| {
                    anyhow::anyhow!("provide a document id or --all")
                })?;
                let report = ingest::reprocess_document(&store, &client, &cfg, &id).await?;
                println!(
                    "reprocessed {}: {} chunks ({} embedded)",
                    report.document_id, report.chunk_count, report.embedded_chunk_count
                );
            }
        }

        Commands::Stats => {
            let (store, _) = open(&cfg).await?;
            let stats = stats::knowledge_base_stats(&store).await?;

            println!("Knowledge Base Stats");
            println!("====================");
            println!("  Documents:      {}", stats.total_documents);
            println!("  Chunks:         {}", stats.total_chunks);
            println!("  Words:          {}", stats.total_words);
            println!("  With vectors:   {}", stats.documents_with_embeddings);
            println!("  Avg chunks/doc: {:.1}", stats.average_chunks_per_document);
            println!("  Ready:          {}", stats.is_ready);
            if !stats.document_types.is_empty() {
                println!("  By type:");
                for (doc_type, count) in &stats.document_types {
                    println!("    {:<12} {}", doc_type, count);
                }
            }
            if !stats.recent_uploads.is_empty() {
                println!("  Recent uploads:");
                for upload in &stats.recent_uploads {
                    println!(
                        "    {}  {}  {}",
                        upload.uploaded_at.format("%Y-%m-%d %H:%M"),
                        upload.id,
                        upload.title
                    );
                }
            }
        }

        Commands::Serve => {
            onboarding_rag::server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

/// Open the store and model client for a command.
async fn open(cfg: &config::Config) -> Result<(store::Store, model_client::ModelClient)> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let provider = model_client::create_provider(&cfg.model)?;
    let client = model_client::ModelClient::new(provider, &cfg.model);
    Ok((store::Store::new(pool), client))
}
