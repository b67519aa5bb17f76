//! # campus-chat CLI
//!
//! ```bash
//! campus-chat --config ./config/campus-chat.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `campus-chat init` | Create the SQLite database and run schema migrations |
//! | `campus-chat ingest <path>` | Chunk, embed, and store course documents |
//! | `campus-chat search "<query>"` | Run a hybrid search from the terminal |
//! | `campus-chat serve` | Start the HTTP server |
//!
//! Logging goes to stderr and is filtered by `RUST_LOG`
//! (default `campus_chat=info,tower_http=info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use campus_chat::config::{self, Config};
use campus_chat::ingest::Ingestor;
use campus_chat::retrieve::HybridRetriever;
use campus_chat::sqlite_store::SqliteStore;
use campus_chat::{db, embedding, migrate, server};

/// campus-chat: retrieval-augmented tutoring chat over course material.
#[derive(Parser)]
#[command(name = "campus-chat", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/campus-chat.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a file, or every matching file under a directory.
    ///
    /// Each file becomes one document named after its relative path.
    /// Re-ingesting a document replaces its previous chunks.
    Ingest {
        path: PathBuf,

        /// Include glob (repeatable). Defaults to `**/*.md` and `**/*.txt`.
        #[arg(long = "include")]
        include: Vec<String>,
    },

    /// Hybrid search over ingested documents.
    Search {
        query: String,

        /// Minimum cosine similarity for vector hits.
        #[arg(long)]
        threshold: Option<f64>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Start the HTTP server.
    Serve,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "campus_chat=info,tower_http=info".into());
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest { path, include } => {
            let store = open_store(&cfg).await?;
            let embedder = embedding::create_embedder(&cfg.embedding)?;
            if embedder.is_none() {
                tracing::warn!("embedding provider disabled; chunks will only be keyword-searchable");
            }
            let ingestor = Ingestor::new(store, embedder, &cfg);
            let reports = ingestor
                .ingest_path(&path, &include)
                .await
                .with_context(|| format!("ingest failed for {}", path.display()))?;

            let total: usize = reports.iter().map(|r| r.chunks).sum();
            for report in &reports {
                println!("  {} ({} chunks)", report.document_name, report.chunks);
            }
            println!("Ingested {} documents, {} chunks", reports.len(), total);
        }
        Commands::Search {
            query,
            threshold,
            limit,
        } => {
            let store = open_store(&cfg).await?;
            let embedder = embedding::create_embedder(&cfg.embedding)?;
            let retriever = HybridRetriever::from_config(embedder, store, &cfg);

            let mut params = cfg.retrieval.params();
            if let Some(t) = threshold {
                params.match_threshold = t;
            }
            if let Some(l) = limit {
                params.match_count = l.max(1);
            }

            let outcome = retriever.retrieve(&query, &params).await?;
            if outcome.results.is_empty() {
                println!("No results.");
            }
            for (i, r) in outcome.results.iter().enumerate() {
                let snippet: String = r.content.chars().take(160).collect();
                println!(
                    "{}. [{:.3}] {} ({})\n   {}",
                    i + 1,
                    r.score,
                    r.document_name,
                    r.origin.as_str(),
                    snippet.replace('\n', " ")
                );
            }
            println!(
                "{} results ({} vector, {} keyword)",
                outcome.results.len(),
                outcome.counts.vector,
                outcome.counts.keyword
            );
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<SqliteStore>> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}
