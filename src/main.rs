//! # ETL Harness CLI (`etl`)
//!
//! Ingest semi-structured documents, inspect the inferred schemas and query
//! the loaded records.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `etl init` | Create the SQLite database and run migrations |
//! | `etl ingest <file> --source-id <id>` | Extract, clean and load a document |
//! | `etl schema <id> [--history]` | Show the current schema or every version |
//! | `etl query <id> "<query>" [--nl]` | Run a structured or natural-language query |
//! | `etl records <id>` | Dump every record of a source |
//! | `etl history <id> [--queries]` | Show the upload or query log |
//! | `etl serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! etl init --config ./config/etl.toml
//! etl ingest ./report.md --source-id q3
//! etl query q3 '{"filter": {"price": {"$gt": 100}}}'
//! etl query q3 "which items cost more than 100?" --nl
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use etl_harness::config::{self, Config};
use etl_harness::ingest::Pipeline;
use etl_harness::query::{results_json, QueryService, QueryType};
use etl_harness::sqlite_store::SqliteStore;
use etl_harness::translate::create_translator;
use etl_harness::{db, migrate, server};
use etl_harness_core::store::Store;

/// ETL Harness CLI: schema-evolving ingestion of semi-structured documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/etl.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "etl",
    about = "ETL Harness: extract structured data from documents, evolve schemas, query records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/etl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a `.txt`, `.md` or `.pdf` document into a source.
    Ingest {
        /// Path to the document.
        file: PathBuf,

        /// Source the document belongs to.
        #[arg(long)]
        source_id: String,
    },

    /// Print the current schema of a source.
    Schema {
        source_id: String,

        /// Print every committed version, oldest first.
        #[arg(long)]
        history: bool,
    },

    /// Run a query against a source.
    ///
    /// Without `--nl` the text must be a structured query object, e.g.
    /// `{"operation": "find", "filter": {"price": {"$gt": 100}}}`.
    Query {
        source_id: String,

        query: String,

        /// Treat the text as a natural-language question.
        #[arg(long)]
        nl: bool,
    },

    /// Print every record loaded for a source.
    Records { source_id: String },

    /// Print the upload log of a source, newest first.
    History {
        source_id: String,

        /// Show the query log instead.
        #[arg(long)]
        queries: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,etl_harness=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, source_id } => {
            let pipeline = Pipeline::new(open_store(&cfg).await?, cfg.ingest.clone());
            let summary = pipeline.ingest_file(&file, &source_id).await?;
            print_json(&summary)?;
        }
        Commands::Schema { source_id, history } => {
            let service = query_service(&cfg).await?;
            if history {
                print_json(&service.schema_history(&source_id).await?)?;
            } else {
                print_json(&service.schema(&source_id).await?)?;
            }
        }
        Commands::Query {
            source_id,
            query,
            nl,
        } => {
            let service = query_service(&cfg).await?;
            let query_type = if nl { QueryType::Nl } else { QueryType::Db };
            let outcome = service.execute(&source_id, query_type, &query).await?;
            print_json(&results_json(&outcome))?;
        }
        Commands::Records { source_id } => {
            let service = query_service(&cfg).await?;
            print_json(&service.records(&source_id).await?)?;
        }
        Commands::History { source_id, queries } => {
            let service = query_service(&cfg).await?;
            if queries {
                print_json(&service.query_history(&source_id).await?)?;
            } else {
                print_json(&service.upload_history(&source_id).await?)?;
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> Result<Arc<dyn Store>> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

async fn query_service(cfg: &Config) -> Result<QueryService> {
    let store = open_store(cfg).await?;
    let translator = create_translator(&cfg.translator)?;
    Ok(QueryService::new(store, translator, cfg.query.result_limit))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
