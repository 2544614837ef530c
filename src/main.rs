mod cli;

use std::path::PathBuf;

use alfred_embed::config;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "alfred-embed", version, about = "Local text embeddings stored in SQLite with sqlite-vec")]
struct Cli {
    /// Config file (default: <data dir>/Alfred/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Embed a text and store it
    Embed {
        text: String,
        /// JSON object stored alongside the text
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Find stored texts similar to a query
    Search {
        query: String,
        #[arg(long)]
        limit: Option<usize>,
        /// Minimum cosine similarity in [-1, 1]
        #[arg(long)]
        min_similarity: Option<f64>,
    },
    /// Print one stored memory as JSON
    Get { id: String },
    /// List stored memories, newest first
    List {
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Delete a memory (soft by default)
    Delete {
        id: String,
        /// Remove the row and its vector permanently
        #[arg(long)]
        hard: bool,
    },
    /// Show store statistics
    Stats,
    /// Check model, sqlite-vec and database health
    Doctor,
    /// Show how the model tokenizes a text
    Tokenize {
        text: String,
        /// Do not add BOS/EOS
        #[arg(long)]
        no_special: bool,
        /// Parse special-token text such as `<s>`
        #[arg(long)]
        parse_special: bool,
    },
    /// Embed and store every line of a file (plain text or JSON lines)
    Import {
        file: PathBuf,
        /// Worker threads, each with its own inference context
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Reclaim free space in the database
    Vacuum,
    /// Write a consistent copy of the database
    Backup { dest: PathBuf },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to the configured model path
    Download,
    /// Print a model's GGUF metadata
    Inspect {
        /// Model file (default: configured model path)
        path: Option<PathBuf>,
    },
    /// Write a metadata-only model file for the reference backend
    Stub {
        path: PathBuf,
        #[arg(long, default_value = "qwen3")]
        arch: String,
        #[arg(long, default_value_t = 1024)]
        dim: u32,
        #[arg(long, default_value_t = 2048)]
        context_length: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::AlfredConfig::load_from(path)?,
        None => config::AlfredConfig::load()?,
    };

    // Log to stderr so stdout stays clean for command output.
    let filter = EnvFilter::try_new(&config.logging.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Embed { text, metadata } => cli::embed::embed(config, text, metadata).await?,
        Command::Search {
            query,
            limit,
            min_similarity,
        } => cli::search::search(config, query, limit, min_similarity).await?,
        Command::Get { id } => cli::search::get(&config, &id)?,
        Command::List { limit, offset } => cli::search::list(&config, limit, offset)?,
        Command::Delete { id, hard } => cli::maintenance::delete(&config, &id, hard)?,
        Command::Stats => cli::stats::stats(&config)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Tokenize {
            text,
            no_special,
            parse_special,
        } => cli::embed::tokenize(config, text, !no_special, parse_special).await?,
        Command::Import { file, workers } => cli::import::import(config, file, workers).await?,
        Command::Vacuum => cli::maintenance::vacuum(&config)?,
        Command::Backup { dest } => cli::maintenance::backup(&config, &dest)?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.engine).await?,
            ModelAction::Inspect { path } => {
                let path = path.unwrap_or_else(|| config.resolved_model_path());
                cli::model::inspect(&path)?
            }
            ModelAction::Stub {
                path,
                arch,
                dim,
                context_length,
            } => cli::model::stub(&path, &arch, dim, context_length)?,
        },
    }

    Ok(())
}
