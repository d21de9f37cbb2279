//! PriorArt command line
//!
//! Runs similarity searches from the terminal, builds the flat vector index
//! from the records database, and downloads encoder models.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::{build_index, search, BuildIndexArgs, SearchArgs};

#[derive(Parser, Debug)]
#[command(name = "priorart")]
#[command(version, about = "Prior-art similarity search over patent claims")]
struct Cli {
    /// SQLite URL of the records database
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Flat vector index file
    #[arg(long, global = true)]
    index_path: Option<PathBuf>,

    /// Encoder model directory
    #[arg(long, global = true)]
    model_path: Option<PathBuf>,

    /// Reference similarity scores of past rejections
    #[arg(long, global = true)]
    reference_path: Option<PathBuf>,

    /// Compute device: auto, cpu, cuda or metal
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for records similar to a claim
    Search(SearchArgs),

    /// Encode every record's claims and write the vector index
    BuildIndex(BuildIndexArgs),

    /// Download an encoder model from the Hugging Face Hub
    DownloadModel {
        /// Hub model id
        #[arg(long, default_value = "sentence-transformers/all-MiniLM-L6-v2")]
        model_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so that search output can be piped
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("priorart_core=info".parse()?)
                .add_directive("priorart_cli=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = priorart_core::PipelineConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(path) = cli.index_path {
        config.index_path = path;
    }
    if let Some(path) = cli.model_path {
        config.model_path = path;
    }
    if let Some(path) = cli.reference_path {
        config.reference_path = path;
    }
    if let Some(device) = cli.device {
        config.device = device.parse()?;
    }

    match cli.command {
        Command::Search(args) => search(config, args).await?,
        Command::BuildIndex(args) => build_index(config, args).await?,
        Command::DownloadModel { model_id } => {
            let path = priorart_core::embeddings::BertEncoder::download(&model_id)?;
            println!("{}", path.display());
        }
    }

    Ok(())
}
