//! chunkfetch CLI - segmented downloads from the command line
//!
//! Fetches files as concurrent byte ranges with optional throttling.

mod commands;
mod config;
mod notify;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// chunkfetch - segmented, resumable downloads
#[derive(Parser)]
#[command(name = "chunkfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding config.json
    #[arg(long, env = "CHUNKFETCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more files
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Directory to write files into
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Speed limit per download (bytes/sec, accepts K/M/G)
        #[arg(short, long, value_parser = output::parse_size)]
        limit: Option<u64>,

        /// Maximum number of simultaneous downloads
        #[arg(short = 'j', long)]
        max_concurrent: Option<usize>,

        /// Bytes per range request (accepts K/M/G)
        #[arg(short, long, value_parser = output::parse_size)]
        chunk_size: Option<u64>,
    },

    /// Probe URLs for their size
    Probe {
        /// URLs to probe
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("chunkfetch"))
            .unwrap_or_else(|| PathBuf::from(".chunkfetch"))
    });
    let store = config::ConfigStore::new(data_dir);

    match cli.command {
        Commands::Get {
            urls,
            output_dir,
            limit,
            max_concurrent,
            chunk_size,
        } => {
            let overrides = commands::Overrides {
                speed_limit: limit,
                max_concurrent,
                chunk_size,
            };
            commands::get(&store, urls, output_dir, overrides, cli.output).await?
        }

        Commands::Probe { urls } => commands::probe_urls(&store, urls, cli.output).await?,

        Commands::Config { action } => commands::config_action(&store, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "chunkfetch", &mut std::io::stdout());
        }
    }

    Ok(())
}
