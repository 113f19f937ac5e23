mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use modelpack_core::Config;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use commands::Overrides;

#[derive(Parser)]
#[command(name = "modelpack")]
#[command(author, version, about = "Install and verify offline model packs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Same as `modelpack download`
    #[arg(long, conflicts_with = "check_models")]
    download_models: bool,

    /// Same as `modelpack check`
    #[arg(long)]
    check_models: bool,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the model pack and install every declared model
    #[command(alias = "download-models")]
    Download,

    /// Report installed, missing and corrupt models without network access
    #[command(alias = "check-models")]
    Check {
        /// Only check these model ids
        models: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove an installed model
    #[command(alias = "rm")]
    Remove {
        /// Model id to remove
        model: String,
    },

    /// Print the digest and size of a file or directory for a manifest entry
    Hash {
        path: PathBuf,
    },

    /// View or set configuration
    Config {
        /// Config key (e.g., "store.path", "pack.url")
        key: Option<String>,

        /// Value to set (if omitted, shows current value)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    let command = match cli.command {
        Some(command) => command,
        None if cli.download_models => Commands::Download,
        None if cli.check_models => Commands::Check {
            models: Vec::new(),
            json: false,
        },
        None => {
            Cli::command().print_help()?;
            return Ok(());
        }
    };

    match command {
        Commands::Download => {
            commands::download::execute(&cli.overrides).await?;
        }
        Commands::Check { models, json } => {
            commands::check::execute(&cli.overrides, &models, json).await?;
        }
        Commands::Remove { model } => {
            commands::remove::execute(&cli.overrides, &model).await?;
        }
        Commands::Hash { path } => {
            commands::hash::execute(&path).await?;
        }
        Commands::Config { key, value } => {
            commands::config::execute(key.as_deref(), value.as_deref()).await?;
        }
    }

    Ok(())
}

/// Log to stderr, and append a plain-text copy to `install.log`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let install_log = open_install_log().map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(install_log)
        .init();
}

fn open_install_log() -> Option<File> {
    let dir = Config::logs_dir().ok()?;
    fs::create_dir_all(&dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("install.log"))
        .ok()
}
