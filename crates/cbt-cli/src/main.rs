//! cbt CLI: take timed exams, score response sheets, browse past results.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "cbt", version, about = "Timed computer-based exam engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take an exam interactively, or resume the attempt in progress
    Run {
        /// Package ID (looked up in packages_dir) or path to a package file.
        /// Omit to resume the active attempt.
        #[arg(long)]
        package: Option<String>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate exam package TOML files
    Validate {
        /// Path to package file or directory
        #[arg(long)]
        package: PathBuf,
    },

    /// Score a saved response sheet against a package
    Score {
        /// Path to package file
        #[arg(long)]
        package: PathBuf,

        /// Path to responses JSON
        #[arg(long)]
        responses: PathBuf,

        /// Output format: text, json
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// List finalized results for the configured user
    History {
        /// Output format: text, json
        #[arg(long, default_value = "text")]
        format: String,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create starter config and example package
    Init,
}

/// `RUST_LOG` when it is set and parses, otherwise warnings from cbt only.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("cbt=warn"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { package, config } => commands::run::execute(package, config).await,
        Commands::Validate { package } => commands::validate::execute(package),
        Commands::Score {
            package,
            responses,
            format,
        } => commands::score::execute(package, responses, format),
        Commands::History { format, config } => commands::history::execute(format, config).await,
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
