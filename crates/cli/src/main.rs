//! chatloop CLI: the main entry point.
//!
//! Commands:
//! - `chat`     Interactive chat or single-message mode
//! - `models`   List the configured model registry
//! - `config`   Show the config path and a default config

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "chatloop",
    about = "chatloop — streaming conversation task loop with tool calling",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the configured model
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Override the epoch budget for this session
        #[arg(long)]
        max_epochs: Option<usize>,
    },

    /// List configured models
    Models,

    /// Show configuration path and defaults
    Config {
        /// Print the effective configuration (keys redacted) instead of defaults
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat {
            message,
            max_epochs,
        } => commands::chat::run(message, max_epochs).await?,
        Commands::Models => commands::models::run()?,
        Commands::Config { show } => {
            if show {
                commands::config_cmd::show()?
            } else {
                commands::config_cmd::path_and_defaults()?
            }
        }
    }

    Ok(())
}
