#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use codoc_common::logging::init_logging;
use codoc_common::Config;
use tracing::info;

mod chat;
mod render;

/// `Codoc` - study chat in the terminal.
#[derive(Parser, Debug)]
#[command(name = "codoc")]
#[command(version)]
#[command(about = "Work through a problem with the Codoc study partner.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.codoc/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chat about a problem
    Chat {
        /// Problem id
        #[arg(short, long)]
        problem: String,

        /// Single message mode (don't enter interactive mode)
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration (token redacted)
    Show,
    /// Validate the effective configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_with_env(cli.config.as_deref())?;
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    init_logging(log_level, &config.observability.log_format);

    match cli.command {
        Commands::Chat { problem, message } => {
            if let Err(e) = config.validate() {
                bail!("Invalid configuration: {e}");
            }
            info!(problem_id = %problem, base_url = %config.api.base_url, "Starting chat");
            chat::run(&config, &problem, message).await
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                let mut shown = config.clone();
                if shown.api.access_token.is_some() {
                    shown.api.access_token = Some("***".into());
                }
                println!("{}", serde_json::to_string_pretty(&shown)?);
                Ok(())
            }
            ConfigCommands::Validate => match config.validate() {
                Ok(()) => {
                    println!("✅ Configuration is valid");
                    Ok(())
                }
                Err(e) => bail!("Invalid configuration: {e}"),
            },
        },
    }
}
