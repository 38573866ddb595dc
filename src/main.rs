use anyhow::Result;
use autoship_common::ExecutionMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use autoship::config::AppConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "autoship")]
#[command(version, about = "Describe a change in plain language, get a tested branch")]
pub struct Cli {
    /// Path to autoship.toml (defaults to ./autoship.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "autoship=trace". Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply a natural-language change to a repository and push a branch
    Run {
        /// Repository as owner/name or URL; prompts when omitted
        #[arg(short, long)]
        repo: Option<String>,

        /// What to change
        #[arg(short, long)]
        instruction: String,

        /// Sandbox policy: auto, remote-only, local-only
        #[arg(long)]
        mode: Option<ExecutionMode>,

        /// Seconds allowed for the test run
        #[arg(long)]
        test_timeout: Option<u64>,

        /// Branch name hint (defaults to the instruction)
        #[arg(long)]
        branch_hint: Option<String>,

        /// Use a local directory as the repository snapshot instead of cloning
        #[arg(long)]
        source: Option<PathBuf>,

        /// Print progress events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List repositories the hosting token can see
    Repos {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    autoship::logging::init(cli.log_level.as_deref(), cli.log_json);

    match cli.command {
        Commands::Run {
            repo,
            instruction,
            mode,
            test_timeout,
            branch_hint,
            source,
            json,
        } => {
            let config = AppConfig::load(cli.config.as_deref())?;
            cmd::cmd_run(
                &config,
                cmd::RunArgs {
                    repo,
                    instruction,
                    mode,
                    test_timeout,
                    branch_hint,
                    source,
                    json,
                },
            )
            .await?;
        }
        Commands::Repos { json } => {
            let config = AppConfig::load(cli.config.as_deref())?;
            cmd::cmd_repos(&config, json).await?;
        }
        Commands::Config { command } => cmd::cmd_config(cli.config.as_deref(), command)?,
    }

    Ok(())
}
