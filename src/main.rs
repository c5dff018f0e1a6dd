use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use relay::config::{CONFIG_FILE, RelayConfig, config_dir};

mod cmd;

#[derive(Parser)]
#[command(name = "relay")]
#[command(version, about = "Comment-triggered coding agent sessions for GitHub issues and pull requests")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to relay.toml (defaults to $RELAY_HOME/relay.toml or ~/.relay/relay.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the trigger and query server
    Serve {
        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable permissive CORS for local development
        #[arg(long)]
        dev: bool,
    },
    /// Start a session as the operator and wait for it to finish
    Trigger {
        /// Repository as owner/name
        repo: String,

        /// Issue or pull request number
        number: u64,

        /// Workflow command: plan, build, oneshot, codereview
        command: String,

        /// The number refers to a pull request
        #[arg(long)]
        pr: bool,

        /// Extra instructions passed to the agent
        #[arg(short, long)]
        instruction: Option<String>,
    },
    /// Inspect recorded sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },
    /// Ask a running server to cancel a session
    Cancel {
        session_id: String,

        /// Server URL (defaults to the configured host and port)
        #[arg(long)]
        server: Option<String>,
    },
    /// Fail sessions left behind by a stopped server and tear down their sandboxes
    Recover {
        /// Required: confirms no server is currently running against this database
        #[arg(long)]
        force: bool,
    },
    /// View and manage configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SessionsCommands {
    /// List sessions, newest first
    List {
        /// Only sessions for this repository (owner/name)
        #[arg(long)]
        repo: Option<String>,

        /// Only sessions in this state (e.g. agent_running, failed)
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of sessions to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: u32,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one session with its step log
    Show {
        session_id: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (secrets masked)
    Show,
    /// Validate configuration and show any warnings
    Check,
    /// Write a default relay.toml
    Init,
}

/// Path of the config file in use and the loaded configuration.
fn load_config(cli: &Cli) -> Result<(PathBuf, RelayConfig)> {
    match &cli.config {
        Some(path) => {
            let config = if path.exists() {
                RelayConfig::load(path)?
            } else {
                RelayConfig {
                    base_dir: path
                        .parent()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_default(),
                    ..RelayConfig::default()
                }
            };
            Ok((path.clone(), config))
        }
        None => {
            let dir = config_dir()?;
            let config = RelayConfig::load_or_default(&dir)?;
            Ok((dir.join(CONFIG_FILE), config))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let (config_path, mut config) = load_config(&cli).context("Failed to load configuration")?;

    // Config commands must work even when logging config is broken.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_path, &config, command.clone());
    }

    let _log_guard = relay::telemetry::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve { port, dev } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            cmd::cmd_serve(&config, *dev).await?;
        }
        Commands::Trigger {
            repo,
            number,
            command,
            pr,
            instruction,
        } => {
            cmd::cmd_trigger(&config, repo, *number, command, *pr, instruction.clone()).await?;
        }
        Commands::Sessions { command } => cmd::cmd_sessions(&config, command.clone())?,
        Commands::Cancel { session_id, server } => {
            cmd::cmd_cancel(&config, session_id, server.as_deref()).await?
        }
        Commands::Recover { force } => cmd::cmd_recover(&config, *force).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
