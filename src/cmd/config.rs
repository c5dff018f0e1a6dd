//! Configuration view and validation commands: `relay config`.

use std::path::Path;

use anyhow::{Context, Result};

use relay::config::RelayConfig;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    config: &RelayConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("Relay Configuration").bold().cyan());
            println!("===================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No relay.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let shown = toml::to_string_pretty(&config.redacted())
                .context("Failed to render configuration")?;
            println!("{}", shown.trim_end());
            println!();

            println!("Effective values (with env overrides):");
            println!("  port = {}", config.port());
            println!("  db_path = \"{}\"", config.db_path().display());
            println!("  sandbox_root = \"{}\"", config.sandbox_root().display());
            println!("  agent_cmd = \"{}\"", config.agent_cmd());
            println!("  allowed_users = {:?}", config.allowed_users());
            println!(
                "  github_token = {}",
                if config.github_token().is_some() { "set" } else { "missing" }
            );
            println!();
        }
        Some(ConfigCommands::Check) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}", console::style("Configuration is valid.").green());
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  {} {}", console::style("⚠").yellow(), warning);
                }
                println!();
                anyhow::bail!("{} configuration problem(s) found", warnings.len());
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("relay.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            RelayConfig::default().save(config_path)?;

            println!("Created relay.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [github] bot_name, token (or set GH_TOKEN)");
            println!("  - [auth] allowed_users");
            println!("  - [sandbox] agent_cmd, execution_budget_secs");
            println!();
        }
    }

    Ok(())
}
