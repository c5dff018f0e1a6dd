//! Session inspection commands: `relay sessions list|show`.

use std::str::FromStr;

use anyhow::{Context, Result};
use console::{StyledObject, style};

use relay::config::RelayConfig;
use relay::workflow::db::SessionDb;
use relay::workflow::models::{Session, SessionFilter, SessionState, StepStatus};

use super::super::SessionsCommands;

pub fn cmd_sessions(config: &RelayConfig, command: SessionsCommands) -> Result<()> {
    let db_path = config.db_path();
    if !db_path.exists() {
        println!("No session database at {}", db_path.display());
        return Ok(());
    }
    let db = SessionDb::new(&db_path).context("Failed to open session database")?;

    match command {
        SessionsCommands::List {
            repo,
            state,
            limit,
            json,
        } => {
            let state = state
                .as_deref()
                .map(SessionState::from_str)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let sessions = db.list_sessions(&SessionFilter { repo, state, limit })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
                return Ok(());
            }
            if sessions.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            for session in &sessions {
                println!(
                    "{}  {:<20} {:<24} {:<10} {}",
                    style(&session.id).dim(),
                    styled_state(session.state),
                    format!("{}#{}", session.repo, session.scope_number()),
                    session.command.map(|c| c.as_str()).unwrap_or("-"),
                    session.updated_at,
                );
            }
        }
        SessionsCommands::Show { session_id, json } => {
            let session = db
                .get_session(&session_id)?
                .with_context(|| format!("Session {} not found", session_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                print_session(&session);
            }
        }
    }
    Ok(())
}

pub fn styled_state(state: SessionState) -> StyledObject<&'static str> {
    let s = style(state.as_str());
    match state {
        SessionState::Completed => s.green(),
        SessionState::Failed | SessionState::TimedOut => s.red(),
        SessionState::Cancelled => s.yellow(),
        _ => s.cyan(),
    }
}

/// Human-readable session detail with its step log.
pub fn print_session(session: &Session) {
    println!();
    println!("{}", style(format!("Session {}", session.id)).bold().cyan());
    println!("─────────────────────────");
    println!("Scope:    {}#{}", session.repo, session.scope_number());
    println!("State:    {}", styled_state(session.state));
    println!(
        "Command:  {}",
        session.command.map(|c| c.as_str()).unwrap_or("-")
    );
    if let Some(instruction) = &session.instruction {
        println!("Request:  {}", instruction);
    }
    println!("Author:   {}", session.author);
    if let Some(branch) = &session.branch {
        println!("Branch:   {}", branch);
    }
    if let Some(cp) = &session.checkpoint {
        println!("Reboots:  {}", cp.reboots);
    }
    if let Some(url) = &session.pr_url {
        println!("PR:       {}", url);
    }
    println!("Created:  {}", session.created_at);
    if let Some(at) = &session.terminal_at {
        println!("Finished: {}", at);
    }

    if !session.step_log.is_empty() {
        println!();
        println!("Steps:");
        for entry in &session.step_log {
            let status = match entry.status {
                StepStatus::Running => style("running").cyan(),
                StepStatus::Done => style("done").green(),
                StepStatus::Failed => style("failed").red(),
                StepStatus::Interrupted => style("interrupted").yellow(),
            };
            let duration = entry
                .duration_ms
                .map(|ms| format!(" ({:.1}s)", ms as f64 / 1000.0))
                .unwrap_or_default();
            let detail = entry
                .detail
                .as_deref()
                .map(|d| format!(": {}", d))
                .unwrap_or_default();
            println!("  {:<30} {}{}{}", entry.step.label(), status, duration, detail);
        }
    }

    if let Some(error) = &session.error {
        println!();
        println!(
            "{} [{}] {}",
            style("Error:").red().bold(),
            error.kind.as_str(),
            error.message
        );
        if error.retryable {
            println!("{}", style("Retryable: trigger the command again.").dim());
        }
    }
    println!();
}
