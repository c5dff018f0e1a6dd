//! Manual trigger command: `relay trigger`.

use std::str::FromStr;

use anyhow::Result;

use relay::config::RelayConfig;
use relay::workflow::models::{SessionState, Trigger, WorkflowCommand};
use relay::workflow::server::build_state;

use super::sessions::print_session;

pub async fn cmd_trigger(
    config: &RelayConfig,
    repo: &str,
    number: u64,
    command: &str,
    pr: bool,
    instruction: Option<String>,
) -> Result<()> {
    let command = WorkflowCommand::from_str(command).map_err(anyhow::Error::msg)?;
    if !repo.contains('/') {
        anyhow::bail!("Repository must be owner/name, got '{}'", repo);
    }
    let instruction = instruction
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty());

    let state = build_state(config)?;
    let task = state
        .orchestrator
        .start(Trigger::manual(repo, number, pr, command, instruction))
        .await?;
    let session_id = task.session_id.clone();
    println!(
        "Started session {} ({} on {}#{})",
        console::style(&session_id).bold(),
        command,
        repo,
        number
    );

    let wait = task.wait();
    tokio::pin!(wait);
    let session = tokio::select! {
        result = &mut wait => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("{}", console::style("Cancelling...").yellow());
            state.orchestrator.cancel(&session_id).await?;
            wait.await?
        }
    };

    print_session(&session);
    if session.state != SessionState::Completed {
        anyhow::bail!("Session {} ended {}", session.id, session.state);
    }
    Ok(())
}
