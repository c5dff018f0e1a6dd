//! Orphaned session recovery: `relay recover`.

use anyhow::Result;

use relay::config::RelayConfig;
use relay::workflow::server::build_state;

pub async fn cmd_recover(config: &RelayConfig, force: bool) -> Result<()> {
    if !force {
        anyhow::bail!(
            "Recovery fails every unfinished session in {}. Stop the server first, then pass --force.",
            config.db_path().display()
        );
    }
    let state = build_state(config)?;
    let recovered = state.orchestrator.recover_orphans().await?;
    if recovered.is_empty() {
        println!("No orphaned sessions.");
    } else {
        println!(
            "{} {} orphaned session(s):",
            console::style("Failed").yellow(),
            recovered.len()
        );
        for id in recovered {
            println!("  {}", id);
        }
    }
    Ok(())
}
