//! Cancel a session on a running server: `relay cancel`.

use anyhow::{Context, Result};

use relay::config::RelayConfig;

pub async fn cmd_cancel(config: &RelayConfig, session_id: &str, server: Option<&str>) -> Result<()> {
    let base = match server {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => format!("http://{}:{}", config.server.host, config.port()),
    };
    let url = format!("{}/api/sessions/{}/cancel", base, session_id);

    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach relay server at {}", base))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();

    if status.is_success() {
        println!(
            "{} session {}",
            console::style("Cancelling").yellow(),
            session_id
        );
        return Ok(());
    }
    let message = body["error"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());
    anyhow::bail!("Cancel failed: {}", message)
}
