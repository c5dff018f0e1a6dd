//! Trigger and query server: `relay serve`.

use anyhow::Result;

use relay::config::RelayConfig;

pub async fn cmd_serve(config: &RelayConfig, dev: bool) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    relay::workflow::server::start_server(config, dev).await
}
