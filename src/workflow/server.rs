use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, SessionDb};
use super::github::GitHubClient;
use super::orchestrator::{OrchestratorConfig, SessionOrchestrator};
use super::sandbox::{LocalSandbox, SandboxConfig};
use crate::config::RelayConfig;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, permissive_cors: bool) -> Router {
    let app = api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if permissive_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Open the store and wire the orchestrator to the real adapters.
pub fn build_state(config: &RelayConfig) -> Result<Arc<AppState>> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(SessionDb::new(&db_path).context("Failed to initialize session database")?);

    let token = config
        .github_token()
        .context("No GitHub token configured (set github.token or GH_TOKEN)")?;
    let host = GitHubClient::new(
        &config.github.api_url,
        &token,
        Duration::from_secs(config.github.request_timeout_secs),
        Duration::from_secs(config.github.connect_timeout_secs),
    )?;
    let sandbox = LocalSandbox::new(SandboxConfig::from_config(config));

    let orchestrator = SessionOrchestrator::new(
        db.clone(),
        Arc::new(sandbox),
        Arc::new(host),
        OrchestratorConfig::from_config(config),
    )?;
    Ok(Arc::new(AppState {
        db,
        orchestrator: Arc::new(orchestrator),
    }))
}

/// Recover orphaned sessions, then serve until Ctrl+C.
pub async fn start_server(config: &RelayConfig, permissive_cors: bool) -> Result<()> {
    let state = build_state(config)?;

    let recovered = state.orchestrator.recover_orphans().await?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "Failed orphaned sessions from a previous run");
    }

    let app = build_router(state, permissive_cors);
    let addr = format!("{}:{}", config.server.host, config.port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr: SocketAddr = listener.local_addr()?;
    tracing::info!(%local_addr, "relay listening");
    println!("relay listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{FakeCodeHost, FakeSandbox};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = DbHandle::new(SessionDb::new_in_memory().unwrap());
        let orchestrator = SessionOrchestrator::new(
            db.clone(),
            Arc::new(FakeSandbox::new()),
            Arc::new(FakeCodeHost::new()),
            OrchestratorConfig::default(),
        )
        .unwrap();
        build_router(
            Arc::new(AppState {
                db,
                orchestrator: Arc::new(orchestrator),
            }),
            true,
        )
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/sessions")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_build_state_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::default();
        config.base_dir = dir.path().to_path_buf();
        config.server.db_path = Some(dir.path().join("relay.db"));
        config.github.token = None;
        // Environment may supply a token; only assert when it does not.
        if config.github_token().is_none() {
            assert!(build_state(&config).is_err());
        }
    }
}
