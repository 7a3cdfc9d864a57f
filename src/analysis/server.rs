use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use super::agent::ClaudeAgent;
use super::api::{self, AppState};
use super::executor::UseCaseExecutor;
use super::extractor::UseCaseExtractor;
use super::fetch::GitFetcher;
use super::orchestrator::{Orchestrator, OrchestratorSettings};
use super::sandbox::SandboxRunner;
use super::store::{JobStore, MemoryJobStore, SqliteJobStore};
use crate::config::{AnalyserConfig, StoreBackend};

/// Open the configured job store.
pub fn open_store(config: &AnalyserConfig) -> Result<Arc<dyn JobStore>> {
    Ok(match config.storage.backend {
        StoreBackend::Memory => Arc::new(MemoryJobStore::new()),
        StoreBackend::Sqlite => {
            let path = config.storage.db_path();
            Arc::new(
                SqliteJobStore::open(&path)
                    .with_context(|| format!("Failed to open job database {}", path.display()))?,
            )
        }
    })
}

/// Wire the production collaborators together and start the dispatcher.
pub fn build_orchestrator(config: &AnalyserConfig) -> Result<Arc<Orchestrator>> {
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.storage.data_dir.display()
        )
    })?;
    let store = open_store(config)?;
    let agent = Arc::new(ClaudeAgent::new(&config.agent));
    let sandbox = SandboxRunner::from_config(
        &config.sandbox,
        config.storage.data_dir.join(".sandbox"),
    )
    .context("Failed to initialise sandbox backend")?;
    tracing::info!(backend = sandbox.backend().kind(), "sandbox ready");

    let executor = UseCaseExecutor::new(agent.clone(), sandbox, config.sandbox.timeout());
    let (events, _) = broadcast::channel::<String>(256);
    Ok(Orchestrator::start(
        store,
        Arc::new(GitFetcher::new(config.pipeline.clone_timeout())),
        UseCaseExtractor::new(agent),
        executor,
        OrchestratorSettings::from_config(config),
        events,
    ))
}

pub fn build_router(state: Arc<AppState>, cors_permissive: bool) -> Router {
    let app = api::api_router().with_state(state);
    if cors_permissive {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Run the gateway until Ctrl-C.
pub async fn start_server(config: &AnalyserConfig) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let resumed = orchestrator.resume_incomplete().await?;
    if resumed > 0 {
        tracing::info!(jobs = resumed, "re-queued unfinished jobs");
    }

    let state = Arc::new(AppState::new(orchestrator));
    let app = build_router(state, config.server.cors_permissive);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "doc-analyser listening");
    println!("doc-analyser running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
