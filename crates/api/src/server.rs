use analytics_common::{PipelineResult, ServerConfig, SystemConfig};
use analytics_pipeline::{ExecutorRegistry, FsDatasetResolver, HttpAgentExecutor, PipelineOrchestrator};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::middleware::{get_tracing_layer, logging_middleware};
use crate::routes::{runs, stream};
use crate::types::HealthResponse;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: PipelineOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: PipelineOrchestrator) -> Self {
        Self { orchestrator }
    }
}

/// HTTP/WebSocket server over a pipeline orchestrator
pub struct ApiServer {
    state: AppState,
    config: ServerConfig,
}

impl ApiServer {
    /// Wire the orchestrator from configuration: one HTTP executor serving
    /// every configured agent endpoint, datasets resolved from disk.
    pub fn new(config: SystemConfig) -> PipelineResult<Self> {
        let executor = Arc::new(HttpAgentExecutor::new(config.agents.clone()));
        let mut executors = ExecutorRegistry::new();
        for agent in executor.agents() {
            executors.register(agent, executor.clone());
        }
        let datasets = Arc::new(FsDatasetResolver::new(config.datasets.root.clone()));
        info!(root = %datasets.root().display(), agents = executor.agents().len(), "Resolving datasets from disk");
        let orchestrator = PipelineOrchestrator::new(config.pipeline.clone(), executors, datasets)?;

        Ok(Self {
            state: AppState::new(orchestrator),
            config: config.server,
        })
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(address = %addr, "Pipeline API listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/runs", post(runs::start_run).get(runs::list_runs))
        .route("/runs/:run_id", get(runs::get_run).delete(runs::purge_run))
        .route("/runs/:run_id/pause", post(runs::pause_run))
        .route("/runs/:run_id/resume", post(runs::resume_run))
        .route("/runs/:run_id/cancel", post(runs::cancel_run))
        .route("/runs/:run_id/retry", post(runs::retry_run))
        .route("/runs/:run_id/results", get(runs::get_results))
        .route("/runs/:run_id/tasks/:agent/logs", get(runs::get_task_logs))
        .route("/runs/:run_id/stream", get(stream::websocket_handler))
        .layer(axum::middleware::from_fn(logging_middleware))
        .layer(get_tracing_layer())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness check
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        runs: state.orchestrator.list_runs().await.len(),
        timestamp: Utc::now(),
    })
}
