//! Common test utilities for API testing

#![allow(dead_code)]

use analytics_api::{router, AppState};
use analytics_common::{AgentType, PipelineConfig, PipelineResult};
use analytics_pipeline::{
    AgentExecutor, AgentInput, AgentOutput, ExecutionContext, ExecutorRegistry, FsDatasetResolver,
    PipelineOrchestrator,
};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;

pub const FILE_ID: &str = "sales.csv";

/// Routes planning to `viz`; the report agent waits for `release`
pub struct GatedExecutor {
    pub release: Arc<Notify>,
}

#[async_trait]
impl AgentExecutor for GatedExecutor {
    async fn execute(
        &self,
        agent: AgentType,
        _input: AgentInput,
        ctx: ExecutionContext,
    ) -> PipelineResult<AgentOutput> {
        let output = AgentOutput::new(json!({ "agent": agent.name() }));
        match agent {
            AgentType::Planning => Ok(output.with_route("viz")),
            AgentType::Report => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(analytics_common::PipelineError::Cancelled),
                    _ = self.release.notified() => Ok(output),
                }
            }
            _ => Ok(output),
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub orchestrator: PipelineOrchestrator,
    pub release: Arc<Notify>,
    _datasets: TempDir,
}

pub fn test_app() -> TestApp {
    let datasets = TempDir::new().unwrap();
    std::fs::write(datasets.path().join(FILE_ID), "region,revenue\neu,10\n").unwrap();

    let release = Arc::new(Notify::new());
    let mut registry = ExecutorRegistry::new();
    registry.register_all(Arc::new(GatedExecutor { release: release.clone() }));

    let config = PipelineConfig {
        retry_backoff_ms: 10,
        max_backoff_ms: 20,
        ..PipelineConfig::default()
    };
    let orchestrator = PipelineOrchestrator::new(
        config,
        registry,
        Arc::new(FsDatasetResolver::new(datasets.path())),
    )
    .unwrap();

    TestApp {
        router: router(AppState::new(orchestrator.clone())),
        orchestrator,
        release,
        _datasets: datasets,
    }
}

/// Send a request through the router and decode the JSON body (if any)
pub async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}
