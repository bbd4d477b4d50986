//! Common test utilities for orchestrator testing

#![allow(dead_code)]

use analytics_common::{AgentType, PipelineConfig, PipelineError, PipelineResult, RunId, RunStatus, RunView, TaskStatus};
use analytics_pipeline::{
    AgentExecutor, AgentInput, AgentOutput, ExecutionContext, ExecutorRegistry, FsDatasetResolver,
    PipelineOrchestrator,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("analytics_pipeline=debug")
            .with_test_writer()
            .try_init();
    });
}

pub const FILE_ID: &str = "F1";

/// Scripted behaviour of one agent type
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    /// Succeed with an explicit route (only meaningful for planning)
    Route(String),
    /// Time out on the first `n` attempts, then succeed
    FailTimes(u32),
    /// Hang (until the task timeout or cancellation) on the first `n` attempts
    HangTimes(u32),
    /// Non-retryable failure
    Reject,
    /// Wait until released; aborts on cancellation
    Block(Arc<Notify>),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub agent: AgentType,
    pub attempt: u32,
    pub upstream: Vec<AgentType>,
}

#[derive(Default)]
pub struct ScriptedExecutor {
    behaviors: Mutex<HashMap<AgentType, Behavior>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn set(&self, agent: AgentType, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(agent, behavior);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, agent: AgentType) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.agent == agent).collect()
    }

    fn behavior(&self, agent: AgentType) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(&agent)
            .cloned()
            .unwrap_or(Behavior::Succeed)
    }
}

fn output(agent: AgentType) -> AgentOutput {
    AgentOutput::new(json!({ "agent": agent.name(), "summary": format!("{} done", agent) }))
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        agent: AgentType,
        input: AgentInput,
        ctx: ExecutionContext,
    ) -> PipelineResult<AgentOutput> {
        self.calls.lock().unwrap().push(Call {
            agent,
            attempt: input.attempt,
            upstream: input.upstream.keys().copied().collect(),
        });
        ctx.reporter.progress(50.0, "working").await;

        match self.behavior(agent) {
            Behavior::Succeed => Ok(output(agent)),
            Behavior::Route(route) => Ok(output(agent).with_route(route)),
            Behavior::FailTimes(n) if input.attempt <= n => {
                Err(PipelineError::Timeout { agent, after_ms: 5 })
            }
            Behavior::FailTimes(_) => Ok(output(agent)),
            Behavior::HangTimes(n) if input.attempt <= n => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(output(agent)),
                }
            }
            Behavior::HangTimes(_) => Ok(output(agent)),
            Behavior::Reject => Err(PipelineError::agent_rejected(agent, "unsupported column type")),
            Behavior::Block(release) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(PipelineError::Cancelled),
                    _ = release.notified() => Ok(output(agent)),
                }
            }
        }
    }
}

/// Orchestrator wired to a scripted executor and a temp dataset directory
pub struct Harness {
    pub orchestrator: PipelineOrchestrator,
    pub executor: Arc<ScriptedExecutor>,
    _datasets: TempDir,
}

/// Fast retries for tests
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        retry_backoff_ms: 10,
        max_backoff_ms: 40,
        ..PipelineConfig::default()
    }
}

pub fn harness() -> Result<Harness> {
    harness_with(test_config())
}

pub fn harness_with(config: PipelineConfig) -> Result<Harness> {
    init_test_logging();
    let datasets = TempDir::new()?;
    std::fs::write(datasets.path().join(FILE_ID), "month,revenue\njan,10\nfeb,12\n")?;

    let executor = Arc::new(ScriptedExecutor::default());
    let mut registry = ExecutorRegistry::new();
    registry.register_all(executor.clone());

    let orchestrator = PipelineOrchestrator::new(
        config,
        registry,
        Arc::new(FsDatasetResolver::new(datasets.path())),
    )?;
    Ok(Harness {
        orchestrator,
        executor,
        _datasets: datasets,
    })
}

/// Wait for the run to finish, failing the test after five seconds
pub async fn finish(orchestrator: &PipelineOrchestrator, run_id: RunId) -> Result<RunStatus> {
    let status = tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_for_run(run_id))
        .await
        .map_err(|_| anyhow!("run {} did not finish in time", run_id))??;
    Ok(status)
}

/// Poll until `agent` reaches `status`
pub async fn wait_for_task(
    orchestrator: &PipelineOrchestrator,
    run_id: RunId,
    agent: AgentType,
    status: TaskStatus,
) -> Result<RunView> {
    for _ in 0..500 {
        let view = orchestrator.get_run_status(run_id).await?;
        if task_status(&view, agent) == Some(status) {
            return Ok(view);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow!("{} never reached {}", agent, status))
}

pub fn task_status(view: &RunView, agent: AgentType) -> Option<TaskStatus> {
    view.tasks.iter().find(|t| t.agent == agent).map(|t| t.status)
}

pub fn agents(view: &RunView) -> Vec<AgentType> {
    let mut agents: Vec<_> = view.tasks.iter().map(|t| t.agent).collect();
    agents.sort();
    agents
}

/// Poll until `agent` is back in the queue after a failed attempt
pub async fn wait_for_backoff(
    orchestrator: &PipelineOrchestrator,
    run_id: RunId,
    agent: AgentType,
) -> Result<RunView> {
    for _ in 0..500 {
        let view = orchestrator.get_run_status(run_id).await?;
        let requeued = view
            .tasks
            .iter()
            .any(|t| t.agent == agent && t.status == TaskStatus::Queued && t.attempt > 0);
        if requeued {
            return Ok(view);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Err(anyhow!("{} never entered retry backoff", agent))
}
