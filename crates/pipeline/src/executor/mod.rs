//! Agent execution abstraction
//!
//! The scheduler never knows how an agent does its work. It hands an
//! [`AgentInput`] to the [`AgentExecutor`] registered for the agent type and
//! gets back an [`AgentOutput`] or a classified [`PipelineError`].

pub mod http;

use analytics_common::{AgentType, LogLevel, PipelineError, PipelineResult, RunId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::dataset::DatasetHandle;
use crate::store::RunHandle;

pub use http::HttpAgentExecutor;

/// Everything an agent receives for one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub run_id: RunId,
    pub agent: AgentType,
    pub attempt: u32,
    pub file_id: String,
    pub query: String,
    pub dataset: DatasetHandle,
    /// Outputs of the completed dependencies
    pub upstream: BTreeMap<AgentType, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub payload: Value,
    /// Routing decision, only meaningful for the fork gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

impl AgentOutput {
    pub fn new(payload: Value) -> Self {
        Self { payload, route: None }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Explicit route, or a string `route` field inside the payload
    pub fn route(&self) -> Option<&str> {
        self.route
            .as_deref()
            .or_else(|| self.payload.get("route").and_then(Value::as_str))
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run one attempt of `agent`.
    ///
    /// Implementations should return promptly once `ctx.cancel` fires.
    /// Retryable failures use [`PipelineError::agent_execution`]; failures
    /// that another attempt cannot fix use [`PipelineError::agent_rejected`].
    async fn execute(
        &self,
        agent: AgentType,
        input: AgentInput,
        ctx: ExecutionContext,
    ) -> PipelineResult<AgentOutput>;

    /// Attempt timeout for `agent`, replacing the pipeline-wide task timeout
    fn timeout_for(&self, _agent: AgentType) -> Option<Duration> {
        None
    }
}

/// Per-attempt handle given to executors
#[derive(Clone)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub reporter: ProgressReporter,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Lets a running agent publish progress and log lines for its attempt.
///
/// Reports from a superseded attempt, or after the run has ended, are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    handle: Arc<RunHandle>,
    agent: AgentType,
    attempt: u32,
}

impl ProgressReporter {
    pub(crate) fn new(handle: Arc<RunHandle>, agent: AgentType, attempt: u32) -> Self {
        Self { handle, agent, attempt }
    }

    pub fn agent(&self) -> AgentType {
        self.agent
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report progress in percent; returns false if the report was dropped.
    pub async fn progress(&self, percent: f32, message: impl Into<String>) -> bool {
        let mut state = self.handle.lock().await;
        state.report_progress(self.agent, self.attempt, percent, message)
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let mut state = self.handle.lock().await;
        state.log(self.agent, level, message);
    }
}

/// Executors by agent type
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentType, Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: AgentType, executor: Arc<dyn AgentExecutor>) {
        self.executors.insert(agent, executor);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, agent: AgentType, executor: Arc<dyn AgentExecutor>) -> Self {
        self.register(agent, executor);
        self
    }

    /// Use the same executor for every agent type
    pub fn register_all(&mut self, executor: Arc<dyn AgentExecutor>) {
        for agent in AgentType::all() {
            self.register(agent, Arc::clone(&executor));
        }
    }

    pub fn get(&self, agent: AgentType) -> PipelineResult<Arc<dyn AgentExecutor>> {
        self.executors
            .get(&agent)
            .cloned()
            .ok_or_else(|| PipelineError::config(format!("no executor registered for {}", agent)))
    }

    /// Agents from `required` that have no executor
    pub fn missing(&self, required: &[AgentType]) -> Vec<AgentType> {
        required
            .iter()
            .copied()
            .filter(|agent| !self.executors.contains_key(agent))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl AgentExecutor for Noop {
        async fn execute(
            &self,
            _agent: AgentType,
            _input: AgentInput,
            _ctx: ExecutionContext,
        ) -> PipelineResult<AgentOutput> {
            Ok(AgentOutput::new(json!({})))
        }
    }

    #[test]
    fn test_route_prefers_explicit_field() {
        let output = AgentOutput::new(json!({"route": "viz"})).with_route("insight");
        assert_eq!(output.route(), Some("insight"));
        assert_eq!(AgentOutput::new(json!({"route": 3})).route(), None);
    }

    #[test]
    fn test_registry_reports_missing() {
        let registry = ExecutorRegistry::new()
            .with(AgentType::FileUpload, Arc::new(Noop))
            .with(AgentType::Report, Arc::new(Noop));
        assert!(registry.get(AgentType::Report).is_ok());
        assert!(registry.get(AgentType::Viz).is_err());
        assert_eq!(
            registry.missing(&[AgentType::FileUpload, AgentType::Viz]),
            vec![AgentType::Viz]
        );

        let mut all = ExecutorRegistry::new();
        all.register_all(Arc::new(Noop));
        assert!(all.missing(&AgentType::all()).is_empty());
    }
}
