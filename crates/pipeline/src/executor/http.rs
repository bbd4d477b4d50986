//! Executor that delegates agents to remote HTTP services
//!
//! Each configured agent type maps to an endpoint that accepts the JSON
//! [`AgentInput`] and answers with either an [`AgentOutput`] object or a bare
//! JSON payload.

use analytics_common::{AgentEndpointConfig, AgentType, LogLevel, PipelineError, PipelineResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{AgentExecutor, AgentInput, AgentOutput, ExecutionContext};

pub struct HttpAgentExecutor {
    client: reqwest::Client,
    endpoints: BTreeMap<AgentType, AgentEndpointConfig>,
}

impl HttpAgentExecutor {
    pub fn new(endpoints: BTreeMap<AgentType, AgentEndpointConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    pub fn agents(&self) -> Vec<AgentType> {
        self.endpoints.keys().copied().collect()
    }

    async fn call(&self, agent: AgentType, endpoint: &AgentEndpointConfig, input: &AgentInput) -> PipelineResult<AgentOutput> {
        let mut request = self.client.post(&endpoint.endpoint).json(input);
        if let Some(secs) = endpoint.timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::agent_execution(agent, format!("request timed out: {}", e))
            } else {
                PipelineError::Http(format!("{} request failed: {}", agent, e))
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::agent_rejected(
                agent,
                format!("endpoint answered {}: {}", status, body.trim()),
            ));
        }
        if !status.is_success() {
            return Err(PipelineError::agent_execution(
                agent,
                format!("endpoint answered {}", status),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::agent_rejected(agent, format!("invalid response body: {}", e)))?;
        Ok(parse_output(body))
    }
}

fn parse_output(body: Value) -> AgentOutput {
    if body.get("payload").is_some() {
        if let Ok(output) = serde_json::from_value::<AgentOutput>(body.clone()) {
            return output;
        }
    }
    AgentOutput::new(body)
}

#[async_trait]
impl AgentExecutor for HttpAgentExecutor {
    #[instrument(skip(self, input, ctx), fields(run_id = %input.run_id, attempt = input.attempt))]
    async fn execute(
        &self,
        agent: AgentType,
        input: AgentInput,
        ctx: ExecutionContext,
    ) -> PipelineResult<AgentOutput> {
        let endpoint = self
            .endpoints
            .get(&agent)
            .ok_or_else(|| PipelineError::agent_rejected(agent, "no endpoint configured"))?;

        if ctx.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        debug!(endpoint = %endpoint.endpoint, "Dispatching agent over HTTP");
        ctx.reporter
            .log(LogLevel::Debug, format!("POST {}", endpoint.endpoint))
            .await;

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                warn!("Agent request aborted by cancellation");
                Err(PipelineError::Cancelled)
            }
            result = self.call(agent, endpoint, &input) => result,
        }
    }

    fn timeout_for(&self, agent: AgentType) -> Option<Duration> {
        self.endpoints
            .get(&agent)
            .and_then(|endpoint| endpoint.timeout_secs)
            .map(Duration::from_secs)
    }
}
