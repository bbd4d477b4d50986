use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::types::AgentType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub pipeline: PipelineConfig,
    pub datasets: DatasetConfig,
    pub server: ServerConfig,
    /// HTTP endpoints backing each agent type
    pub agents: BTreeMap<AgentType, AgentEndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Additional attempts after the first one
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub task_timeout_secs: u64,
    /// Concurrent dispatches per run
    pub max_concurrency: usize,
    /// Branch used when planning yields no usable route
    pub default_route: AgentType,
    /// Events retained per run for replay
    pub event_buffer: usize,
    /// Log entries retained per task
    pub log_buffer: usize,
    pub graph: GraphConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 10_000,
            task_timeout_secs: 120,
            max_concurrency: 4,
            default_route: AgentType::Insight,
            event_buffer: 1024,
            log_buffer: 256,
            graph: GraphConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Total attempts a task may make, first one included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Exponential backoff before the attempt following `attempt`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Static edges plus the single runtime-conditional fork
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub edges: Vec<(AgentType, AgentType)>,
    pub fork: ForkConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        use AgentType::*;
        Self {
            edges: vec![
                (FileUpload, DataProfile),
                (DataProfile, Planning),
                (Planning, Critique),
                (Critique, Debate),
                (Debate, Report),
            ],
            fork: ForkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkConfig {
    /// Agent whose output carries the route
    pub gate: AgentType,
    pub branches: Vec<AgentType>,
    /// Agent waiting on every instantiated branch
    pub join: AgentType,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            gate: AgentType::Planning,
            branches: vec![AgentType::Insight, AgentType::Viz],
            join: AgentType::Critique,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Directory uploaded files are resolved against
    pub root: PathBuf,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./uploads"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    pub endpoint: String,
    /// Replaces `pipeline.task_timeout_secs` for this agent's attempts
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SystemConfig {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: &str) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> PipelineResult<Self> {
        let config: SystemConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let pipeline = &self.pipeline;
        if pipeline.max_concurrency == 0 {
            return Err(PipelineError::config("pipeline.max_concurrency must be at least 1"));
        }
        if pipeline.task_timeout_secs == 0 {
            return Err(PipelineError::config("pipeline.task_timeout_secs must be positive"));
        }
        if pipeline.event_buffer == 0 || pipeline.log_buffer == 0 {
            return Err(PipelineError::config("pipeline buffers must hold at least one entry"));
        }
        if pipeline.max_backoff_ms < pipeline.retry_backoff_ms {
            return Err(PipelineError::config(
                "pipeline.max_backoff_ms must not be below retry_backoff_ms",
            ));
        }
        if !pipeline.graph.fork.branches.contains(&pipeline.default_route) {
            return Err(PipelineError::config(format!(
                "default_route '{}' is not a branch of the {} fork",
                pipeline.default_route, pipeline.graph.fork.gate
            )));
        }
        for (agent, endpoint) in &self.agents {
            if endpoint.endpoint.trim().is_empty() {
                return Err(PipelineError::config(format!("agents.{} has an empty endpoint", agent)));
            }
            if endpoint.timeout_secs == Some(0) {
                return Err(PipelineError::config(format!("agents.{}.timeout_secs must be positive", agent)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SystemConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.max_attempts(), 3);
        assert_eq!(config.pipeline.task_timeout(), Duration::from_secs(120));
        assert_eq!(config.pipeline.default_route, AgentType::Insight);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let pipeline = PipelineConfig {
            retry_backoff_ms: 100,
            max_backoff_ms: 250,
            ..PipelineConfig::default()
        };
        assert_eq!(pipeline.backoff_for(1), Duration::from_millis(100));
        assert_eq!(pipeline.backoff_for(2), Duration::from_millis(200));
        assert_eq!(pipeline.backoff_for(3), Duration::from_millis(250));
        assert_eq!(pipeline.backoff_for(40), Duration::from_millis(250));
    }
}
