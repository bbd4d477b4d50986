use thiserror::Error;

use crate::types::{AgentType, RunId, RunStatus};

/// Core error type for all pipeline failures
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Scheduler invariant violation; always a bug
    #[error("Dependency unsatisfied for {agent}: {missing:?} not completed")]
    DependencyUnsatisfied {
        agent: AgentType,
        missing: Vec<AgentType>,
    },

    #[error("Agent execution failed - {agent}: {reason}")]
    AgentExecution {
        agent: AgentType,
        reason: String,
        retryable: bool,
    },

    #[error("Timeout: {agent} exceeded {after_ms}ms")]
    Timeout { agent: AgentType, after_ms: u64 },

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Cancellation requested")]
    Cancelled,

    #[error("Graph construction failed: {0}")]
    Graph(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Results not ready: run is {status}")]
    ResultsNotReady { status: RunStatus },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph(msg.into())
    }

    /// Executor failure that may succeed on another attempt
    pub fn agent_execution(agent: AgentType, reason: impl Into<String>) -> Self {
        Self::AgentExecution {
            agent,
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Executor failure that retrying cannot fix
    pub fn agent_rejected(agent: AgentType, reason: impl Into<String>) -> Self {
        Self::AgentExecution {
            agent,
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AgentExecution { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::Http(_) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_STATE",
            Self::ResultsNotReady { .. } => "RESULTS_NOT_READY",
            Self::Config(_) | Self::Graph(_) => "CONFIGURATION_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
