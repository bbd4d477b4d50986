use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::error::PipelineError;

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| PipelineError::validation(format!("invalid run id '{}'", s)))
    }
}

/// Agent types of the analysis pipeline, in pipeline order
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentType {
    FileUpload,
    DataProfile,
    Planning,
    Insight,
    Viz,
    Critique,
    Debate,
    Report,
}

impl AgentType {
    /// Wire name, e.g. `data_profile`
    pub fn name(&self) -> &'static str {
        (*self).into()
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::FileUpload => "File Upload",
            Self::DataProfile => "Data Profiling",
            Self::Planning => "Planning",
            Self::Insight => "Insight Generation",
            Self::Viz => "Visualization",
            Self::Critique => "Critique",
            Self::Debate => "Debate",
            Self::Report => "Report",
        }
    }

    pub fn all() -> Vec<Self> {
        Self::iter().collect()
    }

    /// Parse a wire name, reporting unknown names as validation errors
    pub fn parse(name: &str) -> Result<Self, PipelineError> {
        Self::from_str(name.trim())
            .map_err(|_| PipelineError::validation(format!("unknown agent type '{}'", name)))
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle status of one agent task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed edges of the task state machine.
    ///
    /// `Running -> Queued` is the retry edge: a failed attempt that will be
    /// retried goes back to the queue without passing through `Failed`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Idle, Queued)
                | (Idle, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Queued)
        )
    }
}

/// Failure recorded on a run: which agent failed and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub agent: AgentType,
    pub message: String,
}

/// One execution of the pipeline for a (file, query) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub file_id: String,
    pub query: String,
    pub status: RunStatus,
    pub overall_progress: f32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<RunFailure>,
    /// Branches chosen by the routing step, once planning has completed
    pub route: Option<Vec<AgentType>>,
    pub routing_warning: Option<String>,
    pub cancel_requested: bool,
    /// Tasks that were running when cancellation was accepted
    pub in_flight_at_cancel: Vec<AgentType>,
}

impl Run {
    pub fn new(file_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            file_id: file_id.into(),
            query: query.into(),
            status: RunStatus::Idle,
            overall_progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            route: None,
            routing_warning: None,
            cancel_requested: false,
            in_flight_at_cancel: Vec::new(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            file_id: self.file_id.clone(),
            query: self.query.clone(),
            status: self.status,
            overall_progress: self.overall_progress,
            created_at: self.created_at,
        }
    }
}

/// One agent's node instance within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent: AgentType,
    pub dependencies: Vec<AgentType>,
    pub status: TaskStatus,
    pub progress: f32,
    pub attempt: u32,
    pub message: String,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(agent: AgentType, dependencies: Vec<AgentType>) -> Self {
        Self {
            agent,
            dependencies,
            status: TaskStatus::Idle,
            progress: 0.0,
            attempt: 0,
            message: "Waiting for dependencies".to_string(),
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move the task along its state machine, stamping timestamps.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        match next {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed => {
                self.progress = 100.0;
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }
}

/// Status of a run together with all of its instantiated tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: Run,
    pub tasks: Vec<AgentTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub file_id: String,
    pub query: String,
    pub status: RunStatus,
    pub overall_progress: f32,
    pub created_at: DateTime<Utc>,
}

/// Final output of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub run_id: RunId,
    pub report: Option<serde_json::Value>,
    pub outputs: BTreeMap<AgentType, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Per-task log line kept for `task logs` queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub attempt: u32,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            attempt,
            message: message.into(),
        }
    }
}

/// Whose status an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum EventStatus {
    Run(RunStatus),
    Task(TaskStatus),
}

/// Status/progress delta streamed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Monotonically increasing per run, starting at 1
    pub sequence: u64,
    pub run_id: RunId,
    /// `None` for run-level events
    pub task: Option<AgentType>,
    pub status: EventStatus,
    pub progress: f32,
    pub attempt: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// True for the last event a run will ever emit
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, EventStatus::Run(status) if status.is_terminal())
    }
}
