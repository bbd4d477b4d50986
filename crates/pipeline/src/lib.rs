//! Agent pipeline orchestration
//!
//! Runs the analysis agents of one (file, query) pair as a dependency graph
//! with a runtime-resolved fork, tracks task and run status, and streams
//! status events with replay.

pub mod aggregator;
pub mod dataset;
pub mod events;
pub mod executor;
pub mod graph;
pub mod routing;
pub mod scheduler;
pub mod store;

pub use dataset::{DatasetHandle, DatasetResolver, FsDatasetResolver};
pub use events::{EventPublisher, EventStream};
pub use executor::{
    AgentExecutor, AgentInput, AgentOutput, ExecutionContext, ExecutorRegistry, HttpAgentExecutor,
    ProgressReporter,
};
pub use graph::DependencyGraph;
pub use routing::{RoutingDecision, RoutingResolver};
pub use scheduler::PipelineOrchestrator;
pub use store::{RunHandle, RunState, TaskStateStore};
