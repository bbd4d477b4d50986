//! Runtime resolution of the conditional fork
//!
//! Once the gate agent (planning) completes, its `route` decides which fork
//! branches are instantiated for the run. This is the only place where a
//! run's task graph changes after the run has started.

use analytics_common::{AgentTask, AgentType, ForkConfig, PipelineError, PipelineResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::executor::AgentOutput;
use crate::graph::DependencyGraph;

/// Route values that select every branch
const ALL_BRANCHES: &[&str] = &["both", "all"];

/// Outcome of routing a completed gate task
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub branches: Vec<AgentType>,
    /// Set when the default route had to be used
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoutingResolver {
    fork: ForkConfig,
    default_route: AgentType,
}

impl RoutingResolver {
    pub fn new(fork: ForkConfig, default_route: AgentType) -> PipelineResult<Self> {
        if !fork.branches.contains(&default_route) {
            return Err(PipelineError::config(format!(
                "default route '{}' is not a fork branch",
                default_route
            )));
        }
        Ok(Self { fork, default_route })
    }

    pub fn gate(&self) -> AgentType {
        self.fork.gate
    }

    /// Parse a raw route value into the branches it selects.
    pub fn parse_route(&self, raw: &str) -> PipelineResult<Vec<AgentType>> {
        let value = raw.trim().to_ascii_lowercase();
        if ALL_BRANCHES.contains(&value.as_str()) {
            return Ok(self.fork.branches.clone());
        }
        match AgentType::parse(&value) {
            Ok(agent) if self.fork.branches.contains(&agent) => Ok(vec![agent]),
            _ => Err(PipelineError::Routing(format!(
                "route '{}' is not one of {:?} or 'both'",
                raw,
                self.fork.branches.iter().map(|b| b.name()).collect::<Vec<_>>()
            ))),
        }
    }

    /// Decide the branches for a gate output, falling back to the default
    /// route when the output carries no usable route.
    pub fn resolve(&self, output: &AgentOutput) -> RoutingDecision {
        let parsed = match output.route() {
            Some(raw) => self.parse_route(raw),
            None => Err(PipelineError::Routing(format!(
                "{} output has no route field",
                self.fork.gate
            ))),
        };

        match parsed {
            Ok(branches) => RoutingDecision { branches, warning: None },
            Err(err) => {
                let warning = format!("{}; falling back to '{}'", err, self.default_route);
                warn!(gate = %self.fork.gate, default = %self.default_route, "{}", warning);
                RoutingDecision {
                    branches: vec![self.default_route],
                    warning: Some(warning),
                }
            }
        }
    }

    /// Instantiate the chosen branches and rewire the join's dependencies.
    pub fn materialize(
        &self,
        graph: &DependencyGraph,
        output: &AgentOutput,
        tasks: &mut BTreeMap<AgentType, AgentTask>,
    ) -> RoutingDecision {
        let decision = self.resolve(output);

        for branch in &decision.branches {
            if tasks.contains_key(branch) {
                continue;
            }
            let instantiated: BTreeSet<AgentType> = tasks.keys().copied().collect();
            let deps = graph.dependencies_of(*branch, &instantiated);
            debug!(branch = %branch, ?deps, "Instantiating fork branch");
            tasks.insert(*branch, AgentTask::new(*branch, deps));
        }

        let instantiated: BTreeSet<AgentType> = tasks.keys().copied().collect();
        if let Some(join) = tasks.get_mut(&self.fork.join) {
            join.dependencies = graph.dependencies_of(self.fork.join, &instantiated);
        }

        decision
    }
}
