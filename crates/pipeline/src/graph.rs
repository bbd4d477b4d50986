//! Agent dependency graph using petgraph
//!
//! Static edges are fixed when the graph is built. The fork edges
//! (gate -> branch -> join) are conditional: they only count as dependencies
//! once the branch has been instantiated for a run.

use analytics_common::{AgentTask, AgentType, ForkConfig, GraphConfig, PipelineError, PipelineResult, TaskStatus};
use petgraph::algo::toposort;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Agent graph type
pub type AgentGraph = DiGraph<AgentType, DependencyEdge>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyType {
    Static,
    Conditional,
}

/// Dependency edge between agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub dependency_type: DependencyType,
}

impl fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dependency_type {
            DependencyType::Static => write!(f, "static"),
            DependencyType::Conditional => write!(f, "conditional"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: AgentGraph,
    indices: HashMap<AgentType, NodeIndex>,
    fork: ForkConfig,
    /// Every agent in topological order
    order: Vec<AgentType>,
}

impl DependencyGraph {
    /// Build and validate the graph. Cycles and malformed forks are fatal.
    pub fn from_config(config: &GraphConfig) -> PipelineResult<Self> {
        let fork = config.fork.clone();
        validate_fork(&fork)?;

        let mut graph = AgentGraph::new();
        let mut indices: HashMap<AgentType, NodeIndex> = HashMap::new();
        let mut node = |graph: &mut AgentGraph, agent: AgentType| {
            *indices.entry(agent).or_insert_with(|| graph.add_node(agent))
        };

        for (from, to) in &config.edges {
            if from == to {
                return Err(PipelineError::graph(format!("{} depends on itself", from)));
            }
            if fork.branches.contains(from) || fork.branches.contains(to) {
                return Err(PipelineError::graph(format!(
                    "edge {} -> {} touches a fork branch; branch edges are implied by the fork",
                    from, to
                )));
            }
            let (a, b) = (node(&mut graph, *from), node(&mut graph, *to));
            graph.update_edge(a, b, DependencyEdge { dependency_type: DependencyType::Static });
        }

        let gate = node(&mut graph, fork.gate);
        let join = node(&mut graph, fork.join);
        for branch in &fork.branches {
            let idx = node(&mut graph, *branch);
            let conditional = DependencyEdge { dependency_type: DependencyType::Conditional };
            graph.update_edge(gate, idx, conditional);
            graph.update_edge(idx, join, conditional);
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            PipelineError::graph(format!("dependency cycle through {}", graph[cycle.node_id()]))
        })?;
        let order = sorted.into_iter().map(|idx| graph[idx]).collect();

        Ok(Self { graph, indices, fork, order })
    }

    pub fn fork(&self) -> &ForkConfig {
        &self.fork
    }

    pub fn is_branch(&self, agent: AgentType) -> bool {
        self.fork.branches.contains(&agent)
    }

    pub fn contains(&self, agent: AgentType) -> bool {
        self.indices.contains_key(&agent)
    }

    /// All agents, topologically ordered
    pub fn agents(&self) -> &[AgentType] {
        &self.order
    }

    /// Agents instantiated when a run starts (everything but the fork branches)
    pub fn static_agents(&self) -> Vec<AgentType> {
        self.order.iter().copied().filter(|a| !self.is_branch(*a)).collect()
    }

    /// Agents with no prerequisites
    pub fn roots(&self) -> Vec<AgentType> {
        self.order
            .iter()
            .copied()
            .filter(|agent| self.neighbors(*agent, Direction::Incoming).is_empty())
            .collect()
    }

    /// Last agent in topological order; its output is the run's final result
    pub fn terminal_agent(&self) -> Option<AgentType> {
        self.order.last().copied()
    }

    /// Prerequisites of `agent` among the instantiated agents
    pub fn dependencies_of(&self, agent: AgentType, instantiated: &BTreeSet<AgentType>) -> Vec<AgentType> {
        let mut deps: Vec<AgentType> = self
            .neighbors(agent, Direction::Incoming)
            .into_iter()
            .filter(|dep| instantiated.contains(dep))
            .collect();
        deps.sort();
        deps
    }

    /// Tasks whose dependencies are all completed and that are still waiting
    /// to run (`idle` or `queued`)
    pub fn ready_tasks(&self, tasks: &BTreeMap<AgentType, AgentTask>) -> Vec<AgentType> {
        let instantiated: BTreeSet<AgentType> = tasks.keys().copied().collect();
        self.order
            .iter()
            .filter_map(|agent| tasks.get(agent))
            .filter(|task| matches!(task.status, TaskStatus::Idle | TaskStatus::Queued))
            .filter(|task| {
                self.dependencies_of(task.agent, &instantiated)
                    .iter()
                    .all(|dep| tasks.get(dep).map(|t| t.status) == Some(TaskStatus::Completed))
            })
            .map(|task| task.agent)
            .collect()
    }

    /// Dependencies of `agent` that are not completed yet
    pub fn unsatisfied(&self, agent: AgentType, tasks: &BTreeMap<AgentType, AgentTask>) -> Vec<AgentType> {
        let instantiated: BTreeSet<AgentType> = tasks.keys().copied().collect();
        self.dependencies_of(agent, &instantiated)
            .into_iter()
            .filter(|dep| tasks.get(dep).map(|t| t.status) != Some(TaskStatus::Completed))
            .collect()
    }

    /// Graphviz rendering of the full graph
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::with_config(&self.graph, &[Config::EdgeNoLabel]))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn neighbors(&self, agent: AgentType, direction: Direction) -> Vec<AgentType> {
        match self.indices.get(&agent) {
            Some(idx) => self
                .graph
                .neighbors_directed(*idx, direction)
                .map(|n| self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }
}

fn validate_fork(fork: &ForkConfig) -> PipelineResult<()> {
    if fork.branches.is_empty() {
        return Err(PipelineError::graph("fork has no branches"));
    }
    if fork.gate == fork.join {
        return Err(PipelineError::graph("fork gate and join must differ"));
    }
    let unique: BTreeSet<_> = fork.branches.iter().collect();
    if unique.len() != fork.branches.len() {
        return Err(PipelineError::graph("fork branches must be distinct"));
    }
    if fork.branches.contains(&fork.gate) || fork.branches.contains(&fork.join) {
        return Err(PipelineError::graph("fork gate/join cannot also be a branch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentType::*;

    fn canonical() -> DependencyGraph {
        DependencyGraph::from_config(&GraphConfig::default()).unwrap()
    }

    fn tasks_for(graph: &DependencyGraph, agents: &[AgentType]) -> BTreeMap<AgentType, AgentTask> {
        let set: BTreeSet<_> = agents.iter().copied().collect();
        agents
            .iter()
            .map(|a| (*a, AgentTask::new(*a, graph.dependencies_of(*a, &set))))
            .collect()
    }

    #[test]
    fn test_canonical_shape() {
        let graph = canonical();
        assert_eq!(graph.node_count(), 8);
        // 5 static + 2 * 2 conditional
        assert_eq!(graph.edge_count(), 9);
        assert_eq!(graph.roots(), vec![FileUpload]);
        assert_eq!(graph.terminal_agent(), Some(Report));
        assert_eq!(
            graph.static_agents(),
            vec![FileUpload, DataProfile, Planning, Critique, Debate, Report]
        );
    }

    #[test]
    fn test_join_dependencies_follow_instantiation() {
        let graph = canonical();
        let only_static: BTreeSet<_> = graph.static_agents().into_iter().collect();
        assert_eq!(graph.dependencies_of(Critique, &only_static), vec![Planning]);

        let mut with_viz = only_static.clone();
        with_viz.insert(Viz);
        assert_eq!(graph.dependencies_of(Critique, &with_viz), vec![Planning, Viz]);
        assert_eq!(graph.dependencies_of(Viz, &with_viz), vec![Planning]);
    }

    #[test]
    fn test_ready_tasks() {
        let graph = canonical();
        let mut tasks = tasks_for(&graph, &graph.static_agents());
        assert_eq!(graph.ready_tasks(&tasks), vec![FileUpload]);

        for agent in [FileUpload, DataProfile] {
            let task = tasks.get_mut(&agent).unwrap();
            task.transition(TaskStatus::Queued).unwrap();
            task.transition(TaskStatus::Running).unwrap();
            task.transition(TaskStatus::Completed).unwrap();
        }
        assert_eq!(graph.ready_tasks(&tasks), vec![Planning]);
        assert_eq!(graph.unsatisfied(Critique, &tasks), vec![Planning]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut config = GraphConfig::default();
        config.edges.push((Report, FileUpload));
        let err = DependencyGraph::from_config(&config).unwrap_err();
        assert!(matches!(err, PipelineError::Graph(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_loop_and_branch_edges_rejected() {
        let mut config = GraphConfig::default();
        config.edges.push((Debate, Debate));
        assert!(DependencyGraph::from_config(&config).is_err());

        let mut config = GraphConfig::default();
        config.edges.push((Insight, Report));
        assert!(DependencyGraph::from_config(&config).is_err());
    }

    #[test]
    fn test_malformed_fork_rejected() {
        let mut config = GraphConfig::default();
        config.fork.branches.clear();
        assert!(DependencyGraph::from_config(&config).is_err());

        let mut config = GraphConfig::default();
        config.fork.branches = vec![Insight, Insight];
        assert!(DependencyGraph::from_config(&config).is_err());
    }

    #[test]
    fn test_dot_export_mentions_agents() {
        let dot = canonical().to_dot();
        assert!(dot.contains("planning"));
        assert!(dot.contains("critique"));
    }
}
