//! Pipeline scheduler
//!
//! Drives every task of a run from `idle` to a terminal status. Each ready
//! task gets its own dispatch job that waits for a concurrency permit, runs
//! the agent under a timeout and retries retryable failures with exponential
//! backoff. All state changes go through the run's exclusive section in the
//! [`TaskStateStore`].

use analytics_common::{
    AgentType, EventStatus, LogLevel, PipelineConfig, PipelineError, PipelineResult,
    RunId, RunResults, RunStatus, RunSummary, RunView, LogEntry, AgentTask, Run, TaskStatus,
};
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::dataset::DatasetResolver;
use crate::events::{self, EventStream};
use crate::executor::{AgentInput, AgentOutput, ExecutionContext, ExecutorRegistry, ProgressReporter};
use crate::graph::DependencyGraph;
use crate::routing::RoutingResolver;
use crate::store::{RunHandle, RunState, TaskStateStore};

/// Entry point for running and controlling analysis pipelines
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: PipelineConfig,
    graph: DependencyGraph,
    router: RoutingResolver,
    executors: ExecutorRegistry,
    datasets: Arc<dyn DatasetResolver>,
    store: TaskStateStore,
}

impl PipelineOrchestrator {
    /// Build the orchestrator. Fails if the graph is invalid or an agent in
    /// the graph has no executor.
    pub fn new(
        config: PipelineConfig,
        executors: ExecutorRegistry,
        datasets: Arc<dyn DatasetResolver>,
    ) -> PipelineResult<Self> {
        let graph = DependencyGraph::from_config(&config.graph)?;
        let router = RoutingResolver::new(graph.fork().clone(), config.default_route)?;

        let missing = executors.missing(graph.agents());
        if !missing.is_empty() {
            return Err(PipelineError::config(format!(
                "no executor registered for {:?}",
                missing.iter().map(|a| a.name()).collect::<Vec<_>>()
            )));
        }

        info!(
            agents = graph.node_count(),
            edges = graph.edge_count(),
            max_concurrency = config.max_concurrency,
            "Pipeline orchestrator ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                graph,
                router,
                executors,
                datasets,
                store: TaskStateStore::new(),
            }),
        })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Create a run for `(file_id, query)` and dispatch its root tasks.
    #[instrument(skip(self, query), fields(query_len = query.len()))]
    pub async fn start_run(&self, file_id: &str, query: &str) -> PipelineResult<RunId> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::validation("query must not be empty"));
        }
        let dataset = self.inner.datasets.resolve(file_id).await?;

        let graph = &self.inner.graph;
        let static_agents: BTreeSet<AgentType> = graph.static_agents().into_iter().collect();
        let tasks = static_agents
            .iter()
            .map(|agent| AgentTask::new(*agent, graph.dependencies_of(*agent, &static_agents)))
            .collect();

        let run = Run::new(dataset.file_id.clone(), query);
        let run_id = run.id;
        let state = RunState::new(
            run,
            tasks,
            dataset,
            self.inner.config.event_buffer,
            self.inner.config.log_buffer,
        );
        let handle = Arc::new(RunHandle::new(state, self.inner.config.max_concurrency));
        self.inner.store.insert(Arc::clone(&handle));

        {
            let mut state = handle.lock().await;
            state.run.started_at = Some(Utc::now());
            state.refresh();
            self.spawn_ready(&handle, &mut state);
        }

        info!(run_id = %run_id, file_id = %file_id, "Run started");
        Ok(run_id)
    }

    pub async fn get_run_status(&self, run_id: RunId) -> PipelineResult<RunView> {
        Ok(self.inner.store.get(run_id)?.snapshot().await)
    }

    /// Stop issuing new dispatches; running tasks continue.
    #[instrument(skip(self))]
    pub async fn pause_run(&self, run_id: RunId) -> PipelineResult<()> {
        let handle = self.inner.store.get(run_id)?;
        let mut state = handle.lock().await;
        if state.run.status.is_terminal() || state.run.cancel_requested {
            return Err(PipelineError::InvalidStateTransition {
                from: state.run.status.to_string(),
                to: RunStatus::Paused.to_string(),
            });
        }
        if state.paused {
            return Ok(());
        }
        state.paused = true;
        state.refresh();
        info!(run_id = %run_id, "Run paused");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resume_run(&self, run_id: RunId) -> PipelineResult<()> {
        let handle = self.inner.store.get(run_id)?;
        let mut state = handle.lock().await;
        if state.run.status.is_terminal() || state.run.cancel_requested {
            return Err(PipelineError::InvalidStateTransition {
                from: state.run.status.to_string(),
                to: RunStatus::Running.to_string(),
            });
        }
        if !state.paused {
            return Ok(());
        }
        state.paused = false;
        state.refresh();
        self.spawn_ready(&handle, &mut state);
        info!(run_id = %run_id, "Run resumed");
        Ok(())
    }

    /// Cancel pending tasks and signal running ones. The run becomes
    /// `cancelled` once nothing is running. Repeated calls are no-ops.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: RunId) -> PipelineResult<()> {
        let handle = self.inner.store.get(run_id)?;
        let mut state = handle.lock().await;
        if state.run.cancel_requested || state.run.status == RunStatus::Cancelled {
            return Ok(());
        }
        if state.run.status.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                from: state.run.status.to_string(),
                to: RunStatus::Cancelled.to_string(),
            });
        }

        state.run.cancel_requested = true;
        state.run.in_flight_at_cancel = state.agents_with_status(TaskStatus::Running);
        state.cancel_pending("Cancelled by request")?;
        handle.cancel.cancel();
        for agent in state.run.in_flight_at_cancel.clone() {
            state.log(agent, LogLevel::Warn, "Cancellation signalled to running agent");
        }
        let status = state.refresh();

        info!(
            run_id = %run_id,
            in_flight = ?state.run.in_flight_at_cancel,
            status = %status,
            "Run cancellation accepted"
        );
        Ok(())
    }

    pub async fn get_task_logs(&self, run_id: RunId, agent: AgentType) -> PipelineResult<Vec<LogEntry>> {
        let handle = self.inner.store.get(run_id)?;
        let state = handle.lock().await;
        state.task(agent)?;
        Ok(state.logs(agent))
    }

    /// Final outputs; only available once the run has completed.
    pub async fn get_run_results(&self, run_id: RunId) -> PipelineResult<RunResults> {
        let handle = self.inner.store.get(run_id)?;
        let state = handle.lock().await;
        if state.run.status != RunStatus::Completed {
            return Err(PipelineError::ResultsNotReady {
                status: state.run.status,
            });
        }

        let outputs: BTreeMap<AgentType, serde_json::Value> = state
            .tasks
            .values()
            .filter_map(|task| task.output.clone().map(|output| (task.agent, output)))
            .collect();
        let report = self
            .inner
            .graph
            .terminal_agent()
            .and_then(|agent| outputs.get(&agent).cloned());

        Ok(RunResults { run_id, report, outputs })
    }

    /// All retained runs, newest first
    pub async fn list_runs(&self) -> Vec<RunSummary> {
        let mut runs = Vec::new();
        for handle in self.inner.store.handles() {
            runs.push(handle.lock().await.run.summary());
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Start a fresh run with the inputs of a failed or cancelled one.
    #[instrument(skip(self))]
    pub async fn retry_run(&self, run_id: RunId) -> PipelineResult<RunId> {
        let (file_id, query) = {
            let handle = self.inner.store.get(run_id)?;
            let state = handle.lock().await;
            if !matches!(state.run.status, RunStatus::Failed | RunStatus::Cancelled) {
                return Err(PipelineError::InvalidStateTransition {
                    from: state.run.status.to_string(),
                    to: "retried".to_string(),
                });
            }
            (state.run.file_id.clone(), state.run.query.clone())
        };
        let new_id = self.start_run(&file_id, &query).await?;
        info!(previous = %run_id, run_id = %new_id, "Run retried");
        Ok(new_id)
    }

    /// Drop a terminal run and its event log.
    #[instrument(skip(self))]
    pub async fn purge_run(&self, run_id: RunId) -> PipelineResult<()> {
        let handle = self.inner.store.get(run_id)?;
        let status = handle.lock().await.run.status;
        if !status.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                from: status.to_string(),
                to: "purged".to_string(),
            });
        }
        self.inner.store.remove(run_id);
        info!(run_id = %run_id, "Run purged");
        Ok(())
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait_for_run(&self, run_id: RunId) -> PipelineResult<RunStatus> {
        let handle = self.inner.store.get(run_id)?;
        Ok(handle.wait_terminal().await)
    }

    /// Events after `from` (exclusive), then live events until the run ends.
    pub fn subscribe(&self, run_id: RunId, from: Option<u64>) -> PipelineResult<EventStream> {
        let handle = self.inner.store.get(run_id)?;
        Ok(events::subscribe(handle, from))
    }

    /// Queue and spawn a dispatch job for every ready task without one.
    fn spawn_ready(&self, handle: &Arc<RunHandle>, state: &mut RunState) {
        if state.run.status.is_terminal()
            || state.paused
            || state.run.cancel_requested
            || state.run.error.is_some()
        {
            return;
        }

        for agent in self.inner.graph.ready_tasks(&state.tasks) {
            if state.in_dispatch.contains(&agent) {
                continue;
            }
            if state.tasks.get(&agent).map(|t| t.status) == Some(TaskStatus::Idle) {
                if let Err(err) = state.set_task_status(agent, TaskStatus::Queued, "Queued for dispatch") {
                    error!(run_id = %handle.id, agent = %agent, error = %err, "Failed to queue task");
                    continue;
                }
            }
            state.in_dispatch.insert(agent);
            debug!(run_id = %handle.id, agent = %agent, "Dispatching task");
            tokio::spawn(self.clone().drive_task(Arc::clone(handle), agent));
        }
    }

    /// Dispatch job for one task: permit, attempt, retry with backoff.
    fn drive_task(self, handle: Arc<RunHandle>, agent: AgentType) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            loop {
                let permit = tokio::select! {
                    _ = handle.cancel.cancelled() => None,
                    permit = Arc::clone(&handle.permits).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    handle.lock().await.in_dispatch.remove(&agent);
                    return;
                };

                let Some((input, ctx)) = self.begin_attempt(&handle, agent).await else {
                    return;
                };
                let attempt = input.attempt;
                let result = self.execute(agent, input, ctx).await;
                drop(permit);

                let Some(delay) = self.finish_attempt(&handle, agent, attempt, result).await else {
                    return;
                };
                tokio::select! {
                    _ = handle.cancel.cancelled() => {
                        handle.lock().await.in_dispatch.remove(&agent);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    /// Move a queued task to `running` and build its input. Returns `None`
    /// (and gives up the dispatch slot) when the task may not start now.
    async fn begin_attempt(
        &self,
        handle: &Arc<RunHandle>,
        agent: AgentType,
    ) -> Option<(AgentInput, ExecutionContext)> {
        let mut state = handle.lock().await;
        let blocked = state.run.status.is_terminal()
            || state.paused
            || state.run.cancel_requested
            || state.run.error.is_some()
            || state.tasks.get(&agent).map(|t| t.status) != Some(TaskStatus::Queued);
        if blocked {
            state.in_dispatch.remove(&agent);
            return None;
        }

        let missing = self.inner.graph.unsatisfied(agent, &state.tasks);
        if !missing.is_empty() {
            let err = PipelineError::DependencyUnsatisfied { agent, missing };
            error!(run_id = %handle.id, error = %err, "Refusing to start task");
            state.in_dispatch.remove(&agent);
            if let Err(e) = state.record_failure(agent, err.to_string()) {
                error!(run_id = %handle.id, error = %e, "Failed to cancel pending tasks");
            }
            handle.cancel.cancel();
            state.refresh();
            return None;
        }

        let max_attempts = self.inner.config.max_attempts();
        let (attempt, dependencies) = match state.tasks.get_mut(&agent) {
            Some(task) => {
                task.attempt += 1;
                (task.attempt, task.dependencies.clone())
            }
            None => return None,
        };
        if let Err(err) = state.set_task_status(
            agent,
            TaskStatus::Running,
            format!("Attempt {}/{} started", attempt, max_attempts),
        ) {
            error!(run_id = %handle.id, agent = %agent, error = %err, "Failed to start task");
            state.in_dispatch.remove(&agent);
            return None;
        }
        state.refresh();

        let upstream = dependencies
            .iter()
            .filter_map(|dep| {
                state
                    .tasks
                    .get(dep)
                    .and_then(|t| t.output.clone())
                    .map(|output| (*dep, output))
            })
            .collect();
        let input = AgentInput {
            run_id: handle.id,
            agent,
            attempt,
            file_id: state.run.file_id.clone(),
            query: state.run.query.clone(),
            dataset: state.dataset.clone(),
            upstream,
        };
        let ctx = ExecutionContext {
            cancel: handle.cancel.child_token(),
            reporter: ProgressReporter::new(Arc::clone(handle), agent, attempt),
        };
        Some((input, ctx))
    }

    async fn execute(
        &self,
        agent: AgentType,
        input: AgentInput,
        ctx: ExecutionContext,
    ) -> PipelineResult<AgentOutput> {
        let executor = self.inner.executors.get(agent)?;
        let timeout = executor
            .timeout_for(agent)
            .unwrap_or_else(|| self.inner.config.task_timeout());
        match tokio::time::timeout(timeout, executor.execute(agent, input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                agent,
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Record an attempt's outcome. Returns the backoff delay when the task
    /// should be attempted again.
    async fn finish_attempt(
        &self,
        handle: &Arc<RunHandle>,
        agent: AgentType,
        attempt: u32,
        result: PipelineResult<AgentOutput>,
    ) -> Option<Duration> {
        let mut state = handle.lock().await;
        let outcome = match result {
            Ok(output) => {
                self.complete_task(handle, &mut state, agent, attempt, output);
                None
            }
            Err(err) if state.run.cancel_requested || state.run.error.is_some() => {
                let message = format!("Aborted: {}", err);
                if let Err(e) = state.set_task_status(agent, TaskStatus::Cancelled, message) {
                    error!(run_id = %handle.id, agent = %agent, error = %e, "Failed to cancel task");
                }
                None
            }
            Err(err) => self.fail_attempt(handle, &mut state, agent, attempt, err),
        };

        if outcome.is_none() {
            state.in_dispatch.remove(&agent);
        }
        state.refresh();
        self.spawn_ready(handle, &mut state);
        outcome
    }

    fn complete_task(
        &self,
        handle: &Arc<RunHandle>,
        state: &mut RunState,
        agent: AgentType,
        attempt: u32,
        output: AgentOutput,
    ) {
        if let Some(task) = state.tasks.get_mut(&agent) {
            task.output = Some(output.payload.clone());
            task.error = None;
        }
        if let Err(err) = state.set_task_status(agent, TaskStatus::Completed, "Completed") {
            error!(run_id = %handle.id, agent = %agent, error = %err, "Failed to complete task");
            return;
        }
        info!(run_id = %handle.id, agent = %agent, attempt, "Task completed");

        if agent == self.inner.router.gate() {
            let decision = self
                .inner
                .router
                .materialize(&self.inner.graph, &output, &mut state.tasks);
            state.run.route = Some(decision.branches.clone());

            if let Some(warning) = decision.warning {
                state.run.routing_warning = Some(warning.clone());
                state.log(agent, LogLevel::Warn, warning.clone());
                state
                    .events
                    .publish(Some(agent), EventStatus::Task(TaskStatus::Completed), 100.0, attempt, warning);
            }
            for branch in &decision.branches {
                let message = format!("Instantiated by route from {}", agent);
                state.log(*branch, LogLevel::Info, message.clone());
                state
                    .events
                    .publish(Some(*branch), EventStatus::Task(TaskStatus::Idle), 0.0, 0, message);
            }
            info!(run_id = %handle.id, branches = ?decision.branches, "Fork resolved");
        }

        // Branches instantiated after cancellation never start.
        if state.run.cancel_requested || state.run.error.is_some() {
            if let Err(err) = state.cancel_pending("Cancelled before dispatch") {
                error!(run_id = %handle.id, error = %err, "Failed to cancel pending tasks");
            }
        }
    }

    fn fail_attempt(
        &self,
        handle: &Arc<RunHandle>,
        state: &mut RunState,
        agent: AgentType,
        attempt: u32,
        err: PipelineError,
    ) -> Option<Duration> {
        let max_attempts = self.inner.config.max_attempts();
        if let Some(task) = state.tasks.get_mut(&agent) {
            task.error = Some(err.to_string());
        }

        if err.is_retryable() && attempt < max_attempts {
            let delay = self.inner.config.backoff_for(attempt);
            warn!(
                run_id = %handle.id,
                agent = %agent,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            let message = format!(
                "Attempt {}/{} failed: {}; retrying in {}ms",
                attempt,
                max_attempts,
                err,
                delay.as_millis()
            );
            return match state.set_task_status(agent, TaskStatus::Queued, message) {
                Ok(()) => Some(delay),
                Err(e) => {
                    error!(run_id = %handle.id, agent = %agent, error = %e, "Failed to requeue task");
                    None
                }
            };
        }

        error!(run_id = %handle.id, agent = %agent, attempt, error = %err, "Task failed");
        if let Err(e) = state.set_task_status(
            agent,
            TaskStatus::Failed,
            format!("Failed after {} attempt(s): {}", attempt, err),
        ) {
            error!(run_id = %handle.id, agent = %agent, error = %e, "Failed to mark task failed");
        }
        if let Err(e) = state.record_failure(agent, err.to_string()) {
            error!(run_id = %handle.id, error = %e, "Failed to cancel pending tasks");
        }
        handle.cancel.cancel();
        None
    }
}
