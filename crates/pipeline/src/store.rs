//! Task State Store: the single source of truth for every run
//!
//! Each run lives behind its own async mutex. Every mutation (task transition,
//! progress, routing, control flags) happens inside that exclusive section,
//! which also assigns event sequence numbers, so readers always observe a
//! consistent snapshot.

use analytics_common::{
    AgentTask, AgentType, EventStatus, LogEntry, LogLevel, PipelineError, PipelineResult, Run,
    RunFailure, RunId, RunStatus, RunView, TaskStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregator;
use crate::dataset::DatasetHandle;
use crate::events::EventPublisher;

pub struct RunState {
    pub run: Run,
    pub tasks: BTreeMap<AgentType, AgentTask>,
    pub dataset: DatasetHandle,
    pub paused: bool,
    logs: HashMap<AgentType, VecDeque<LogEntry>>,
    log_capacity: usize,
    pub(crate) events: EventPublisher,
    /// Agents with a live dispatch job (waiting for a permit, running or in backoff)
    pub(crate) in_dispatch: BTreeSet<AgentType>,
    status_tx: watch::Sender<RunStatus>,
}

impl RunState {
    pub fn new(
        run: Run,
        tasks: Vec<AgentTask>,
        dataset: DatasetHandle,
        event_capacity: usize,
        log_capacity: usize,
    ) -> Self {
        let events = EventPublisher::new(run.id, event_capacity);
        let (status_tx, _) = watch::channel(run.status);
        Self {
            tasks: tasks.into_iter().map(|t| (t.agent, t)).collect(),
            run,
            dataset,
            paused: false,
            logs: HashMap::new(),
            log_capacity: log_capacity.max(1),
            events,
            in_dispatch: BTreeSet::new(),
            status_tx,
        }
    }

    pub fn task(&self, agent: AgentType) -> PipelineResult<&AgentTask> {
        self.tasks.get(&agent).ok_or_else(|| {
            PipelineError::validation(format!("{} is not part of run {}", agent, self.run.id))
        })
    }

    /// Move a task along its state machine and publish the change.
    ///
    /// Refused once the run is terminal.
    pub fn set_task_status(
        &mut self,
        agent: AgentType,
        next: TaskStatus,
        message: impl Into<String>,
    ) -> PipelineResult<()> {
        if self.run.status.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                from: format!("run {}", self.run.status),
                to: format!("{} {}", agent, next),
            });
        }
        let message = message.into();
        let task = self.tasks.get_mut(&agent).ok_or_else(|| {
            PipelineError::validation(format!("{} is not part of run {}", agent, self.run.id))
        })?;
        task.transition(next)?;
        task.message = message.clone();
        let (progress, attempt) = (task.progress, task.attempt);

        debug!(run_id = %self.run.id, agent = %agent, status = %next, attempt, "Task transition");
        self.events
            .publish(Some(agent), EventStatus::Task(next), progress, attempt, message.clone());
        let level = match next {
            TaskStatus::Failed => LogLevel::Error,
            TaskStatus::Cancelled => LogLevel::Warn,
            // back in the queue after a failed attempt
            TaskStatus::Queued if attempt > 0 => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        self.log(agent, level, message);
        Ok(())
    }

    /// Progress reported by a running agent. Values are clamped so task
    /// progress never goes backwards and stays below 100 until completion.
    pub fn report_progress(
        &mut self,
        agent: AgentType,
        attempt: u32,
        percent: f32,
        message: impl Into<String>,
    ) -> bool {
        if self.run.status.is_terminal() || !percent.is_finite() {
            return false;
        }
        let Some(task) = self.tasks.get_mut(&agent) else {
            return false;
        };
        if task.status != TaskStatus::Running || task.attempt != attempt {
            return false;
        }
        let message = message.into();
        task.progress = percent.clamp(task.progress, 99.0);
        task.message = message.clone();
        let progress = task.progress;

        self.events
            .publish(Some(agent), EventStatus::Task(TaskStatus::Running), progress, attempt, message);
        self.refresh();
        true
    }

    pub fn log(&mut self, agent: AgentType, level: LogLevel, message: impl Into<String>) {
        let attempt = self.tasks.get(&agent).map(|t| t.attempt).unwrap_or(0);
        let entries = self.logs.entry(agent).or_default();
        if entries.len() == self.log_capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry::new(level, attempt, message));
    }

    pub fn logs(&self, agent: AgentType) -> Vec<LogEntry> {
        self.logs
            .get(&agent)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn agents_with_status(&self, status: TaskStatus) -> Vec<AgentType> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.agent)
            .collect()
    }

    /// Cancel every task that has not started yet
    pub fn cancel_pending(&mut self, reason: &str) -> PipelineResult<Vec<AgentType>> {
        let pending: Vec<AgentType> = self
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Idle | TaskStatus::Queued))
            .map(|t| t.agent)
            .collect();
        for agent in &pending {
            self.set_task_status(*agent, TaskStatus::Cancelled, reason)?;
        }
        Ok(pending)
    }

    /// Record the run's first fatal failure and cancel everything not yet
    /// started. The run turns `failed` once no task is running.
    pub fn record_failure(&mut self, agent: AgentType, message: impl Into<String>) -> PipelineResult<Vec<AgentType>> {
        if self.run.error.is_none() {
            self.run.error = Some(RunFailure {
                agent,
                message: message.into(),
            });
        }
        self.cancel_pending(&format!("Cancelled after {} failed", agent))
    }

    /// Recompute run status and progress; publishes a run event on change.
    pub fn refresh(&mut self) -> RunStatus {
        let before = self.run.status;
        let agg = aggregator::aggregate(&self.run, &self.tasks, self.paused);
        self.run.overall_progress = agg.overall_progress;

        if agg.status != before {
            self.run.status = agg.status;
            if agg.status.is_terminal() {
                self.run.completed_at = Some(Utc::now());
            }
            let message = self.describe_status();
            info!(run_id = %self.run.id, from = %before, to = %agg.status, "Run status changed");
            self.events.publish(
                None,
                EventStatus::Run(agg.status),
                agg.overall_progress,
                0,
                message,
            );
            self.status_tx.send_replace(agg.status);
        }
        agg.status
    }

    pub fn view(&self) -> RunView {
        RunView {
            run: self.run.clone(),
            tasks: self.tasks.values().cloned().collect(),
        }
    }

    fn describe_status(&self) -> String {
        match self.run.status {
            RunStatus::Failed => match &self.run.error {
                Some(failure) => format!("Run failed in {}: {}", failure.agent, failure.message),
                None => "Run failed".to_string(),
            },
            RunStatus::Cancelled => {
                let in_flight: Vec<&str> = self.run.in_flight_at_cancel.iter().map(|a| a.name()).collect();
                if in_flight.is_empty() {
                    "Run cancelled".to_string()
                } else {
                    format!("Run cancelled; in flight at cancellation: {}", in_flight.join(", "))
                }
            }
            status => format!("Run {}", status),
        }
    }
}

/// Shared handle to one run's state
pub struct RunHandle {
    pub id: RunId,
    state: Mutex<RunState>,
    /// Cancellation signal shared with every dispatched agent
    pub(crate) cancel: CancellationToken,
    /// Bounds concurrent dispatches for the run
    pub(crate) permits: Arc<Semaphore>,
}

impl RunHandle {
    pub fn new(state: RunState, max_concurrency: usize) -> Self {
        Self {
            id: state.run.id,
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Enter the run's exclusive section
    pub async fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().await
    }

    pub async fn snapshot(&self) -> RunView {
        self.lock().await.view()
    }

    /// Wait until the run reaches a terminal status
    pub async fn wait_terminal(&self) -> RunStatus {
        let mut status_rx = self.lock().await.status_tx.subscribe();
        let result = status_rx.wait_for(|status| status.is_terminal()).await.map(|s| *s);
        match result {
            Ok(status) => status,
            Err(_) => self.lock().await.run.status,
        }
    }
}

/// Registry of all retained runs
#[derive(Default)]
pub struct TaskStateStore {
    runs: DashMap<RunId, Arc<RunHandle>>,
}

impl TaskStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<RunHandle>) {
        self.runs.insert(handle.id, handle);
    }

    pub fn get(&self, run_id: RunId) -> PipelineResult<Arc<RunHandle>> {
        self.runs
            .get(&run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    pub fn remove(&self, run_id: RunId) -> Option<Arc<RunHandle>> {
        self.runs.remove(&run_id).map(|(_, handle)| handle)
    }

    pub fn handles(&self) -> Vec<Arc<RunHandle>> {
        self.runs.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
