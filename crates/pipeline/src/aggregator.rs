//! Derives run status and overall progress from task states
//!
//! Pure functions: the store calls [`aggregate`] after every task change and
//! writes the result back to the run record.

use analytics_common::{AgentTask, AgentType, Run, RunStatus, TaskStatus};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub status: RunStatus,
    pub overall_progress: f32,
}

/// Mean progress of the instantiated tasks. Branches that were never
/// instantiated are not part of `tasks` and so not part of the mean.
pub fn mean_progress(tasks: &BTreeMap<AgentType, AgentTask>) -> f32 {
    if tasks.is_empty() {
        return 0.0;
    }
    let total: f32 = tasks.values().map(|t| t.progress.clamp(0.0, 100.0)).sum();
    total / tasks.len() as f32
}

/// Compute the run's status and progress.
///
/// Terminal runs are returned unchanged. Overall progress never decreases,
/// even when a fork branch joins the denominator at 0%.
pub fn aggregate(run: &Run, tasks: &BTreeMap<AgentType, AgentTask>, paused: bool) -> Aggregate {
    if run.status.is_terminal() {
        return Aggregate {
            status: run.status,
            overall_progress: run.overall_progress,
        };
    }

    let all_completed = !tasks.is_empty() && tasks.values().all(|t| t.status == TaskStatus::Completed);
    let any_running = tasks.values().any(|t| t.status == TaskStatus::Running);

    let status = if all_completed {
        RunStatus::Completed
    } else if run.error.is_some() && !any_running {
        RunStatus::Failed
    } else if run.cancel_requested && !any_running {
        RunStatus::Cancelled
    } else if paused {
        RunStatus::Paused
    } else if run.started_at.is_some() {
        RunStatus::Running
    } else {
        RunStatus::Idle
    };

    let overall_progress = if status == RunStatus::Completed {
        100.0
    } else {
        mean_progress(tasks).max(run.overall_progress)
    };

    Aggregate { status, overall_progress }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analytics_common::RunFailure;
    use chrono::Utc;
    use AgentType::*;

    fn task(agent: AgentType, status: TaskStatus, progress: f32) -> (AgentType, AgentTask) {
        let mut t = AgentTask::new(agent, vec![]);
        t.status = status;
        t.progress = progress;
        (agent, t)
    }

    fn started_run() -> Run {
        let mut run = Run::new("F1", "trend");
        run.started_at = Some(Utc::now());
        run
    }

    #[test]
    fn test_mean_excludes_uninstantiated() {
        let tasks: BTreeMap<_, _> = [
            task(FileUpload, TaskStatus::Completed, 100.0),
            task(DataProfile, TaskStatus::Running, 50.0),
        ]
        .into_iter()
        .collect();
        assert_eq!(mean_progress(&tasks), 75.0);
    }

    #[test]
    fn test_all_completed_is_completed() {
        let tasks: BTreeMap<_, _> = [
            task(FileUpload, TaskStatus::Completed, 100.0),
            task(Report, TaskStatus::Completed, 100.0),
        ]
        .into_iter()
        .collect();
        let agg = aggregate(&started_run(), &tasks, false);
        assert_eq!(agg.status, RunStatus::Completed);
        assert_eq!(agg.overall_progress, 100.0);
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut run = started_run();
        run.overall_progress = 60.0;
        let tasks: BTreeMap<_, _> = [
            task(FileUpload, TaskStatus::Completed, 100.0),
            task(Insight, TaskStatus::Idle, 0.0),
        ]
        .into_iter()
        .collect();
        let agg = aggregate(&run, &tasks, false);
        assert_eq!(agg.overall_progress, 60.0);
        assert_eq!(agg.status, RunStatus::Running);
    }

    #[test]
    fn test_failure_waits_for_running_tasks() {
        let mut run = started_run();
        run.error = Some(RunFailure { agent: Insight, message: "boom".into() });
        let mut tasks: BTreeMap<_, _> = [
            task(Insight, TaskStatus::Failed, 10.0),
            task(Viz, TaskStatus::Running, 40.0),
        ]
        .into_iter()
        .collect();
        assert_eq!(aggregate(&run, &tasks, false).status, RunStatus::Running);

        tasks.get_mut(&Viz).unwrap().status = TaskStatus::Completed;
        assert_eq!(aggregate(&run, &tasks, false).status, RunStatus::Failed);
    }

    #[test]
    fn test_cancel_and_pause() {
        let mut run = started_run();
        let tasks: BTreeMap<_, _> = [
            task(Planning, TaskStatus::Completed, 100.0),
            task(Critique, TaskStatus::Idle, 0.0),
        ]
        .into_iter()
        .collect();
        assert_eq!(aggregate(&run, &tasks, true).status, RunStatus::Paused);

        run.cancel_requested = true;
        assert_eq!(aggregate(&run, &tasks, true).status, RunStatus::Cancelled);
    }

    #[test]
    fn test_terminal_run_is_frozen() {
        let mut run = started_run();
        run.status = RunStatus::Cancelled;
        run.overall_progress = 42.0;
        let tasks: BTreeMap<_, _> = [task(Report, TaskStatus::Completed, 100.0)].into_iter().collect();
        let agg = aggregate(&run, &tasks, false);
        assert_eq!(agg.status, RunStatus::Cancelled);
        assert_eq!(agg.overall_progress, 42.0);
    }
}
