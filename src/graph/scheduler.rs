// src/graph/scheduler.rs

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::graph::graph::TaskGraph;
use crate::graph::state::{StateManager, TaskRunState};
use crate::graph::task::{ExecutionState, InstanceOutcome, TaskName};
use crate::recipe::Recipe;

/// Scheduler holds the immutable graph plus mutable per-run state.
///
/// It is responsible for:
/// - deciding when a task is "ready" to expand and dispatch (deps satisfied)
/// - absorbing expansion results and per-instance completions
/// - skipping dependents when a task fails
/// - detecting when the whole run is terminal
///
/// It is pure and synchronous; the async runtime drives it through the
/// `handle_*` methods and acts on the returned [`SchedulerStep`]s.
#[derive(Debug)]
pub struct Scheduler {
    graph: TaskGraph,
    tasks: HashMap<TaskName, TaskRunState>,
}

/// Structured result of a single scheduler step.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Tasks that became ready to expand and dispatch in this step.
    pub newly_ready: Vec<TaskName>,
    /// Tasks newly skipped because an upstream task failed.
    pub newly_skipped: Vec<TaskName>,
    /// Whether this step brought every task to a terminal state.
    pub run_complete: bool,
}

impl Scheduler {
    pub fn new(graph: TaskGraph) -> Self {
        let tasks = graph
            .tasks()
            .map(|name| (name.to_string(), TaskRunState::new(name.to_string())))
            .collect();
        Self { graph, tasks }
    }

    pub fn from_recipe(recipe: &Recipe) -> Result<Self> {
        Ok(Self::new(TaskGraph::from_recipe(recipe)?))
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn state_of(&self, task: &str) -> Option<ExecutionState> {
        self.tasks.get(task).map(|t| t.state)
    }

    /// Read-only view of the per-task run records, for reporting.
    pub fn task_records(&self) -> impl Iterator<Item = &TaskRunState> {
        self.graph
            .tasks()
            .filter_map(|name| self.tasks.get(name))
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }

    /// Begin the run: mark dependency-free tasks Ready.
    pub fn start(&mut self) -> SchedulerStep {
        info!(tasks = self.graph.len(), "scheduler: starting run");
        let mut manager = StateManager::new(&self.graph, &mut self.tasks);
        let newly_ready = manager.collect_new_ready();
        let run_complete = manager.all_terminal();
        SchedulerStep {
            newly_ready,
            newly_skipped: Vec::new(),
            run_complete,
        }
    }

    /// Absorb the result of expanding a Ready task.
    ///
    /// - `dispatched` instances were handed to the executor.
    /// - `expansion_failures` instances failed template resolution and were
    ///   never dispatched (isolated per-instance failures).
    ///
    /// Zero instances overall means the fan-out source was empty: the task
    /// is vacuously Succeeded and must not block downstream tasks.
    pub fn handle_expansion(
        &mut self,
        task: &str,
        dispatched: usize,
        expansion_failures: usize,
        first_error: Option<String>,
    ) -> SchedulerStep {
        let Some(info) = self.tasks.get_mut(task) else {
            warn!(task = %task, "expansion for unknown task; ignoring");
            return SchedulerStep::default();
        };
        if info.state != ExecutionState::Ready {
            warn!(task = %task, state = %info.state, "expansion for task not Ready; ignoring");
            return SchedulerStep::default();
        }

        info.instances = dispatched + expansion_failures;
        info.remaining = dispatched;
        info.any_failed = expansion_failures > 0;
        if info.failure.is_none() {
            info.failure = first_error;
        }

        if dispatched > 0 {
            debug!(
                task = %task,
                dispatched,
                expansion_failures,
                "task expanded; instances dispatched"
            );
            info.state = ExecutionState::Running;
            return SchedulerStep::default();
        }

        // Nothing dispatched: terminal immediately.
        if expansion_failures > 0 {
            info.state = ExecutionState::Failed;
            warn!(task = %task, expansion_failures, "task failed during expansion");
            self.finish_failed(task)
        } else {
            info.state = ExecutionState::Succeeded;
            debug!(task = %task, "empty fan-out; task vacuously succeeded");
            self.finish_succeeded(task)
        }
    }

    /// Absorb a single instance completion from the executor.
    pub fn handle_instance_completion(
        &mut self,
        task: &str,
        outcome: InstanceOutcome,
    ) -> SchedulerStep {
        let Some(info) = self.tasks.get_mut(task) else {
            warn!(task = %task, "completion for unknown task; ignoring");
            return SchedulerStep::default();
        };
        if info.state != ExecutionState::Running || info.remaining == 0 {
            warn!(task = %task, state = %info.state, "unexpected instance completion; ignoring");
            return SchedulerStep::default();
        }

        info.remaining -= 1;
        match outcome {
            InstanceOutcome::Success => {}
            InstanceOutcome::Failed(detail) => {
                info.any_failed = true;
                if info.failure.is_none() {
                    info.failure = Some(detail);
                }
            }
            InstanceOutcome::Cancelled => {
                info.any_cancelled = true;
            }
        }

        if info.remaining > 0 {
            return SchedulerStep::default();
        }

        // Last instance finished: settle the task's terminal state.
        if info.any_failed {
            info.state = ExecutionState::Failed;
            warn!(task = %task, failure = ?info.failure, "task failed");
            self.finish_failed(task)
        } else if info.any_cancelled {
            // Usually the whole run is being cancelled and dependents are
            // already Cancelled; if only this task was cancelled (e.g. a
            // nested run hit its own deadline), dependents can never be
            // satisfied and must be skipped.
            info.state = ExecutionState::Cancelled;
            debug!(task = %task, "task cancelled");
            self.finish_failed(task)
        } else {
            info.state = ExecutionState::Succeeded;
            debug!(task = %task, instances = info.instances, "task succeeded");
            self.finish_succeeded(task)
        }
    }

    /// Transition every not-yet-dispatched task to `Cancelled`.
    ///
    /// Running instances keep going until the runtime kills them and their
    /// completions drain through `handle_instance_completion`.
    pub fn cancel_pending(&mut self) -> Vec<TaskName> {
        let mut manager = StateManager::new(&self.graph, &mut self.tasks);
        let cancelled = manager.cancel_pending();
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "cancelled pending tasks");
        }
        cancelled
    }

    fn finish_succeeded(&mut self, _task: &str) -> SchedulerStep {
        let mut manager = StateManager::new(&self.graph, &mut self.tasks);
        let newly_ready = manager.collect_new_ready();
        let run_complete = manager.all_terminal();
        SchedulerStep {
            newly_ready,
            newly_skipped: Vec::new(),
            run_complete,
        }
    }

    fn finish_failed(&mut self, task: &str) -> SchedulerStep {
        let mut manager = StateManager::new(&self.graph, &mut self.tasks);
        let newly_skipped = manager.mark_dependents_skipped(task);
        // Sibling branches may still have become unblocked by other tasks.
        let newly_ready = manager.collect_new_ready();
        let run_complete = manager.all_terminal();
        SchedulerStep {
            newly_ready,
            newly_skipped,
            run_complete,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::graph::TaskGraph;

    fn chain() -> Scheduler {
        let mut g = TaskGraph::new();
        g.add_task("a", vec![]).unwrap();
        g.add_task("b", vec!["a".to_string()]).unwrap();
        g.add_task("c", vec!["b".to_string()]).unwrap();
        g.validate().unwrap();
        Scheduler::new(g)
    }

    #[test]
    fn chain_runs_in_order() {
        let mut s = chain();
        let step = s.start();
        assert_eq!(step.newly_ready, vec!["a"]);

        let step = s.handle_expansion("a", 1, 0, None);
        assert!(step.newly_ready.is_empty());
        let step = s.handle_instance_completion("a", InstanceOutcome::Success);
        assert_eq!(step.newly_ready, vec!["b"]);

        s.handle_expansion("b", 1, 0, None);
        let step = s.handle_instance_completion("b", InstanceOutcome::Success);
        assert_eq!(step.newly_ready, vec!["c"]);

        s.handle_expansion("c", 1, 0, None);
        let step = s.handle_instance_completion("c", InstanceOutcome::Success);
        assert!(step.run_complete);
        assert_eq!(s.state_of("c"), Some(ExecutionState::Succeeded));
    }

    #[test]
    fn failure_skips_transitive_dependents() {
        let mut s = chain();
        s.start();
        s.handle_expansion("a", 1, 0, None);
        s.handle_instance_completion("a", InstanceOutcome::Success);
        s.handle_expansion("b", 1, 0, None);

        let step =
            s.handle_instance_completion("b", InstanceOutcome::Failed("exit 2".to_string()));
        assert_eq!(step.newly_skipped, vec!["c"]);
        assert!(step.run_complete);
        assert_eq!(s.state_of("a"), Some(ExecutionState::Succeeded));
        assert_eq!(s.state_of("b"), Some(ExecutionState::Failed));
        assert_eq!(s.state_of("c"), Some(ExecutionState::Skipped));
    }

    #[test]
    fn empty_fan_out_is_vacuously_succeeded() {
        let mut s = chain();
        s.start();
        s.handle_expansion("a", 1, 0, None);
        s.handle_instance_completion("a", InstanceOutcome::Success);

        let step = s.handle_expansion("b", 0, 0, None);
        assert_eq!(s.state_of("b"), Some(ExecutionState::Succeeded));
        assert_eq!(step.newly_ready, vec!["c"]);
    }

    #[test]
    fn expansion_failure_with_no_instances_fails_the_task() {
        let mut s = chain();
        s.start();
        s.handle_expansion("a", 1, 0, None);
        s.handle_instance_completion("a", InstanceOutcome::Success);

        let step = s.handle_expansion("b", 0, 2, Some("no such field".to_string()));
        assert_eq!(s.state_of("b"), Some(ExecutionState::Failed));
        assert_eq!(step.newly_skipped, vec!["c"]);
    }

    #[test]
    fn one_failed_instance_fails_the_task_after_siblings_finish() {
        let mut g = TaskGraph::new();
        g.add_task("fan", vec![]).unwrap();
        g.add_task("after", vec!["fan".to_string()]).unwrap();
        g.validate().unwrap();
        let mut s = Scheduler::new(g);

        s.start();
        s.handle_expansion("fan", 3, 0, None);
        s.handle_instance_completion("fan", InstanceOutcome::Success);
        let step =
            s.handle_instance_completion("fan", InstanceOutcome::Failed("boom".to_string()));
        // Not terminal yet; one sibling still running.
        assert!(step.newly_skipped.is_empty());
        assert_eq!(s.state_of("fan"), Some(ExecutionState::Running));

        let step = s.handle_instance_completion("fan", InstanceOutcome::Success);
        assert_eq!(s.state_of("fan"), Some(ExecutionState::Failed));
        assert_eq!(step.newly_skipped, vec!["after"]);
    }

    #[test]
    fn cancel_pending_leaves_running_tasks_alone() {
        let mut s = chain();
        s.start();
        s.handle_expansion("a", 1, 0, None);

        let cancelled = s.cancel_pending();
        assert_eq!(cancelled, vec!["b", "c"]);
        assert_eq!(s.state_of("a"), Some(ExecutionState::Running));

        let step = s.handle_instance_completion("a", InstanceOutcome::Cancelled);
        assert!(step.run_complete);
        assert_eq!(s.state_of("a"), Some(ExecutionState::Cancelled));
    }
}
