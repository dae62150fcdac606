// src/graph/state.rs

//! Per-run state transitions for tasks in the scheduler.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::graph::graph::TaskGraph;
use crate::graph::task::{ExecutionState, TaskName};

/// Per-run bookkeeping for one task.
#[derive(Debug, Clone)]
pub struct TaskRunState {
    pub name: TaskName,
    pub state: ExecutionState,
    /// Instances dispatched by the expansion (0 until expanded).
    pub instances: usize,
    /// Instances still outstanding while `Running`.
    pub remaining: usize,
    /// Whether any instance (or expansion) failed so far.
    pub any_failed: bool,
    /// Whether any instance was cancelled mid-flight.
    pub any_cancelled: bool,
    /// First failure detail, kept for the run report.
    pub failure: Option<String>,
}

impl TaskRunState {
    pub fn new(name: TaskName) -> Self {
        Self {
            name,
            state: ExecutionState::Pending,
            instances: 0,
            remaining: 0,
            any_failed: false,
            any_cancelled: false,
            failure: None,
        }
    }
}

/// Manages per-run state transitions over the task map.
///
/// All mutation goes through here so the scheduler stays a thin event
/// surface, mirroring how dependency satisfaction and failure cascades are
/// decided in one place.
pub struct StateManager<'a> {
    graph: &'a TaskGraph,
    tasks: &'a mut HashMap<TaskName, TaskRunState>,
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a TaskGraph, tasks: &'a mut HashMap<TaskName, TaskRunState>) -> Self {
        Self { graph, tasks }
    }

    /// Whether every dependency of `name` has reached `Succeeded`.
    pub fn deps_satisfied(&self, name: &str) -> bool {
        self.graph.dependencies_of(name).iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|t| t.state == ExecutionState::Succeeded)
                .unwrap_or(false)
        })
    }

    /// Collect tasks that are `Pending` with all dependencies satisfied,
    /// mark them `Ready`, and return their names in declaration order.
    pub fn collect_new_ready(&mut self) -> Vec<TaskName> {
        // Decide first, then mutate.
        let candidates: Vec<TaskName> = self
            .graph
            .tasks()
            .filter(|name| {
                self.tasks
                    .get(*name)
                    .map(|t| t.state == ExecutionState::Pending)
                    .unwrap_or(false)
                    && self.deps_satisfied(name)
            })
            .map(|s| s.to_string())
            .collect();

        for name in &candidates {
            if let Some(info) = self.tasks.get_mut(name) {
                debug!(task = %name, "dependencies satisfied; marking Ready");
                info.state = ExecutionState::Ready;
            }
        }

        candidates
    }

    /// Mark every not-yet-dispatched dependent of a failed task as `Skipped`,
    /// transitively.
    ///
    /// Returns the list of newly skipped tasks. `Running` dependents cannot
    /// occur: a task only dispatches after all its dependencies succeeded.
    pub fn mark_dependents_skipped(&mut self, failed_task: &str) -> Vec<TaskName> {
        let mut stack: Vec<TaskName> = self
            .graph
            .dependents_of(failed_task)
            .iter()
            .cloned()
            .collect();
        let mut visited: HashSet<TaskName> = HashSet::new();
        let mut newly_skipped = Vec::new();

        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            match self.tasks.get_mut(&name) {
                Some(info) => match info.state {
                    ExecutionState::Pending | ExecutionState::Ready => {
                        debug!(
                            task = %name,
                            upstream = %failed_task,
                            "skipping dependent due to upstream failure"
                        );
                        info.state = ExecutionState::Skipped;
                        newly_skipped.push(name.clone());
                        stack.extend(self.graph.dependents_of(&name).iter().cloned());
                    }
                    _ => {}
                },
                None => {
                    // Should not happen with a validated graph.
                    warn!(task = %name, "node in graph not present in state map");
                }
            }
        }

        newly_skipped
    }

    /// Transition every `Pending`/`Ready` task to `Cancelled`.
    pub fn cancel_pending(&mut self) -> Vec<TaskName> {
        let mut cancelled = Vec::new();
        for name in self.graph.tasks() {
            if let Some(info) = self.tasks.get_mut(name) {
                if matches!(
                    info.state,
                    ExecutionState::Pending | ExecutionState::Ready
                ) {
                    info.state = ExecutionState::Cancelled;
                    cancelled.push(name.to_string());
                }
            }
        }
        cancelled
    }

    /// Check if every task is in a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|info| info.state.is_terminal())
    }
}
