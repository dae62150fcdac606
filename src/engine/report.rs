// src/engine/report.rs

//! Run results: per-task terminal states and resolved recipe outputs.

use std::collections::BTreeMap;
use std::fmt;

use crate::expand::ArtifactValue;
use crate::graph::task::{ExecutionState, TaskName};

/// Overall status of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Terminal record for one task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub name: TaskName,
    pub state: ExecutionState,
    /// Instances the expansion produced (1 for plain tasks, N for fan-out).
    pub instances: usize,
    /// First failure detail, when the task failed.
    pub failure: Option<String>,
}

/// Aggregate result of one run.
///
/// Every task appears exactly once, whatever its terminal state; exposed
/// outputs map to their resolved locations, or `None` when the producing
/// chain did not succeed.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub tasks: BTreeMap<TaskName, TaskRecord>,
    pub outputs: BTreeMap<String, Option<ArtifactValue>>,
}

impl RunReport {
    fn names_in_state(&self, state: ExecutionState) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.names_in_state(ExecutionState::Succeeded)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_in_state(ExecutionState::Failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names_in_state(ExecutionState::Skipped)
    }

    pub fn cancelled(&self) -> Vec<&str> {
        self.names_in_state(ExecutionState::Cancelled)
    }

    /// First failed task and its failure detail, for error surfacing.
    pub fn first_failure(&self) -> Option<(&str, &str)> {
        self.tasks.values().find_map(|t| {
            if t.state == ExecutionState::Failed {
                Some((t.name.as_str(), t.failure.as_deref().unwrap_or("unknown failure")))
            } else {
                None
            }
        })
    }

    /// Human-readable report for the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("run {}\n", self.status));

        out.push_str("tasks:\n");
        for record in self.tasks.values() {
            match &record.failure {
                Some(failure) => {
                    out.push_str(&format!(
                        "  {:<24} {:<10} {}\n",
                        record.name, record.state, failure
                    ));
                }
                None => {
                    out.push_str(&format!("  {:<24} {}\n", record.name, record.state));
                }
            }
        }

        if !self.outputs.is_empty() {
            out.push_str("outputs:\n");
            for (name, value) in &self.outputs {
                match value {
                    Some(ArtifactValue::Path(p)) => {
                        out.push_str(&format!("  {:<24} {}\n", name, p.display()));
                    }
                    Some(ArtifactValue::Paths(paths)) => {
                        out.push_str(&format!("  {:<24} {} file(s)\n", name, paths.len()));
                        for p in paths {
                            out.push_str(&format!("    {}\n", p.display()));
                        }
                    }
                    None => {
                        out.push_str(&format!("  {:<24} <not produced>\n", name));
                    }
                }
            }
        }

        out
    }
}
