// src/engine/core.rs

//! Pure core run state machine.
//!
//! This module contains a synchronous, deterministic core that absorbs
//! expansion results and completion events and produces "commands"
//! describing what the IO shell should do next. The async shell
//! (`engine::runtime::Runtime`) is responsible for reading events from the
//! channel, performing expansion, spawning instance futures, and enforcing
//! the deadline.
//!
//! The core can be driven in unit tests without Tokio, channels, the
//! filesystem, or processes.

use tracing::{debug, info};

use crate::graph::scheduler::{Scheduler, SchedulerStep};
use crate::graph::task::{ExecutionState, InstanceOutcome, TaskName};
use crate::engine::report::RunStatus;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Expand these tasks and dispatch their instances.
    ExpandAndDispatch(Vec<TaskName>),
    /// Signal every in-flight instance to stop.
    CancelRunning,
    /// The run is terminal; assemble the report.
    FinishRun(RunStatus),
}

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone, Default)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    /// Whether the outer event loop should keep waiting for events.
    pub keep_running: bool,
}

/// Pure core run state.
///
/// Owns the scheduler plus the cancellation/deadline flags that decide the
/// overall status. It has no channels, no Tokio types, and performs no IO.
#[derive(Debug)]
pub struct CoreRun {
    scheduler: Scheduler,
    cancelled: bool,
    timed_out: bool,
}

impl CoreRun {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            cancelled: false,
            timed_out: false,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Begin the run: ready the dependency-free tasks.
    pub fn start(&mut self) -> CoreStep {
        let step = self.scheduler.start();
        self.step_from_scheduler(step)
    }

    /// Absorb an expansion result (called synchronously by the shell right
    /// after it expands a ready task).
    pub fn handle_expansion(
        &mut self,
        task: &str,
        dispatched: usize,
        expansion_failures: usize,
        first_error: Option<String>,
    ) -> CoreStep {
        let step =
            self.scheduler
                .handle_expansion(task, dispatched, expansion_failures, first_error);
        self.step_from_scheduler(step)
    }

    /// Absorb one instance completion.
    pub fn handle_instance_completion(
        &mut self,
        task: &str,
        outcome: InstanceOutcome,
    ) -> CoreStep {
        let step = self.scheduler.handle_instance_completion(task, outcome);
        self.step_from_scheduler(step)
    }

    /// Cancellation requested by the operator.
    pub fn handle_cancel(&mut self) -> CoreStep {
        info!("cancellation requested; stopping dispatch");
        self.cancelled = true;
        self.cancel_step()
    }

    /// The overall run deadline elapsed.
    pub fn handle_deadline(&mut self) -> CoreStep {
        info!("run deadline elapsed; cancelling");
        self.timed_out = true;
        self.cancel_step()
    }

    /// Overall status once the run is terminal.
    ///
    /// Without a run-level cancellation, any task that did not succeed
    /// (failed outright, or was cancelled by a nested deadline and skipped
    /// its dependents) makes the run Failed.
    pub fn status(&self) -> RunStatus {
        if self.timed_out {
            RunStatus::TimedOut
        } else if self.cancelled {
            RunStatus::Cancelled
        } else if self.scheduler.task_records().any(|t| {
            matches!(
                t.state,
                ExecutionState::Failed | ExecutionState::Skipped | ExecutionState::Cancelled
            )
        }) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    fn cancel_step(&mut self) -> CoreStep {
        self.scheduler.cancel_pending();
        let mut commands = vec![CoreCommand::CancelRunning];
        let mut keep_running = true;

        if self.scheduler.is_complete() {
            // Nothing was in flight; the run ends right here.
            commands.push(CoreCommand::FinishRun(self.status()));
            keep_running = false;
        }

        CoreStep {
            commands,
            keep_running,
        }
    }

    fn step_from_scheduler(&mut self, step: SchedulerStep) -> CoreStep {
        let mut commands = Vec::new();

        // After cancellation, newly-ready tasks no longer exist (everything
        // pending was transitioned to Cancelled), so this stays empty.
        if !step.newly_ready.is_empty() {
            debug!(tasks = ?step.newly_ready, "core: tasks ready for dispatch");
            commands.push(CoreCommand::ExpandAndDispatch(step.newly_ready));
        }

        let mut keep_running = true;
        if step.run_complete {
            commands.push(CoreCommand::FinishRun(self.status()));
            keep_running = false;
        }

        CoreStep {
            commands,
            keep_running,
        }
    }
}
