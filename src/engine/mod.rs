// src/engine/mod.rs

//! Orchestration engine for flowdag.
//!
//! This module ties together:
//! - the graph scheduler
//! - runtime expansion of ready tasks into concrete instances
//! - the main event loop that reacts to instance completions, sub-run
//!   results, cancellation, and the run deadline
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`]; run results are modeled in [`report`].

use std::collections::BTreeMap;
use std::time::Duration;

use crate::expand::ArtifactValue;
use crate::graph::task::{InstanceOutcome, TaskName};

/// Options governing one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Overrides the recipe's `[config].max_concurrency` when set.
    pub max_concurrency: Option<usize>,
    /// Overrides the recipe's `[config].deadline_secs` when set.
    pub deadline: Option<Duration>,
}

/// Events flowing into the runtime from instance futures and the outside
/// world. All scheduler state transitions are applied serially from this
/// one stream.
#[derive(Debug)]
pub enum RunEvent {
    /// An external-operation instance reached a terminal outcome.
    InstanceCompleted {
        task: TaskName,
        instance: usize,
        outcome: InstanceOutcome,
    },
    /// A nested sub-recipe run finished for one instance of a task.
    SubRunFinished {
        task: TaskName,
        instance: usize,
        /// The inner recipe's exposed outputs that were actually produced.
        outputs: BTreeMap<String, ArtifactValue>,
        outcome: InstanceOutcome,
    },
    /// Graceful cancellation requested (e.g. Ctrl-C).
    CancelRequested,
    /// The overall run deadline fired.
    DeadlineElapsed,
}

pub mod core;
pub mod report;
pub mod runtime;

pub use core::{CoreCommand, CoreRun, CoreStep};
pub use report::{RunReport, RunStatus, TaskRecord};
pub use runtime::{RunHandle, Runtime};
