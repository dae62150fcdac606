// src/graph/task.rs

//! Task model: descriptors, bindings, and resolved invocations.
//!
//! A [`TaskDescriptor`] is the static declaration from the recipe file; a
//! [`ResolvedInvocation`] is one concrete instance the executor runs, with
//! every template substituted and every path made absolute. Looping tasks
//! expand to many invocations, everything else to exactly one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::errors::{FlowdagError, Result};
use crate::recipe::Recipe;

/// Canonical task name type used throughout the engine.
pub type TaskName = String;

/// Typed reference to another task's named output (`{task}.outputs.{name}`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OutputRef {
    pub task: TaskName,
    pub output: String,
}

impl OutputRef {
    /// Parse the `{task}.outputs.{name}` reference form.
    ///
    /// Returns `None` for strings that are not references (callers treat
    /// those as literals or templates).
    pub fn parse(s: &str) -> Option<Self> {
        let (task, output) = s.split_once(".outputs.")?;
        if task.is_empty() || output.is_empty() {
            return None;
        }
        let ident = |p: &str| {
            p.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !ident(task) || !ident(output) {
            return None;
        }
        Some(Self {
            task: task.to_string(),
            output: output.to_string(),
        })
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.outputs.{}", self.task, self.output)
    }
}

/// A literal input value as written in the recipe file.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Str(s) => f.write_str(s),
            LiteralValue::Int(i) => write!(f, "{i}"),
            LiteralValue::Float(x) => write!(f, "{x}"),
            LiteralValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One input binding of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum InputBinding {
    Literal(LiteralValue),
    Reference(OutputRef),
    Template(String),
}

/// What a task actually runs: an external operation from the registry, or a
/// nested recipe executed as a single task from the parent's perspective.
#[derive(Debug, Clone)]
pub enum Operation {
    External(String),
    SubRecipe(Box<Recipe>),
}

/// Static definition of one unit of work, compiled from the recipe file.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub name: TaskName,
    pub operation: Operation,
    pub inputs: BTreeMap<String, InputBinding>,
    /// Output name -> relative destination path template.
    ///
    /// Empty for sub-recipe tasks; their outputs are the inner recipe's
    /// exposed outputs.
    pub outputs: BTreeMap<String, String>,
    /// Explicit dependencies (`needs = [...]`).
    pub needs: Vec<TaskName>,
    /// Loop source: an output holding a JSON array of items.
    pub loop_source: Option<OutputRef>,
    /// Sub-folder template prefixed onto every output path of each instance.
    pub sub_folder: Option<String>,
    /// Per-input path templates joined onto the referenced output, per item.
    pub sub_paths: BTreeMap<String, String>,
}

impl TaskDescriptor {
    /// Names of tasks referenced by input bindings and the loop source.
    ///
    /// These induce implicit dependency edges on top of `needs`.
    pub fn referenced_tasks(&self) -> BTreeSet<&str> {
        let mut refs = BTreeSet::new();
        for binding in self.inputs.values() {
            if let InputBinding::Reference(r) = binding {
                refs.insert(r.task.as_str());
            }
        }
        if let Some(loop_ref) = &self.loop_source {
            refs.insert(loop_ref.task.as_str());
        }
        refs
    }

    /// Full dependency set: explicit `needs` plus implicit reference edges.
    pub fn dependency_names(&self) -> Vec<TaskName> {
        let mut deps: Vec<TaskName> = self.needs.clone();
        for name in self.referenced_tasks() {
            if !deps.iter().any(|d| d == name) {
                deps.push(name.to_string());
            }
        }
        deps
    }

    /// Output names this task exposes to downstream references.
    pub fn declared_outputs(&self) -> BTreeSet<&str> {
        match &self.operation {
            Operation::External(_) => self.outputs.keys().map(|k| k.as_str()).collect(),
            Operation::SubRecipe(recipe) => {
                recipe.outputs.keys().map(|k| k.as_str()).collect()
            }
        }
    }

    pub fn is_fan_out(&self) -> bool {
        self.loop_source.is_some()
    }
}

/// Per-instance terminal outcome reported by the operation runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    Success,
    Failed(String),
    Cancelled,
}

/// State of one task over the lifetime of a run.
///
/// `Skipped` is reserved for dependency-failure propagation; `Cancelled`
/// marks tasks that were still pending when the run was cancelled or the
/// deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::Skipped
                | ExecutionState::Cancelled
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Ready => "ready",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::Skipped => "skipped",
            ExecutionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A fully-resolved input value handed to the operation runner.
///
/// Fan-out producers yield collections; a collection flattens into repeated
/// arguments and may legitimately be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedValue {
    Single(String),
    List(Vec<String>),
}

impl ResolvedValue {
    /// Force a single value, failing when the producer was a fan-out task
    /// that never produced the specific output being demanded.
    pub fn into_single(self, task: &str, output: &str) -> Result<String> {
        match self {
            ResolvedValue::Single(s) => Ok(s),
            ResolvedValue::List(mut items) if items.len() == 1 => Ok(items.remove(0)),
            ResolvedValue::List(_) => Err(FlowdagError::MissingArtifact {
                task: task.to_string(),
                output: output.to_string(),
            }),
        }
    }

    /// Flatten to argument strings for command rendering.
    pub fn as_args(&self) -> Vec<&str> {
        match self {
            ResolvedValue::Single(s) => vec![s.as_str()],
            ResolvedValue::List(items) => items.iter().map(|s| s.as_str()).collect(),
        }
    }
}

/// One concrete, fully-resolved invocation ready for dispatch.
#[derive(Debug, Clone)]
pub struct ResolvedInvocation {
    pub task: TaskName,
    /// Index of this instance within its expansion (0 for non-looping tasks).
    pub instance: usize,
    /// Total instances produced by the expansion.
    pub total: usize,
    /// Registry id of the external operation to invoke.
    pub operation_id: String,
    pub inputs: BTreeMap<String, ResolvedValue>,
    /// Output name -> absolute destination path.
    pub outputs: BTreeMap<String, PathBuf>,
    /// Working directory the operation runs in.
    pub work_dir: PathBuf,
}
