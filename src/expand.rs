// src/expand.rs

//! Runtime expansion of task descriptors into resolved invocations.
//!
//! Expansion happens when a task becomes ready, never statically: a looping
//! task reads its item sequence from the loop-source output produced by an
//! upstream task, then materializes one invocation per item with every
//! `{{item.*}}` and `{{self.*}}` token substituted. Template failures are
//! isolated per instance; one bad item does not take down its siblings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{FlowdagError, Result};
use crate::graph::task::{
    InputBinding, Operation, OutputRef, ResolvedInvocation, ResolvedValue, TaskDescriptor,
};
use crate::template::{self, TemplateContext};

/// One element of a loop-expanded sequence.
///
/// Items carry arbitrary named fields; by convention an `identifier` and a
/// `count`. Only scalar fields are addressable from templates. Items live
/// through expansion and are discarded afterwards.
pub type Item = serde_json::Map<String, Value>;

/// Resolved output locations, per producing task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactValue {
    /// A single path from a non-looping task.
    Path(PathBuf),
    /// The per-instance paths of a fan-out task's output; may be empty.
    Paths(Vec<PathBuf>),
}

/// Records where every produced output lives, keyed by (task, output).
///
/// The runtime writes entries as tasks expand or finish; downstream binding
/// resolution reads them. Only the runtime's event loop touches the store,
/// so there is no locking here.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    entries: BTreeMap<(String, String), ArtifactValue>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_single(&mut self, task: &str, output: &str, path: PathBuf) {
        self.entries
            .insert((task.to_string(), output.to_string()), ArtifactValue::Path(path));
    }

    pub fn record_collection(&mut self, task: &str, output: &str, paths: Vec<PathBuf>) {
        self.entries.insert(
            (task.to_string(), output.to_string()),
            ArtifactValue::Paths(paths),
        );
    }

    pub fn record_value(&mut self, task: &str, output: &str, value: ArtifactValue) {
        self.entries
            .insert((task.to_string(), output.to_string()), value);
    }

    /// Fold a value into a fan-out collection (paths flatten in).
    pub fn extend_collection(&mut self, task: &str, output: &str, value: ArtifactValue) {
        let entry = self
            .entries
            .entry((task.to_string(), output.to_string()))
            .or_insert_with(|| ArtifactValue::Paths(Vec::new()));
        if let ArtifactValue::Paths(paths) = entry {
            match value {
                ArtifactValue::Path(p) => paths.push(p),
                ArtifactValue::Paths(ps) => paths.extend(ps),
            }
        }
    }

    pub fn get(&self, r: &OutputRef) -> Option<&ArtifactValue> {
        self.entries.get(&(r.task.clone(), r.output.clone()))
    }

    /// Record every resolved output of an expansion.
    ///
    /// Fan-out tasks record collections (possibly empty); plain tasks record
    /// single paths. Instances that failed expansion contribute nothing.
    pub fn record_expansion(&mut self, task: &TaskDescriptor, expansion: &Expansion) {
        if task.is_fan_out() {
            for output in task.outputs.keys() {
                let paths: Vec<PathBuf> = expansion
                    .invocations
                    .iter()
                    .filter_map(|inv| inv.outputs.get(output).cloned())
                    .collect();
                self.record_collection(&task.name, output, paths);
            }
        } else if let Some(inv) = expansion.invocations.first() {
            for (output, path) in &inv.outputs {
                self.record_single(&task.name, output, path.clone());
            }
        }
    }
}

/// Result of expanding one task: dispatched invocations plus isolated
/// per-instance failures.
#[derive(Debug, Default)]
pub struct Expansion {
    pub invocations: Vec<ResolvedInvocation>,
    pub failures: Vec<FlowdagError>,
}

impl Expansion {
    pub fn first_error(&self) -> Option<String> {
        self.failures.first().map(|e| e.to_string())
    }
}

/// Parse a loop-source file's contents into items.
pub fn parse_items(contents: &str, source: &OutputRef) -> Result<Vec<Item>> {
    let value: Value = serde_json::from_str(contents).map_err(|e| {
        FlowdagError::Recipe(format!("loop source '{source}' is not valid JSON: {e}"))
    })?;
    let Value::Array(entries) = value else {
        return Err(FlowdagError::Recipe(format!(
            "loop source '{source}' must hold a JSON array of objects"
        )));
    };
    entries
        .into_iter()
        .map(|entry| match entry {
            Value::Object(map) => Ok(map),
            other => Err(FlowdagError::Recipe(format!(
                "loop source '{source}' holds a non-object entry: {other}"
            ))),
        })
        .collect()
}

/// Expand a task into concrete invocations.
///
/// `items` must be `Some` exactly when the task has a loop source; the
/// caller reads the loop-source file after the producer succeeds.
pub fn expand_task(
    task: &TaskDescriptor,
    input_values: &BTreeMap<String, String>,
    artifacts: &ArtifactStore,
    items: Option<&[Item]>,
    work_dir: &Path,
) -> Expansion {
    let mut expansion = Expansion::default();

    match (task.is_fan_out(), items) {
        (true, Some(items)) => {
            let total = items.len();
            debug!(task = %task.name, items = total, "expanding fan-out task");
            for (index, item) in items.iter().enumerate() {
                match resolve_instance(task, input_values, artifacts, Some(item), index, total, work_dir)
                {
                    Ok(inv) => expansion.invocations.push(inv),
                    Err(err) => expansion.failures.push(err),
                }
            }
        }
        (false, _) => {
            match resolve_instance(task, input_values, artifacts, None, 0, 1, work_dir) {
                Ok(inv) => expansion.invocations.push(inv),
                Err(err) => expansion.failures.push(err),
            }
        }
        (true, None) => {
            expansion.failures.push(FlowdagError::Recipe(format!(
                "task '{}' loops but no items were supplied",
                task.name
            )));
        }
    }

    expansion
}

fn resolve_instance(
    task: &TaskDescriptor,
    input_values: &BTreeMap<String, String>,
    artifacts: &ArtifactStore,
    item: Option<&Item>,
    index: usize,
    total: usize,
    work_dir: &Path,
) -> Result<ResolvedInvocation> {
    let self_scope = self_scope(task);
    let item_scope = item.map(item_scope);

    let mut ctx = TemplateContext::new()
        .with_scope("inputs", input_values)
        .with_scope("self", &self_scope);
    if let Some(scope) = &item_scope {
        ctx = ctx.with_scope("item", scope);
    }

    let instance_dir = instance_dir(task, &ctx, index, work_dir)?;

    let mut inputs = BTreeMap::new();
    for (name, binding) in &task.inputs {
        let value = match binding {
            InputBinding::Literal(lit) => ResolvedValue::Single(lit.to_string()),
            InputBinding::Template(t) => ResolvedValue::Single(template::resolve(t, &ctx)?),
            InputBinding::Reference(r) => resolve_reference(task, name, r, artifacts, &ctx)?,
        };
        inputs.insert(name.clone(), value);
    }

    let mut outputs = BTreeMap::new();
    for (name, rel_template) in &task.outputs {
        let rel = template::resolve(rel_template, &ctx)?;
        outputs.insert(name.clone(), instance_dir.join(rel));
    }

    let operation_id = match &task.operation {
        Operation::External(id) => id.clone(),
        Operation::SubRecipe(recipe) => recipe.name.clone(),
    };

    Ok(ResolvedInvocation {
        task: task.name.clone(),
        instance: index,
        total,
        operation_id,
        inputs,
        outputs,
        work_dir: instance_dir,
    })
}

fn resolve_reference(
    task: &TaskDescriptor,
    input_name: &str,
    r: &OutputRef,
    artifacts: &ArtifactStore,
    ctx: &TemplateContext<'_>,
) -> Result<ResolvedValue> {
    let artifact = artifacts.get(r).ok_or_else(|| FlowdagError::MissingArtifact {
        task: r.task.clone(),
        output: r.output.clone(),
    })?;

    let value = match artifact {
        ArtifactValue::Path(p) => ResolvedValue::Single(p.to_string_lossy().into_owned()),
        ArtifactValue::Paths(paths) => ResolvedValue::List(
            paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        ),
    };

    match task.sub_paths.get(input_name) {
        Some(sub_template) => {
            let base = value.into_single(&r.task, &r.output)?;
            let sub = template::resolve(sub_template, ctx)?;
            Ok(ResolvedValue::Single(
                Path::new(&base).join(sub).to_string_lossy().into_owned(),
            ))
        }
        None => Ok(value),
    }
}

/// Directory an instance runs in and resolves its outputs against.
///
/// `sub_folder` scopes the instance under the run folder; sub-recipes
/// without one get a folder named after the task (suffixed per instance for
/// fan-out, so sibling child runs never collide).
fn instance_dir(
    task: &TaskDescriptor,
    ctx: &TemplateContext<'_>,
    index: usize,
    work_dir: &Path,
) -> Result<PathBuf> {
    if let Some(sub_folder) = &task.sub_folder {
        let resolved = template::resolve(sub_folder, ctx)?;
        return Ok(work_dir.join(resolved));
    }
    match &task.operation {
        Operation::External(_) => Ok(work_dir.to_path_buf()),
        Operation::SubRecipe(_) => {
            if task.is_fan_out() {
                Ok(work_dir.join(&task.name).join(index.to_string()))
            } else {
                Ok(work_dir.join(&task.name))
            }
        }
    }
}

fn self_scope(task: &TaskDescriptor) -> BTreeMap<String, String> {
    let mut scope = BTreeMap::new();
    scope.insert("name".to_string(), task.name.clone());
    for (name, binding) in &task.inputs {
        if let InputBinding::Literal(lit) = binding {
            scope.insert(name.clone(), lit.to_string());
        }
    }
    scope
}

fn item_scope(item: &Item) -> BTreeMap<String, String> {
    let mut scope = BTreeMap::new();
    for (field, value) in item {
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            // Nested values are not addressable from templates.
            _ => continue,
        };
        scope.insert(field.clone(), rendered);
    }
    scope
}
