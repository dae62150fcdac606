// src/recipe/validate.rs

//! Raw recipe -> validated [`Recipe`] compilation.
//!
//! Everything here fails fast: a recipe that compiles is guaranteed to have
//! unique task names, resolvable references and declared outputs, legal
//! template scopes, and an acyclic dependency relation (explicit `needs`
//! augmented with implicit edges from output references).

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;

use crate::errors::{FlowdagError, Result};
use crate::graph::task::{
    InputBinding, LiteralValue, Operation, OutputRef, TaskDescriptor,
};
use crate::recipe::model::{
    InputKind, InputSpec, RawBinding, RawInputSpec, RawRecipeFile, RawTaskConfig, Recipe,
    RunConfig,
};
use crate::template;

impl TryFrom<RawRecipeFile> for Recipe {
    type Error = FlowdagError;

    /// Compile a raw recipe that contains no nested sub-recipe tasks.
    ///
    /// The loader compiles nested recipes first and calls [`Recipe::compile`]
    /// directly; this impl exists for programmatic construction in tests.
    fn try_from(raw: RawRecipeFile) -> std::result::Result<Self, Self::Error> {
        Recipe::compile(raw, BTreeMap::new())
    }
}

impl Recipe {
    /// Compile and validate a raw recipe file.
    ///
    /// `nested` maps task names to already-compiled sub-recipes (one entry
    /// per task declared with `recipe = "..."`).
    pub fn compile(raw: RawRecipeFile, mut nested: BTreeMap<String, Recipe>) -> Result<Recipe> {
        if raw.task.is_empty() {
            return Err(FlowdagError::Recipe(format!(
                "recipe '{}' declares no tasks",
                raw.recipe.name
            )));
        }
        if raw.config.max_concurrency == 0 {
            return Err(FlowdagError::Recipe(
                "[config].max_concurrency must be >= 1 (got 0)".to_string(),
            ));
        }

        let inputs = compile_inputs(&raw.inputs)?;
        validate_operations(&raw)?;

        let mut tasks: Vec<TaskDescriptor> = Vec::with_capacity(raw.task.len());
        let mut seen = BTreeSet::new();
        for rt in &raw.task {
            if !seen.insert(rt.name.clone()) {
                return Err(FlowdagError::DuplicateTaskName(rt.name.clone()));
            }
            tasks.push(compile_task(rt, &raw, &mut nested)?);
        }

        validate_references(&tasks)?;
        validate_templates(&tasks, &inputs)?;
        validate_dag(&tasks)?;

        let outputs = compile_recipe_outputs(&raw, &tasks)?;

        Ok(Recipe {
            name: raw.recipe.name,
            version: raw.recipe.version,
            config: RunConfig {
                max_concurrency: raw.config.max_concurrency,
                deadline: raw.config.deadline_secs.map(std::time::Duration::from_secs),
            },
            inputs,
            outputs,
            operations: raw.operation,
            tasks,
        })
    }
}

fn compile_inputs(raw: &BTreeMap<String, RawInputSpec>) -> Result<BTreeMap<String, InputSpec>> {
    let mut inputs = BTreeMap::new();
    for (name, spec) in raw {
        if let (Some(min), Some(max)) = (spec.min, spec.max) {
            if min > max {
                return Err(FlowdagError::Recipe(format!(
                    "input '{name}': min {min} exceeds max {max}"
                )));
            }
        }
        if spec.min.is_some() || spec.max.is_some() {
            if !matches!(spec.kind, InputKind::Int | InputKind::Float) {
                return Err(FlowdagError::Recipe(format!(
                    "input '{name}': min/max only apply to int and float inputs"
                )));
            }
        }
        let pattern = match &spec.pattern {
            Some(p) => {
                if spec.kind != InputKind::Str {
                    return Err(FlowdagError::Recipe(format!(
                        "input '{name}': pattern only applies to str inputs"
                    )));
                }
                Some(Regex::new(p).map_err(|e| {
                    FlowdagError::Recipe(format!("input '{name}': invalid pattern: {e}"))
                })?)
            }
            None => None,
        };

        let compiled = InputSpec {
            kind: spec.kind,
            description: spec.description.clone(),
            default: spec.default.as_ref().map(|d| d.to_literal()),
            min: spec.min,
            max: spec.max,
            pattern,
        };

        if let Some(default) = &compiled.default {
            check_default_kind(name, compiled.kind, default)?;
            compiled.validate_value(name, &default.to_string())?;
        }

        inputs.insert(name.clone(), compiled);
    }
    Ok(inputs)
}

fn check_default_kind(name: &str, kind: InputKind, default: &LiteralValue) -> Result<()> {
    let ok = match kind {
        InputKind::Int => matches!(default, LiteralValue::Int(_)),
        InputKind::Float => matches!(default, LiteralValue::Float(_) | LiteralValue::Int(_)),
        InputKind::Bool => matches!(default, LiteralValue::Bool(_)),
        InputKind::Str | InputKind::File | InputKind::Folder => {
            matches!(default, LiteralValue::Str(_))
        }
    };
    if ok {
        Ok(())
    } else {
        Err(FlowdagError::Recipe(format!(
            "input '{name}': default value does not match declared kind"
        )))
    }
}

fn validate_operations(raw: &RawRecipeFile) -> Result<()> {
    for (id, spec) in &raw.operation {
        for scope in template::referenced_scopes(&spec.cmd)? {
            if scope != "inputs" && scope != "outputs" {
                return Err(FlowdagError::Recipe(format!(
                    "operation '{id}': cmd may only reference 'inputs' and 'outputs', found '{scope}'"
                )));
            }
        }
    }
    Ok(())
}

fn compile_task(
    rt: &RawTaskConfig,
    raw: &RawRecipeFile,
    nested: &mut BTreeMap<String, Recipe>,
) -> Result<TaskDescriptor> {
    let operation = match (&rt.operation, &rt.recipe) {
        (Some(op), None) => {
            if !raw.operation.contains_key(op) {
                return Err(FlowdagError::Recipe(format!(
                    "task '{}' uses undeclared operation '{op}'",
                    rt.name
                )));
            }
            Operation::External(op.clone())
        }
        (None, Some(_)) => {
            if !rt.outputs.is_empty() {
                return Err(FlowdagError::Recipe(format!(
                    "task '{}' nests a recipe and must not declare its own outputs",
                    rt.name
                )));
            }
            let inner = nested.remove(&rt.name).ok_or_else(|| {
                FlowdagError::Recipe(format!(
                    "task '{}': nested recipe was not loaded",
                    rt.name
                ))
            })?;
            Operation::SubRecipe(Box::new(inner))
        }
        (Some(_), Some(_)) => {
            return Err(FlowdagError::Recipe(format!(
                "task '{}' declares both 'operation' and 'recipe'",
                rt.name
            )));
        }
        (None, None) => {
            return Err(FlowdagError::Recipe(format!(
                "task '{}' declares neither 'operation' nor 'recipe'",
                rt.name
            )));
        }
    };

    let mut inputs = BTreeMap::new();
    for (name, binding) in &rt.inputs {
        inputs.insert(name.clone(), classify_binding(binding));
    }

    let loop_source = match &rt.loop_source {
        Some(s) => Some(OutputRef::parse(s).ok_or_else(|| {
            FlowdagError::Recipe(format!(
                "task '{}': loop must reference '{{task}}.outputs.{{name}}', got '{s}'",
                rt.name
            ))
        })?),
        None => None,
    };

    // Sub-path overrides only make sense on reference-bound inputs.
    for key in rt.sub_paths.keys() {
        match inputs.get(key) {
            Some(InputBinding::Reference(_)) => {}
            Some(_) => {
                return Err(FlowdagError::Recipe(format!(
                    "task '{}': sub_paths entry '{key}' must override a reference-bound input",
                    rt.name
                )));
            }
            None => {
                return Err(FlowdagError::Recipe(format!(
                    "task '{}': sub_paths entry '{key}' names no declared input",
                    rt.name
                )));
            }
        }
    }

    // If this task binds inputs to a nested recipe, they must exist there,
    // and every inner input without a default must be bound.
    if let Operation::SubRecipe(inner) = &operation {
        for name in inputs.keys() {
            if !inner.inputs.contains_key(name) {
                return Err(FlowdagError::Recipe(format!(
                    "task '{}': nested recipe '{}' declares no input '{name}'",
                    rt.name, inner.name
                )));
            }
        }
        for (name, spec) in &inner.inputs {
            if spec.default.is_none() && !inputs.contains_key(name) {
                return Err(FlowdagError::Recipe(format!(
                    "task '{}': input '{name}' of nested recipe '{}' is not bound and has no default",
                    rt.name, inner.name
                )));
            }
        }
    }

    Ok(TaskDescriptor {
        name: rt.name.clone(),
        operation,
        inputs,
        outputs: rt.outputs.clone(),
        needs: rt.needs.clone(),
        loop_source,
        sub_folder: rt.sub_folder.clone(),
        sub_paths: rt.sub_paths.clone(),
    })
}

fn classify_binding(binding: &RawBinding) -> InputBinding {
    match binding {
        RawBinding::Bool(b) => InputBinding::Literal(LiteralValue::Bool(*b)),
        RawBinding::Int(i) => InputBinding::Literal(LiteralValue::Int(*i)),
        RawBinding::Float(x) => InputBinding::Literal(LiteralValue::Float(*x)),
        RawBinding::Str(s) => {
            if let Some(r) = OutputRef::parse(s) {
                InputBinding::Reference(r)
            } else if template::has_tokens(s) {
                InputBinding::Template(s.clone())
            } else {
                InputBinding::Literal(LiteralValue::Str(s.clone()))
            }
        }
    }
}

fn validate_references(tasks: &[TaskDescriptor]) -> Result<()> {
    let by_name: BTreeMap<&str, &TaskDescriptor> =
        tasks.iter().map(|t| (t.name.as_str(), t)).collect();

    for task in tasks {
        for dep in &task.needs {
            if dep == &task.name {
                return Err(FlowdagError::CyclicDependency(task.name.clone()));
            }
            if !by_name.contains_key(dep.as_str()) {
                return Err(FlowdagError::UnknownReference {
                    task: task.name.clone(),
                    reference: dep.clone(),
                });
            }
        }

        let mut refs: Vec<&OutputRef> = task
            .inputs
            .values()
            .filter_map(|b| match b {
                InputBinding::Reference(r) => Some(r),
                _ => None,
            })
            .collect();
        if let Some(loop_ref) = &task.loop_source {
            refs.push(loop_ref);
        }

        for r in refs {
            if r.task == task.name {
                return Err(FlowdagError::CyclicDependency(task.name.clone()));
            }
            let producer = by_name.get(r.task.as_str()).ok_or_else(|| {
                FlowdagError::UnknownReference {
                    task: task.name.clone(),
                    reference: r.task.clone(),
                }
            })?;
            if !producer.declared_outputs().contains(r.output.as_str()) {
                return Err(FlowdagError::UnknownOutput {
                    task: task.name.clone(),
                    producer: r.task.clone(),
                    output: r.output.clone(),
                });
            }
        }

        if let Some(loop_ref) = &task.loop_source {
            if let Some(producer) = by_name.get(loop_ref.task.as_str()) {
                if producer.is_fan_out() {
                    return Err(FlowdagError::Recipe(format!(
                        "task '{}': loop source '{loop_ref}' is itself a fan-out task",
                        task.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Template scope rules: bindings, output paths, sub_folder and sub_paths may
/// reference `inputs`, `self`, and (for looping tasks only) `item`. Fields of
/// the `inputs` scope must name declared recipe inputs; fields of `self` must
/// be `name` or a literal-bound input of the task.
fn validate_templates(
    tasks: &[TaskDescriptor],
    inputs: &BTreeMap<String, InputSpec>,
) -> Result<()> {
    for task in tasks {
        let literal_inputs: BTreeSet<&str> = task
            .inputs
            .iter()
            .filter_map(|(name, b)| match b {
                InputBinding::Literal(_) => Some(name.as_str()),
                _ => None,
            })
            .collect();

        let mut templates: Vec<&str> = Vec::new();
        for binding in task.inputs.values() {
            if let InputBinding::Template(t) = binding {
                templates.push(t);
            }
        }
        templates.extend(task.outputs.values().map(|s| s.as_str()));
        templates.extend(task.sub_folder.as_deref());
        templates.extend(task.sub_paths.values().map(|s| s.as_str()));

        for t in templates {
            for token in template::tokenize(t)? {
                let template::Token::Ref { scope, field } = token else {
                    continue;
                };
                match scope.as_str() {
                    "inputs" => {
                        if !inputs.contains_key(&field) {
                            return Err(FlowdagError::Recipe(format!(
                                "task '{}': template '{t}' references undeclared input '{field}'",
                                task.name
                            )));
                        }
                    }
                    "item" => {
                        if !task.is_fan_out() {
                            return Err(FlowdagError::Recipe(format!(
                                "task '{}': template '{t}' uses 'item' but the task has no loop",
                                task.name
                            )));
                        }
                    }
                    "self" => {
                        if field != "name" && !literal_inputs.contains(field.as_str()) {
                            return Err(FlowdagError::Recipe(format!(
                                "task '{}': 'self.{field}' is neither 'name' nor a literal input",
                                task.name
                            )));
                        }
                    }
                    other => {
                        return Err(FlowdagError::Recipe(format!(
                            "task '{}': template '{t}' uses unknown scope '{other}'",
                            task.name
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_dag(tasks: &[TaskDescriptor]) -> Result<()> {
    // Edge direction: dependency -> dependent, as in a run plan.
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    let index: BTreeMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    for (i, _) in tasks.iter().enumerate() {
        graph.add_node(i);
    }
    for (i, task) in tasks.iter().enumerate() {
        for dep in task.dependency_names() {
            // Unknown names were rejected by validate_references.
            if let Some(&d) = index.get(dep.as_str()) {
                graph.add_edge(d, i, ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(FlowdagError::CyclicDependency(
            tasks[cycle.node_id()].name.clone(),
        )),
    }
}

fn compile_recipe_outputs(
    raw: &RawRecipeFile,
    tasks: &[TaskDescriptor],
) -> Result<BTreeMap<String, OutputRef>> {
    let by_name: BTreeMap<&str, &TaskDescriptor> =
        tasks.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut outputs = BTreeMap::new();
    for (name, spec) in &raw.outputs {
        let r = OutputRef::parse(&spec.source).ok_or_else(|| {
            FlowdagError::Recipe(format!(
                "output '{name}': source must be '{{task}}.outputs.{{name}}', got '{}'",
                spec.source
            ))
        })?;
        let producer = by_name.get(r.task.as_str()).ok_or_else(|| {
            FlowdagError::UnknownReference {
                task: format!("outputs.{name}"),
                reference: r.task.clone(),
            }
        })?;
        if !producer.declared_outputs().contains(r.output.as_str()) {
            return Err(FlowdagError::UnknownOutput {
                task: format!("outputs.{name}"),
                producer: r.task.clone(),
                output: r.output.clone(),
            });
        }
        outputs.insert(name.clone(), r);
    }
    Ok(outputs)
}
