// src/recipe/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::errors::{FlowdagError, Result};
use crate::graph::task::{LiteralValue, OutputRef, TaskDescriptor};

/// Top-level recipe file as read from TOML, before validation.
///
/// Shape:
///
/// ```toml
/// [recipe]
/// name = "utci-comfort-map"
///
/// [config]
/// max_concurrency = 8
///
/// [inputs.north]
/// kind = "float"
/// default = 0.0
/// min = -360.0
/// max = 360.0
///
/// [outputs.utci]
/// source = "merge_results.outputs.utci"
///
/// [operation.split-grid]
/// cmd = "split-grid --model {{inputs.model}} --out {{outputs.grids}}"
///
/// [[task]]
/// name = "prepare_folder"
/// operation = "split-grid"
/// ```
///
/// Tasks are an array of tables so that declaration order is preserved (it
/// drives the topological tie-break) and duplicate names are expressible,
/// and therefore checkable.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecipeFile {
    pub recipe: RecipeMeta,

    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub inputs: BTreeMap<String, RawInputSpec>,

    #[serde(default)]
    pub outputs: BTreeMap<String, RawOutputSpec>,

    #[serde(default)]
    pub operation: BTreeMap<String, OperationSpec>,

    #[serde(default)]
    pub task: Vec<RawTaskConfig>,
}

/// `[recipe]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RecipeMeta {
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,
}

/// `[config]` section: run-level knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Maximum number of task instances executing concurrently.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Optional overall run deadline in seconds.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            deadline_secs: None,
        }
    }
}

/// Declared type of a top-level recipe input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Str,
    Int,
    Float,
    Bool,
    File,
    Folder,
}

impl Default for InputKind {
    fn default() -> Self {
        InputKind::Str
    }
}

/// `[inputs.<name>]` section, unvalidated.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInputSpec {
    #[serde(default)]
    pub kind: InputKind,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub default: Option<RawLiteral>,

    /// Lower bound for int/float inputs.
    #[serde(default)]
    pub min: Option<f64>,

    /// Upper bound for int/float inputs.
    #[serde(default)]
    pub max: Option<f64>,

    /// Regex constraint for str inputs.
    #[serde(default)]
    pub pattern: Option<String>,
}

/// `[outputs.<name>]` section: exposed output bound to a task output.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOutputSpec {
    pub source: String,

    #[serde(default)]
    pub description: Option<String>,
}

/// `[operation.<id>]` section: one external operation the engine can invoke.
///
/// `cmd` is a template over the `inputs` and `outputs` scopes, rendered per
/// instance and run through the platform shell.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationSpec {
    pub cmd: String,

    #[serde(default)]
    pub description: Option<String>,
}

/// `[[task]]` entry, unvalidated.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTaskConfig {
    pub name: String,

    /// External operation id. Exactly one of `operation` / `recipe`.
    #[serde(default)]
    pub operation: Option<String>,

    /// Path to a nested recipe file, relative to the declaring file.
    #[serde(default)]
    pub recipe: Option<String>,

    #[serde(default)]
    pub needs: Vec<String>,

    /// Reference to a sequence-valued output to fan out over.
    #[serde(default, rename = "loop")]
    pub loop_source: Option<String>,

    #[serde(default)]
    pub sub_folder: Option<String>,

    #[serde(default)]
    pub sub_paths: BTreeMap<String, String>,

    #[serde(default)]
    pub inputs: BTreeMap<String, RawBinding>,

    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// An input binding value as written in TOML.
///
/// Strings are classified later: `{task}.outputs.{name}` is a reference,
/// anything containing `{{...}}` is a template, the rest are literals.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawBinding {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A literal TOML scalar (used for input defaults).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawLiteral {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl RawLiteral {
    pub fn to_literal(&self) -> LiteralValue {
        match self {
            RawLiteral::Bool(b) => LiteralValue::Bool(*b),
            RawLiteral::Int(i) => LiteralValue::Int(*i),
            RawLiteral::Float(x) => LiteralValue::Float(*x),
            RawLiteral::Str(s) => LiteralValue::Str(s.clone()),
        }
    }
}

/// Validated input declaration with its constraints compiled.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub kind: InputKind,
    pub description: Option<String>,
    pub default: Option<LiteralValue>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<Regex>,
}

impl InputSpec {
    /// Check a user-supplied value against this input's type and constraints.
    pub fn validate_value(&self, name: &str, raw: &str) -> Result<()> {
        match self.kind {
            InputKind::Int => {
                let value: i64 = raw.parse().map_err(|_| {
                    FlowdagError::Recipe(format!("input '{name}': '{raw}' is not an integer"))
                })?;
                self.check_bounds(name, value as f64)?;
            }
            InputKind::Float => {
                let value: f64 = raw.parse().map_err(|_| {
                    FlowdagError::Recipe(format!("input '{name}': '{raw}' is not a number"))
                })?;
                self.check_bounds(name, value)?;
            }
            InputKind::Bool => {
                raw.parse::<bool>().map_err(|_| {
                    FlowdagError::Recipe(format!(
                        "input '{name}': '{raw}' is not a boolean (true/false)"
                    ))
                })?;
            }
            InputKind::Str | InputKind::File | InputKind::Folder => {
                if let Some(pattern) = &self.pattern {
                    if !pattern.is_match(raw) {
                        return Err(FlowdagError::Recipe(format!(
                            "input '{name}': '{raw}' does not match pattern '{pattern}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_bounds(&self, name: &str, value: f64) -> Result<()> {
        if let Some(min) = self.min {
            if value < min {
                return Err(FlowdagError::Recipe(format!(
                    "input '{name}': {value} is below the minimum {min}"
                )));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(FlowdagError::Recipe(format!(
                    "input '{name}': {value} is above the maximum {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Validated run-level configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_concurrency: usize,
    pub deadline: Option<Duration>,
}

/// A validated, compiled recipe: the unit the engine executes.
///
/// Construction goes through [`crate::recipe::loader::load_and_validate`]
/// (or [`Recipe::compile`] for already-parsed raw files); a value of this
/// type is guaranteed acyclic with all references resolved.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: String,
    pub version: Option<String>,
    pub config: RunConfig,
    pub inputs: BTreeMap<String, InputSpec>,
    pub outputs: BTreeMap<String, OutputRef>,
    pub operations: BTreeMap<String, OperationSpec>,
    /// Task descriptors in declaration order.
    pub tasks: Vec<TaskDescriptor>,
}

impl Recipe {
    pub fn task(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Effective input values for a run: supplied values over declared
    /// defaults, with constraints checked. Fails on unknown or missing
    /// required inputs.
    pub fn resolve_input_values(
        &self,
        supplied: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        for name in supplied.keys() {
            if !self.inputs.contains_key(name) {
                return Err(FlowdagError::Recipe(format!(
                    "unknown input '{name}' (recipe '{}' declares no such input)",
                    self.name
                )));
            }
        }

        let mut values = BTreeMap::new();
        for (name, spec) in &self.inputs {
            let value = match supplied.get(name) {
                Some(raw) => raw.clone(),
                None => match &spec.default {
                    Some(default) => default.to_string(),
                    None => {
                        return Err(FlowdagError::Recipe(format!(
                            "missing required input '{name}'"
                        )));
                    }
                },
            };
            spec.validate_value(name, &value)?;
            values.insert(name.clone(), value);
        }
        Ok(values)
    }
}
