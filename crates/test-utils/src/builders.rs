#![allow(dead_code)]

use std::collections::BTreeMap;

use flowdag::errors::FlowdagError;
use flowdag::recipe::{
    ConfigSection, OperationSpec, RawBinding, RawInputSpec, RawOutputSpec, RawRecipeFile,
    RawTaskConfig, Recipe, RecipeMeta,
};

/// Builder for `Recipe` to simplify test setup.
///
/// Builds a raw recipe file programmatically and runs it through the same
/// compile/validate pipeline the loader uses.
pub struct RecipeBuilder {
    raw: RawRecipeFile,
}

impl RecipeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            raw: RawRecipeFile {
                recipe: RecipeMeta {
                    name: name.to_string(),
                    version: None,
                },
                config: ConfigSection::default(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
                operation: BTreeMap::new(),
                task: Vec::new(),
            },
        }
    }

    pub fn with_operation(mut self, id: &str, cmd: &str) -> Self {
        self.raw.operation.insert(
            id.to_string(),
            OperationSpec {
                cmd: cmd.to_string(),
                description: None,
            },
        );
        self
    }

    pub fn with_input(mut self, name: &str, spec: RawInputSpec) -> Self {
        self.raw.inputs.insert(name.to_string(), spec);
        self
    }

    pub fn with_output(mut self, name: &str, source: &str) -> Self {
        self.raw.outputs.insert(
            name.to_string(),
            RawOutputSpec {
                source: source.to_string(),
                description: None,
            },
        );
        self
    }

    pub fn with_task(mut self, task: RawTaskConfig) -> Self {
        self.raw.task.push(task);
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.raw.config.max_concurrency = n;
        self
    }

    pub fn with_deadline_secs(mut self, secs: u64) -> Self {
        self.raw.config.deadline_secs = Some(secs);
        self
    }

    pub fn build_raw(self) -> RawRecipeFile {
        self.raw
    }

    pub fn try_build(self) -> Result<Recipe, FlowdagError> {
        Recipe::try_from(self.raw)
    }

    pub fn build(self) -> Recipe {
        self.try_build()
            .expect("failed to build valid recipe from builder")
    }
}

/// Builder for `RawTaskConfig`.
pub struct TaskBuilder {
    task: RawTaskConfig,
}

impl TaskBuilder {
    pub fn new(name: &str, operation: &str) -> Self {
        Self {
            task: RawTaskConfig {
                name: name.to_string(),
                operation: Some(operation.to_string()),
                recipe: None,
                needs: Vec::new(),
                loop_source: None,
                sub_folder: None,
                sub_paths: BTreeMap::new(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
            },
        }
    }

    pub fn needs(mut self, dep: &str) -> Self {
        self.task.needs.push(dep.to_string());
        self
    }

    /// String binding: classified as reference, template, or literal by the
    /// compile step, exactly as in a recipe file.
    pub fn input(mut self, name: &str, value: &str) -> Self {
        self.task
            .inputs
            .insert(name.to_string(), RawBinding::Str(value.to_string()));
        self
    }

    pub fn input_raw(mut self, name: &str, value: RawBinding) -> Self {
        self.task.inputs.insert(name.to_string(), value);
        self
    }

    pub fn output(mut self, name: &str, to: &str) -> Self {
        self.task
            .outputs
            .insert(name.to_string(), to.to_string());
        self
    }

    pub fn loop_over(mut self, source: &str) -> Self {
        self.task.loop_source = Some(source.to_string());
        self
    }

    pub fn sub_folder(mut self, template: &str) -> Self {
        self.task.sub_folder = Some(template.to_string());
        self
    }

    pub fn sub_path(mut self, input: &str, template: &str) -> Self {
        self.task
            .sub_paths
            .insert(input.to_string(), template.to_string());
        self
    }

    pub fn build(self) -> RawTaskConfig {
        self.task
    }
}
