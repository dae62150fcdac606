// src/recipe/loader.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{FlowdagError, Result};
use crate::fs::FileSystem;
use crate::recipe::model::{OperationSpec, RawRecipeFile, Recipe};

/// Parse a recipe file from a given path into the raw `RawRecipeFile`.
///
/// This only performs TOML deserialization; it does **not** resolve nested
/// recipes or perform semantic validation. Use [`load_and_validate`] for
/// that.
pub fn load_from_path(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<RawRecipeFile> {
    let contents = fs.read_to_string(path.as_ref())?;
    let raw: RawRecipeFile = toml::from_str(&contents)?;
    Ok(raw)
}

/// Load a recipe file, resolve its nested sub-recipes, and validate.
///
/// - Nested `recipe = "..."` paths are resolved relative to the declaring
///   file and loaded through the same pipeline.
/// - Operation registries merge downward: a nested recipe sees its own
///   `[operation.*]` entries first, then its parent's.
/// - Recursive inclusion (a recipe reachable from itself) is rejected.
pub fn load_and_validate(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<Recipe> {
    let mut stack = Vec::new();
    load_recursive(fs, path.as_ref(), &BTreeMap::new(), &mut stack)
}

fn load_recursive(
    fs: &dyn FileSystem,
    path: &Path,
    parent_ops: &BTreeMap<String, OperationSpec>,
    stack: &mut Vec<PathBuf>,
) -> Result<Recipe> {
    let canonical = fs
        .canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf());
    if stack.contains(&canonical) {
        return Err(FlowdagError::Recipe(format!(
            "recursive recipe inclusion through '{}'",
            path.display()
        )));
    }
    stack.push(canonical);

    let mut raw = load_from_path(fs, path)?;
    debug!(recipe = %raw.recipe.name, path = %path.display(), "loaded recipe file");

    for (id, spec) in parent_ops {
        raw.operation.entry(id.clone()).or_insert_with(|| spec.clone());
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut nested = BTreeMap::new();
    for task in &raw.task {
        if let Some(rel) = &task.recipe {
            let child_path = dir.join(rel);
            let child = load_recursive(fs, &child_path, &raw.operation, stack)?;
            nested.insert(task.name.clone(), child);
        }
    }

    stack.pop();
    Recipe::compile(raw, nested)
}

/// Helper to resolve a default recipe path.
pub fn default_recipe_path() -> PathBuf {
    PathBuf::from("Recipe.toml")
}
