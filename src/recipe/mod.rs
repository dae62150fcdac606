// src/recipe/mod.rs

//! Recipe loading, modeling, and validation.
//!
//! - [`model`] mirrors the TOML recipe format and holds the validated
//!   [`Recipe`] type.
//! - [`loader`] reads recipe files and resolves nested sub-recipes.
//! - [`validate`] compiles raw files into validated recipes.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_recipe_path, load_and_validate, load_from_path};
pub use model::{
    ConfigSection, InputKind, InputSpec, OperationSpec, RawBinding, RawInputSpec,
    RawLiteral, RawOutputSpec, RawRecipeFile, RawTaskConfig, Recipe, RecipeMeta, RunConfig,
};
