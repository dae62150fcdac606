// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! Validation errors (`DuplicateTaskName`, `CyclicDependency`,
//! `UnknownReference`, `UnknownOutput`, `Recipe`) abort a run before anything
//! is dispatched. The remaining variants are per-task or per-run outcomes
//! that feed into the run report instead of tearing the process down.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowdagError {
    #[error("duplicate task name '{0}'")]
    DuplicateTaskName(String),

    #[error("cycle detected in task graph involving task '{0}'")]
    CyclicDependency(String),

    #[error("task '{task}' references unknown task '{reference}'")]
    UnknownReference { task: String, reference: String },

    #[error("task '{task}' references output '{output}' not declared by task '{producer}'")]
    UnknownOutput {
        task: String,
        producer: String,
        output: String,
    },

    #[error("recipe error: {0}")]
    Recipe(String),

    #[error("unresolved '{scope}.{field}' in template '{template}'")]
    TemplateResolution {
        template: String,
        scope: String,
        field: String,
    },

    #[error("operation '{operation}' failed for task '{task}': {detail}")]
    OperationFailure {
        task: String,
        operation: String,
        detail: String,
    },

    #[error("task '{task}' requires a single output '{output}' that was never produced")]
    MissingArtifact { task: String, output: String },

    #[error("run deadline elapsed")]
    Timeout,

    #[error("run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FlowdagError>;
