// src/exec/backend.rs

//! Pluggable operation runner abstraction.
//!
//! The runtime talks to an [`OperationRunner`] instead of spawning
//! processes directly. This makes it easy to swap in a fake runner in
//! tests while keeping the production process execution in [`process`].
//!
//! [`ProcessRunner`] implements the external-operation contract: render
//! the command template with the instance's resolved inputs and outputs,
//! run it through the shell in the instance's working directory, and
//! verify every declared output path exists afterwards.
//!
//! [`process`]: crate::exec::process

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::errors::{FlowdagError, Result};
use crate::fs::FileSystem;
use crate::graph::task::ResolvedInvocation;
use crate::recipe::OperationSpec;
use crate::template::{self, TemplateContext};

use super::process::run_shell;

/// Trait abstracting how resolved invocations are executed.
///
/// Production code uses [`ProcessRunner`]; tests provide implementations
/// that record invocations and complete without real processes.
pub trait OperationRunner: Send + Sync + 'static {
    /// Execute one instance to completion.
    ///
    /// Success means the operation exited cleanly *and* produced every
    /// declared output. Cancellation surfaces as `FlowdagError::Cancelled`.
    fn run_operation(
        &self,
        spec: OperationSpec,
        invocation: ResolvedInvocation,
        cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
}

/// Real operation runner used in production.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    fs: Arc<dyn FileSystem>,
}

impl ProcessRunner {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

impl OperationRunner for ProcessRunner {
    fn run_operation(
        &self,
        spec: OperationSpec,
        invocation: ResolvedInvocation,
        cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>> {
        let fs = Arc::clone(&self.fs);

        Box::pin(async move {
            let cmd_line = render_command(&spec, &invocation)?;

            fs.create_dir_all(&invocation.work_dir)
                .map_err(FlowdagError::Other)?;
            for path in invocation.outputs.values() {
                if let Some(parent) = path.parent() {
                    fs.create_dir_all(parent).map_err(FlowdagError::Other)?;
                }
            }

            let label = format!("{}[{}]", invocation.task, invocation.instance);
            let code = run_shell(&label, &cmd_line, &invocation.work_dir, cancel).await?;

            if code != 0 {
                return Err(FlowdagError::OperationFailure {
                    task: invocation.task.clone(),
                    operation: invocation.operation_id.clone(),
                    detail: format!("exited with code {code}"),
                });
            }

            // Path-level handoff: the operation must have produced every
            // output it declared.
            for (name, path) in &invocation.outputs {
                if !fs.exists(path) {
                    return Err(FlowdagError::OperationFailure {
                        task: invocation.task.clone(),
                        operation: invocation.operation_id.clone(),
                        detail: format!(
                            "declared output '{name}' missing at {}",
                            path.display()
                        ),
                    });
                }
            }

            Ok(())
        })
    }
}

/// Render an operation's command template against one invocation.
fn render_command(spec: &OperationSpec, invocation: &ResolvedInvocation) -> Result<String> {
    let inputs: BTreeMap<String, String> = invocation
        .inputs
        .iter()
        .map(|(name, value)| (name.clone(), value.as_args().join(" ")))
        .collect();
    let outputs: BTreeMap<String, String> = invocation
        .outputs
        .iter()
        .map(|(name, path)| (name.clone(), path.to_string_lossy().into_owned()))
        .collect();

    let ctx = TemplateContext::new()
        .with_scope("inputs", &inputs)
        .with_scope("outputs", &outputs);

    template::resolve(&spec.cmd, &ctx).map_err(|err| FlowdagError::OperationFailure {
        task: invocation.task.clone(),
        operation: invocation.operation_id.clone(),
        detail: format!("command template did not render: {err}"),
    })
}
