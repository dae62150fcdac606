use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use flowdag::errors::{FlowdagError, Result};
use flowdag::exec::OperationRunner;
use flowdag::fs::FileSystem;
use flowdag::graph::task::ResolvedInvocation;
use flowdag::recipe::OperationSpec;

/// A fake operation runner that:
/// - records every invocation it receives
/// - optionally writes configured output file contents (so loop sources
///   and output handoff work against a mock filesystem)
/// - completes instantly with success, a configured failure, or hangs
///   until cancelled.
pub struct FakeRunner {
    fs: Arc<dyn FileSystem>,
    invocations: Arc<Mutex<Vec<ResolvedInvocation>>>,
    failing_tasks: Mutex<HashSet<String>>,
    hanging_tasks: Mutex<HashSet<String>>,
    /// (task, output name) -> file contents written on success.
    output_contents: Mutex<BTreeMap<(String, String), String>>,
}

impl FakeRunner {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            invocations: Arc::new(Mutex::new(Vec::new())),
            failing_tasks: Mutex::new(HashSet::new()),
            hanging_tasks: Mutex::new(HashSet::new()),
            output_contents: Mutex::new(BTreeMap::new()),
        }
    }

    /// Instances of this task report an operation failure.
    pub fn fail_task(&self, task: &str) {
        self.failing_tasks.lock().unwrap().insert(task.to_string());
    }

    /// Instances of this task block until the runtime cancels them.
    pub fn hang_task(&self, task: &str) {
        self.hanging_tasks.lock().unwrap().insert(task.to_string());
    }

    /// Write `contents` to the named output's resolved path whenever an
    /// instance of `task` succeeds.
    pub fn set_output(&self, task: &str, output: &str, contents: &str) {
        self.output_contents
            .lock()
            .unwrap()
            .insert((task.to_string(), output.to_string()), contents.to_string());
    }

    /// Task names in the order their instances were dispatched.
    pub fn executed(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|inv| inv.task.clone())
            .collect()
    }

    pub fn invocations(&self) -> Vec<ResolvedInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

impl OperationRunner for FakeRunner {
    fn run_operation(
        &self,
        _spec: OperationSpec,
        invocation: ResolvedInvocation,
        cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>> {
        self.invocations.lock().unwrap().push(invocation.clone());

        let fails = self
            .failing_tasks
            .lock()
            .unwrap()
            .contains(&invocation.task);
        let hangs = self
            .hanging_tasks
            .lock()
            .unwrap()
            .contains(&invocation.task);
        let writes: Vec<(std::path::PathBuf, String)> = {
            let contents = self.output_contents.lock().unwrap();
            invocation
                .outputs
                .iter()
                .filter_map(|(name, path)| {
                    contents
                        .get(&(invocation.task.clone(), name.clone()))
                        .map(|c| (path.clone(), c.clone()))
                })
                .collect()
        };
        let fs = Arc::clone(&self.fs);

        Box::pin(async move {
            if hangs {
                // Wait for the runtime to signal cancellation.
                let _ = cancel.await;
                return Err(FlowdagError::Cancelled);
            }

            if fails {
                return Err(FlowdagError::OperationFailure {
                    task: invocation.task.clone(),
                    operation: invocation.operation_id.clone(),
                    detail: "configured to fail".to_string(),
                });
            }

            for (path, contents) in writes {
                fs.write(&path, contents.as_bytes())
                    .map_err(FlowdagError::Other)?;
            }

            Ok(())
        })
    }
}
