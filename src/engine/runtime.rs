// src/engine/runtime.rs

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::core::{CoreCommand, CoreRun, CoreStep};
use crate::engine::report::{RunReport, RunStatus, TaskRecord};
use crate::engine::{RunEvent, RunOptions};
use crate::errors::{FlowdagError, Result};
use crate::expand::{self, ArtifactStore, ArtifactValue, Item};
use crate::exec::OperationRunner;
use crate::fs::FileSystem;
use crate::graph::scheduler::Scheduler;
use crate::graph::task::{
    ExecutionState, InstanceOutcome, Operation, OutputRef, ResolvedInvocation, TaskDescriptor,
    TaskName,
};
use crate::recipe::Recipe;

/// Drives one recipe run to completion.
///
/// This is the async IO shell around [`CoreRun`], which contains all run
/// semantics. The shell expands ready tasks, spawns instance futures
/// (bounded by a semaphore), forwards their completions over a single mpsc
/// channel, and enforces the run deadline. Core state is only mutated from
/// this event loop, so dependency counters never race.
pub struct Runtime<R: OperationRunner> {
    core: CoreRun,
    recipe: Arc<Recipe>,
    input_values: BTreeMap<String, String>,
    work_dir: PathBuf,
    artifacts: ArtifactStore,
    fs: Arc<dyn FileSystem>,
    runner: Arc<R>,
    semaphore: Arc<Semaphore>,
    deadline: Option<Duration>,
    event_tx: mpsc::Sender<RunEvent>,
    event_rx: mpsc::Receiver<RunEvent>,
    cancel_handles: HashMap<(TaskName, usize), oneshot::Sender<()>>,
}

impl<R: OperationRunner> fmt::Debug for Runtime<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("recipe", &self.recipe.name)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

/// Handle for injecting cancellation into a running runtime.
#[derive(Debug, Clone)]
pub struct RunHandle {
    tx: mpsc::Sender<RunEvent>,
}

impl RunHandle {
    pub async fn cancel(&self) {
        let _ = self.tx.send(RunEvent::CancelRequested).await;
    }
}

impl<R: OperationRunner> Runtime<R> {
    pub fn new(
        recipe: Arc<Recipe>,
        input_values: BTreeMap<String, String>,
        work_dir: PathBuf,
        fs: Arc<dyn FileSystem>,
        runner: Arc<R>,
        options: RunOptions,
    ) -> Result<Self> {
        let scheduler = Scheduler::from_recipe(&recipe)?;
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(recipe.config.max_concurrency)
            .max(1);
        let deadline = options.deadline.or(recipe.config.deadline);

        let (event_tx, event_rx) = mpsc::channel::<RunEvent>(64);

        Ok(Self {
            core: CoreRun::new(scheduler),
            recipe,
            input_values,
            work_dir,
            artifacts: ArtifactStore::new(),
            fs,
            runner,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            deadline,
            event_tx,
            event_rx,
            cancel_handles: HashMap::new(),
        })
    }

    /// Handle for cancelling this run from the outside (Ctrl-C, parent run).
    pub fn handle(&self) -> RunHandle {
        RunHandle {
            tx: self.event_tx.clone(),
        }
    }

    /// Main event loop: run the recipe to a terminal state.
    pub async fn run(mut self) -> Result<RunReport> {
        self.fs
            .create_dir_all(&self.work_dir)
            .map_err(FlowdagError::from)?;

        info!(
            recipe = %self.recipe.name,
            work_dir = %self.work_dir.display(),
            tasks = self.recipe.tasks.len(),
            "run started"
        );

        let start = self.core.start();
        let mut status = self.process_step(start)?;

        let deadline_at = self.deadline.map(|d| Instant::now() + d);
        let mut deadline_armed = deadline_at.is_some();

        while status.is_none() {
            let event = if let Some(at) = deadline_at {
                tokio::select! {
                    _ = tokio::time::sleep_until(at), if deadline_armed => {
                        deadline_armed = false;
                        RunEvent::DeadlineElapsed
                    }
                    maybe = self.event_rx.recv() => match maybe {
                        Some(event) => event,
                        None => break,
                    }
                }
            } else {
                match self.event_rx.recv().await {
                    Some(event) => event,
                    None => break,
                }
            };

            debug!(?event, "runtime received event");
            let step = self.apply_event(event);
            status = self.process_step(step)?;
        }

        let status = status.ok_or_else(|| {
            FlowdagError::Recipe("run event channel closed before the run finished".to_string())
        })?;

        let report = self.build_report(status);
        info!(recipe = %self.recipe.name, status = %report.status, "run finished");
        Ok(report)
    }

    /// Route one event into the core.
    fn apply_event(&mut self, event: RunEvent) -> CoreStep {
        match event {
            RunEvent::InstanceCompleted {
                task,
                instance,
                outcome,
            } => {
                self.cancel_handles.remove(&(task.clone(), instance));
                self.core.handle_instance_completion(&task, outcome)
            }
            RunEvent::SubRunFinished {
                task,
                instance,
                outputs,
                outcome,
            } => {
                self.cancel_handles.remove(&(task.clone(), instance));
                if outcome == InstanceOutcome::Success {
                    self.record_sub_run_outputs(&task, outputs);
                }
                self.core.handle_instance_completion(&task, outcome)
            }
            RunEvent::CancelRequested => self.core.handle_cancel(),
            RunEvent::DeadlineElapsed => self.core.handle_deadline(),
        }
    }

    /// Execute core commands, feeding any synchronously-produced follow-up
    /// steps (vacuous successes unblocking dependents) back into the queue.
    fn process_step(&mut self, step: CoreStep) -> Result<Option<RunStatus>> {
        let mut queue: VecDeque<CoreCommand> = step.commands.into();
        let mut status = None;

        while let Some(command) = queue.pop_front() {
            match command {
                CoreCommand::ExpandAndDispatch(names) => {
                    for name in names {
                        let next = self.dispatch_task(&name);
                        queue.extend(next.commands);
                    }
                }
                CoreCommand::CancelRunning => {
                    for ((task, instance), cancel) in self.cancel_handles.drain() {
                        debug!(task = %task, instance, "signalling instance to stop");
                        let _ = cancel.send(());
                    }
                }
                CoreCommand::FinishRun(s) => {
                    status = Some(s);
                }
            }
        }

        Ok(status)
    }

    /// Expand one ready task and dispatch its instances.
    fn dispatch_task(&mut self, name: &str) -> CoreStep {
        let Some(task) = self.recipe.task(name).cloned() else {
            warn!(task = %name, "dispatch for task missing from recipe");
            return self.core.handle_expansion(
                name,
                0,
                1,
                Some(format!("task '{name}' missing from recipe")),
            );
        };

        let items: Option<Vec<Item>> = match &task.loop_source {
            Some(loop_ref) => match self.load_items(loop_ref) {
                Ok(items) => Some(items),
                Err(err) => {
                    warn!(task = %name, error = %err, "failed to load loop items");
                    return self.core.handle_expansion(name, 0, 1, Some(err.to_string()));
                }
            },
            None => None,
        };

        let expansion = expand::expand_task(
            &task,
            &self.input_values,
            &self.artifacts,
            items.as_deref(),
            &self.work_dir,
        );
        for err in &expansion.failures {
            warn!(task = %name, error = %err, "instance failed during expansion");
        }

        match &task.operation {
            Operation::External(_) => {
                self.artifacts.record_expansion(&task, &expansion);
                for inv in &expansion.invocations {
                    self.spawn_external(inv.clone());
                }
            }
            Operation::SubRecipe(inner) => {
                if task.is_fan_out() {
                    // Seed empty collections so an empty fan-out still
                    // resolves to empty lists downstream.
                    for output in inner.outputs.keys() {
                        self.artifacts.record_collection(name, output, Vec::new());
                    }
                }
                for inv in &expansion.invocations {
                    self.spawn_sub_run(inner, inv.clone());
                }
            }
        }

        let dispatched = expansion.invocations.len();
        let failures = expansion.failures.len();
        let first_error = expansion.first_error();
        self.core
            .handle_expansion(name, dispatched, failures, first_error)
    }

    /// Read and parse the loop-source items for a fan-out task.
    fn load_items(&self, loop_ref: &OutputRef) -> Result<Vec<Item>> {
        let artifact =
            self.artifacts
                .get(loop_ref)
                .ok_or_else(|| FlowdagError::MissingArtifact {
                    task: loop_ref.task.clone(),
                    output: loop_ref.output.clone(),
                })?;
        let ArtifactValue::Path(path) = artifact else {
            return Err(FlowdagError::MissingArtifact {
                task: loop_ref.task.clone(),
                output: loop_ref.output.clone(),
            });
        };
        let contents = self.fs.read_to_string(path)?;
        expand::parse_items(&contents, loop_ref)
    }

    /// Spawn an external-operation instance, bounded by the semaphore.
    fn spawn_external(&mut self, inv: ResolvedInvocation) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.cancel_handles
            .insert((inv.task.clone(), inv.instance), cancel_tx);

        let Some(spec) = self.recipe.operations.get(&inv.operation_id).cloned() else {
            // Validation guarantees the operation exists; stay defensive at
            // the dispatch boundary anyway.
            let tx = self.event_tx.clone();
            let task = inv.task.clone();
            let instance = inv.instance;
            let detail = format!("operation '{}' missing from registry", inv.operation_id);
            tokio::spawn(async move {
                let _ = tx
                    .send(RunEvent::InstanceCompleted {
                        task,
                        instance,
                        outcome: InstanceOutcome::Failed(detail),
                    })
                    .await;
            });
            return;
        };

        let runner = Arc::clone(&self.runner);
        let semaphore = Arc::clone(&self.semaphore);
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let task = inv.task.clone();
            let instance = inv.instance;

            enum Acquired {
                Permit(tokio::sync::OwnedSemaphorePermit),
                Cancelled,
            }

            let acquired = tokio::select! {
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => Acquired::Permit(p),
                    Err(_) => Acquired::Cancelled,
                },
                _ = &mut cancel_rx => Acquired::Cancelled,
            };

            let outcome = match acquired {
                Acquired::Permit(_permit) => {
                    match runner.run_operation(spec, inv, cancel_rx).await {
                        Ok(()) => InstanceOutcome::Success,
                        Err(FlowdagError::Cancelled) => InstanceOutcome::Cancelled,
                        Err(err) => InstanceOutcome::Failed(err.to_string()),
                    }
                }
                Acquired::Cancelled => InstanceOutcome::Cancelled,
            };

            let _ = tx
                .send(RunEvent::InstanceCompleted {
                    task,
                    instance,
                    outcome,
                })
                .await;
        });
    }

    /// Spawn a nested recipe run for one instance of a sub-recipe task.
    ///
    /// The inner run executes in an isolated namespace through the same
    /// engine; its report is folded into this one instance's outcome with
    /// the failing inner task's identity preserved.
    fn spawn_sub_run(&mut self, inner: &Recipe, inv: ResolvedInvocation) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        self.cancel_handles
            .insert((inv.task.clone(), inv.instance), cancel_tx);

        let child_recipe = Arc::new(inner.clone());
        let fs = Arc::clone(&self.fs);
        let runner = Arc::clone(&self.runner);
        let tx = self.event_tx.clone();

        tokio::spawn(async move {
            let task = inv.task.clone();
            let instance = inv.instance;

            let mut child_inputs = BTreeMap::new();
            for (name, value) in inv.inputs {
                match value.into_single(&task, &name) {
                    Ok(v) => {
                        child_inputs.insert(name, v);
                    }
                    Err(err) => {
                        let _ = tx
                            .send(RunEvent::SubRunFinished {
                                task,
                                instance,
                                outputs: BTreeMap::new(),
                                outcome: InstanceOutcome::Failed(err.to_string()),
                            })
                            .await;
                        return;
                    }
                }
            }

            // Apply the inner recipe's defaults and input constraints.
            let child_inputs = match child_recipe.resolve_input_values(&child_inputs) {
                Ok(values) => values,
                Err(err) => {
                    let _ = tx
                        .send(RunEvent::SubRunFinished {
                            task,
                            instance,
                            outputs: BTreeMap::new(),
                            outcome: InstanceOutcome::Failed(err.to_string()),
                        })
                        .await;
                    return;
                }
            };

            let child = match Runtime::new(
                child_recipe,
                child_inputs,
                inv.work_dir,
                fs,
                runner,
                RunOptions::default(),
            ) {
                Ok(child) => child,
                Err(err) => {
                    let _ = tx
                        .send(RunEvent::SubRunFinished {
                            task,
                            instance,
                            outputs: BTreeMap::new(),
                            outcome: InstanceOutcome::Failed(err.to_string()),
                        })
                        .await;
                    return;
                }
            };

            let handle = child.handle();
            let mut child_fut = child.run_boxed();

            let result = tokio::select! {
                res = &mut child_fut => res,
                _ = &mut cancel_rx => {
                    handle.cancel().await;
                    child_fut.await
                }
            };

            let (outputs, outcome) = match result {
                Ok(report) => {
                    let outputs: BTreeMap<String, ArtifactValue> = report
                        .outputs
                        .iter()
                        .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
                        .collect();
                    let outcome = match report.status {
                        RunStatus::Succeeded => InstanceOutcome::Success,
                        RunStatus::Cancelled | RunStatus::TimedOut => InstanceOutcome::Cancelled,
                        RunStatus::Failed => {
                            let detail = report
                                .first_failure()
                                .map(|(name, failure)| {
                                    format!("inner task '{name}' failed: {failure}")
                                })
                                .unwrap_or_else(|| "inner run failed".to_string());
                            InstanceOutcome::Failed(detail)
                        }
                    };
                    (outputs, outcome)
                }
                Err(err) => (BTreeMap::new(), InstanceOutcome::Failed(err.to_string())),
            };

            let _ = tx
                .send(RunEvent::SubRunFinished {
                    task,
                    instance,
                    outputs,
                    outcome,
                })
                .await;
        });
    }

    /// Boxed form of [`run`](Self::run), used for the recursive sub-run
    /// spawn so the future type stays finite.
    fn run_boxed(self) -> Pin<Box<dyn Future<Output = Result<RunReport>> + Send>> {
        Box::pin(self.run())
    }

    fn record_sub_run_outputs(&mut self, task: &str, outputs: BTreeMap<String, ArtifactValue>) {
        let fan_out = self
            .recipe
            .task(task)
            .map(TaskDescriptor::is_fan_out)
            .unwrap_or(false);
        for (output, value) in outputs {
            if fan_out {
                self.artifacts.extend_collection(task, &output, value);
            } else {
                self.artifacts.record_value(task, &output, value);
            }
        }
    }

    fn build_report(&self, status: RunStatus) -> RunReport {
        let tasks: BTreeMap<TaskName, TaskRecord> = self
            .core
            .scheduler()
            .task_records()
            .map(|record| {
                (
                    record.name.clone(),
                    TaskRecord {
                        name: record.name.clone(),
                        state: record.state,
                        instances: record.instances,
                        failure: record.failure.clone(),
                    },
                )
            })
            .collect();

        let mut outputs = BTreeMap::new();
        for (name, output_ref) in &self.recipe.outputs {
            let produced = self.core.scheduler().state_of(&output_ref.task)
                == Some(ExecutionState::Succeeded);
            let value = if produced {
                self.artifacts.get(output_ref).cloned()
            } else {
                None
            };
            outputs.insert(name.clone(), value);
        }

        RunReport {
            status,
            tasks,
            outputs,
        }
    }
}
