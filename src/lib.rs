// src/lib.rs

pub mod cli;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod expand;
pub mod fs;
pub mod graph;
pub mod logging;
pub mod recipe;
pub mod template;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tracing::info;

use crate::cli::CliArgs;
use crate::engine::{RunOptions, RunStatus, Runtime};
use crate::exec::ProcessRunner;
use crate::fs::{FileSystem, RealFileSystem};
use crate::graph::task::Operation;
use crate::recipe::model::InputKind;
use crate::recipe::{load_and_validate, Recipe};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - recipe loading and validation
/// - input resolution from `--input name=value` flags
/// - the runtime + process runner
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let recipe_path = PathBuf::from(&args.recipe);
    let recipe = load_and_validate(fs.as_ref(), &recipe_path)?;

    if args.dry_run {
        print_dry_run(&recipe);
        return Ok(());
    }

    let supplied = parse_input_args(&args.inputs)?;
    let mut input_values = recipe.resolve_input_values(&supplied)?;
    absolutize_path_inputs(&recipe, &mut input_values)?;

    let options = RunOptions {
        max_concurrency: args.max_concurrency,
        deadline: args.deadline_secs.map(Duration::from_secs),
    };

    let runner = Arc::new(ProcessRunner::new(Arc::clone(&fs)));
    let work_dir = PathBuf::from(&args.work_dir);
    let runtime = Runtime::new(
        Arc::new(recipe),
        input_values,
        work_dir,
        fs,
        runner,
        options,
    )?;

    // Ctrl-C -> graceful cancellation.
    {
        let handle = runtime.handle();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            handle.cancel().await;
        });
    }

    let report = runtime.run().await?;
    print!("{}", report.render());

    match report.status {
        RunStatus::Succeeded => Ok(()),
        status => bail!("run {status}"),
    }
}

/// Parse repeated `--input name=value` flags.
fn parse_input_args(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut supplied = BTreeMap::new();
    for entry in raw {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("--input '{entry}' is not of the form name=value"))?;
        if supplied.insert(name.to_string(), value.to_string()).is_some() {
            bail!("--input '{name}' supplied more than once");
        }
    }
    Ok(supplied)
}

/// Resolve file/folder input values to absolute paths so that operations
/// running in per-instance working directories still find them.
fn absolutize_path_inputs(
    recipe: &Recipe,
    values: &mut BTreeMap<String, String>,
) -> Result<()> {
    for (name, spec) in &recipe.inputs {
        if !matches!(spec.kind, InputKind::File | InputKind::Folder) {
            continue;
        }
        if let Some(value) = values.get_mut(name) {
            let absolute = std::path::absolute(PathBuf::from(value.as_str()))?;
            *value = absolute.to_string_lossy().into_owned();
        }
    }
    Ok(())
}

/// Simple dry-run output: print the plan in topological order.
fn print_dry_run(recipe: &Recipe) {
    println!("flowdag dry-run");
    println!("  recipe: {}", recipe.name);
    if let Some(version) = &recipe.version {
        println!("  version: {version}");
    }
    println!("  max_concurrency: {}", recipe.config.max_concurrency);
    if let Some(deadline) = recipe.config.deadline {
        println!("  deadline: {}s", deadline.as_secs());
    }
    println!();

    let graph = match graph::TaskGraph::from_recipe(recipe) {
        Ok(graph) => graph,
        // The recipe was validated at load time, so this is unreachable in
        // practice; print nothing rather than panic.
        Err(err) => {
            eprintln!("invalid graph: {err}");
            return;
        }
    };

    println!("plan ({} tasks):", recipe.tasks.len());
    for name in graph.topological_order() {
        let Some(task) = recipe.task(name) else {
            continue;
        };
        println!("  - {name}");
        match &task.operation {
            Operation::External(id) => println!("      operation: {id}"),
            Operation::SubRecipe(inner) => {
                println!("      recipe: {} ({} tasks)", inner.name, inner.tasks.len())
            }
        }
        let deps = task.dependency_names();
        if !deps.is_empty() {
            println!("      needs: {deps:?}");
        }
        if let Some(loop_ref) = &task.loop_source {
            println!("      loop: {loop_ref}");
        }
        if let Some(sub_folder) = &task.sub_folder {
            println!("      sub_folder: {sub_folder}");
        }
    }

    if !recipe.outputs.is_empty() {
        println!("outputs:");
        for (name, source) in &recipe.outputs {
            println!("  - {name} <- {source}");
        }
    }

    info!("dry-run complete (no execution)");
}
