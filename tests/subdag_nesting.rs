// tests/subdag_nesting.rs

//! Grouped sub-DAG behaviour: a nested recipe runs as a single task of its
//! parent, surfacing only its declared outputs, and reporting inner
//! failures with the inner task's identity preserved.

mod common;
use crate::common::{init_tracing, with_timeout};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use flowdag::engine::{RunOptions, RunReport, RunStatus, Runtime};
use flowdag::errors::FlowdagError;
use flowdag::expand::ArtifactValue;
use flowdag::fs::mock::MockFileSystem;
use flowdag::graph::task::ExecutionState;
use flowdag::recipe::load_and_validate;
use flowdag_test_utils::fake_runner::FakeRunner;

const PARENT: &str = r#"
[recipe]
name = "parent"

[operation.noop]
cmd = "true"

[outputs.product]
source = "inner.outputs.product"

[[task]]
name = "seed"
operation = "noop"
[task.outputs]
data = "seed.txt"

[[task]]
name = "inner"
recipe = "child.toml"
needs = ["seed"]
[task.inputs]
source = "seed.outputs.data"

[[task]]
name = "final"
operation = "noop"
[task.inputs]
result = "inner.outputs.product"
"#;

const CHILD: &str = r#"
[recipe]
name = "child"

[inputs.source]
kind = "str"

[outputs.product]
source = "step_two.outputs.product"

[[task]]
name = "step_one"
operation = "noop"
[task.inputs]
src = "{{inputs.source}}"
[task.outputs]
mid = "mid.txt"

[[task]]
name = "step_two"
operation = "noop"
[task.inputs]
mid = "step_one.outputs.mid"
[task.outputs]
product = "product.txt"
"#;

fn nested_fs() -> Arc<MockFileSystem> {
    let fs = Arc::new(MockFileSystem::new());
    fs.add_file("/recipes/parent.toml", PARENT);
    fs.add_file("/recipes/child.toml", CHILD);
    fs
}

async fn run_parent(fs: Arc<MockFileSystem>, runner: Arc<FakeRunner>) -> RunReport {
    let recipe = load_and_validate(fs.as_ref(), "/recipes/parent.toml").unwrap();
    let runtime = Runtime::new(
        Arc::new(recipe),
        BTreeMap::new(),
        PathBuf::from("/run"),
        fs,
        runner,
        RunOptions::default(),
    )
    .unwrap();
    with_timeout(runtime.run()).await.unwrap()
}

#[tokio::test]
async fn nested_recipe_runs_as_one_task_and_surfaces_outputs() {
    init_tracing();

    let fs = nested_fs();
    let runner = Arc::new(FakeRunner::new(fs.clone()));

    let report = run_parent(fs, runner.clone()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    // The parent report shows the nested recipe as a single task; inner
    // task names do not leak into it.
    assert_eq!(report.tasks.len(), 3);
    assert_eq!(report.tasks["inner"].state, ExecutionState::Succeeded);
    assert!(!report.tasks.contains_key("step_one"));

    // Inner tasks did run, in dependency order, through the same runner.
    assert_eq!(
        runner.executed(),
        vec![
            "seed".to_string(),
            "step_one".to_string(),
            "step_two".to_string(),
            "final".to_string()
        ]
    );

    // The inner recipe's exposed output surfaced, scoped under the child's
    // working directory.
    assert_eq!(
        report.outputs["product"],
        Some(ArtifactValue::Path(PathBuf::from("/run/inner/product.txt")))
    );

    // The child saw its `source` input as the parent's resolved path.
    let invs = runner.invocations();
    let step_one = invs.iter().find(|i| i.task == "step_one").unwrap();
    assert_eq!(
        step_one.inputs["src"],
        flowdag::graph::task::ResolvedValue::Single("/run/seed.txt".to_string())
    );
}

#[tokio::test]
async fn inner_failure_is_reported_with_the_inner_task_identity() {
    init_tracing();

    let fs = nested_fs();
    let runner = Arc::new(FakeRunner::new(fs.clone()));
    runner.fail_task("step_two");

    let report = run_parent(fs, runner.clone()).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.tasks["inner"].state, ExecutionState::Failed);
    assert_eq!(report.tasks["final"].state, ExecutionState::Skipped);
    assert_eq!(report.outputs["product"], None);

    let failure = report.tasks["inner"].failure.as_deref().unwrap();
    assert!(
        failure.contains("step_two"),
        "inner task identity missing from: {failure}"
    );
    assert!(failure.contains("configured to fail"), "got: {failure}");
}

#[tokio::test]
async fn recursive_recipe_inclusion_is_rejected() {
    init_tracing();

    let fs = Arc::new(MockFileSystem::new());
    fs.add_file(
        "/recipes/loop.toml",
        r#"
[recipe]
name = "loop"

[operation.noop]
cmd = "true"

[[task]]
name = "again"
recipe = "loop.toml"
"#,
    );

    let err = load_and_validate(fs.as_ref(), "/recipes/loop.toml").unwrap_err();
    assert!(matches!(err, FlowdagError::Recipe(_)));
    assert!(err.to_string().contains("recursive"));
}

#[tokio::test]
async fn binding_an_undeclared_inner_input_is_rejected() {
    init_tracing();

    let fs = Arc::new(MockFileSystem::new());
    fs.add_file(
        "/recipes/parent.toml",
        r#"
[recipe]
name = "parent"

[operation.noop]
cmd = "true"

[[task]]
name = "seed"
operation = "noop"
[task.outputs]
data = "seed.txt"

[[task]]
name = "inner"
recipe = "child.toml"
[task.inputs]
not_declared = "seed.outputs.data"
"#,
    );
    fs.add_file(
        "/recipes/child.toml",
        r#"
[recipe]
name = "child"

[[task]]
name = "only"
operation = "noop"
"#,
    );

    let err = load_and_validate(fs.as_ref(), "/recipes/parent.toml").unwrap_err();
    assert!(matches!(err, FlowdagError::Recipe(_)));
    assert!(err.to_string().contains("not_declared"));
}
