// tests/runtime_fake_runner.rs

//! Full-engine runs against a fake operation runner and an in-memory
//! filesystem: ordering, fan-out expansion, and output handoff.

mod common;
use crate::common::{init_tracing, with_timeout};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use flowdag::engine::{RunOptions, RunReport, RunStatus, Runtime};
use flowdag::expand::ArtifactValue;
use flowdag::fs::mock::MockFileSystem;
use flowdag::graph::task::{ExecutionState, ResolvedValue};
use flowdag::recipe::Recipe;
use flowdag_test_utils::builders::{RecipeBuilder, TaskBuilder};
use flowdag_test_utils::fake_runner::FakeRunner;

const GRID_ITEMS: &str = r#"[
    {"identifier": "g1", "count": 100},
    {"identifier": "g2", "count": 250},
    {"identifier": "g3", "count": 75}
]"#;

async fn run_to_report(recipe: Recipe, runner: Arc<FakeRunner>, fs: Arc<MockFileSystem>) -> RunReport {
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

fn fan_out_recipe() -> Recipe {
    RecipeBuilder::new("fan-out")
        .with_operation("split", "true")
        .with_operation("raytrace", "true")
        .with_operation("merge", "true")
        .with_task(
            TaskBuilder::new("produce_grids", "split")
                .output("grid_list", "grids/_info.json")
                .build(),
        )
        .with_task(
            TaskBuilder::new("per_grid", "raytrace")
                .needs("produce_grids")
                .loop_over("produce_grids.outputs.grid_list")
                .sub_folder("results/{{item.identifier}}")
                .input("grid_name", "{{item.identifier}}")
                .input("sensor_count", "{{item.count}}")
                .output("irradiance", "{{item.identifier}}.ill")
                .build(),
        )
        .with_task(
            TaskBuilder::new("merge", "merge")
                .input("files", "per_grid.outputs.irradiance")
                .output("merged", "merged.csv")
                .build(),
        )
        .with_output("merged", "merge.outputs.merged")
        .build()
}

#[tokio::test]
async fn simple_chain_runs_in_order() {
    init_tracing();

    let recipe = RecipeBuilder::new("chain")
        .with_operation("noop", "true")
        .with_task(TaskBuilder::new("a", "noop").output("out", "a.txt").build())
        .with_task(
            TaskBuilder::new("b", "noop")
                .input("from_a", "a.outputs.out")
                .build(),
        )
        .build();

    let fs = Arc::new(MockFileSystem::new());
    let runner = Arc::new(FakeRunner::new(fs.clone()));

    let report = run_to_report(recipe, runner.clone(), fs).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(runner.executed(), vec!["a".to_string(), "b".to_string()]);

    // b's input resolved to a's recorded output path.
    let invs = runner.invocations();
    assert_eq!(
        invs[1].inputs["from_a"],
        ResolvedValue::Single("/run/a.txt".to_string())
    );
}

#[tokio::test]
async fn fan_out_expands_one_instance_per_item() {
    init_tracing();

    let fs = Arc::new(MockFileSystem::new());
    let runner = Arc::new(FakeRunner::new(fs.clone()));
    runner.set_output("produce_grids", "grid_list", GRID_ITEMS);

    let report = run_to_report(fan_out_recipe(), runner.clone(), fs).await;
    assert_eq!(report.status, RunStatus::Succeeded);

    // One producer, three fan-out instances, one merge; producer strictly
    // first, merge strictly last.
    let executed = runner.executed();
    assert_eq!(executed.len(), 5);
    assert_eq!(executed[0], "produce_grids");
    assert_eq!(executed[4], "merge");
    assert_eq!(
        executed[1..4].iter().filter(|t| *t == "per_grid").count(),
        3
    );

    // Each instance got its item substituted into paths and inputs.
    let invs = runner.invocations();
    let per_grid: Vec<_> = invs.iter().filter(|i| i.task == "per_grid").collect();
    let mut outputs: Vec<String> = per_grid
        .iter()
        .map(|i| i.outputs["irradiance"].to_string_lossy().into_owned())
        .collect();
    outputs.sort();
    assert_eq!(
        outputs,
        vec![
            "/run/results/g1/g1.ill",
            "/run/results/g2/g2.ill",
            "/run/results/g3/g3.ill"
        ]
    );
    let counts: Vec<&ResolvedValue> = per_grid.iter().map(|i| &i.inputs["sensor_count"]).collect();
    assert!(counts.contains(&&ResolvedValue::Single("250".to_string())));

    // merge received the full collection.
    let merge = invs.iter().find(|i| i.task == "merge").unwrap();
    match &merge.inputs["files"] {
        ResolvedValue::List(files) => assert_eq!(files.len(), 3),
        other => panic!("expected list, got {other:?}"),
    }

    assert_eq!(report.tasks["per_grid"].instances, 3);
}

#[tokio::test]
async fn empty_fan_out_succeeds_and_passes_an_empty_collection() {
    init_tracing();

    let fs = Arc::new(MockFileSystem::new());
    let runner = Arc::new(FakeRunner::new(fs.clone()));
    runner.set_output("produce_grids", "grid_list", "[]");

    let report = run_to_report(fan_out_recipe(), runner.clone(), fs).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.tasks["per_grid"].state, ExecutionState::Succeeded);
    assert_eq!(report.tasks["per_grid"].instances, 0);

    // merge still ran, with an empty collection.
    let invs = runner.invocations();
    let merge = invs.iter().find(|i| i.task == "merge").unwrap();
    assert_eq!(merge.inputs["files"], ResolvedValue::List(vec![]));
}

#[tokio::test]
async fn exposed_outputs_resolve_in_the_report() {
    init_tracing();

    let fs = Arc::new(MockFileSystem::new());
    let runner = Arc::new(FakeRunner::new(fs.clone()));
    runner.set_output("produce_grids", "grid_list", GRID_ITEMS);

    let report = run_to_report(fan_out_recipe(), runner.clone(), fs).await;

    assert_eq!(
        report.outputs["merged"],
        Some(ArtifactValue::Path(PathBuf::from("/run/merged.csv")))
    );
}

#[tokio::test]
async fn parallel_branches_both_run_without_mutual_ordering() {
    init_tracing();

    let recipe = RecipeBuilder::new("branches")
        .with_operation("noop", "true")
        .with_task(TaskBuilder::new("prepare", "noop").build())
        .with_task(TaskBuilder::new("left", "noop").needs("prepare").build())
        .with_task(TaskBuilder::new("right", "noop").needs("prepare").build())
        .with_task(
            TaskBuilder::new("join", "noop")
                .needs("left")
                .needs("right")
                .build(),
        )
        .build();

    let fs = Arc::new(MockFileSystem::new());
    let runner = Arc::new(FakeRunner::new(fs.clone()));

    let report = run_to_report(recipe, runner.clone(), fs).await;
    assert_eq!(report.status, RunStatus::Succeeded);

    let executed = runner.executed();
    assert_eq!(executed[0], "prepare");
    assert_eq!(executed[3], "join");
    let middle: std::collections::HashSet<&str> =
        executed[1..3].iter().map(|s| s.as_str()).collect();
    assert_eq!(middle, ["left", "right"].into_iter().collect());
}
