// tests/demo_recipe.rs

//! The bundled comfort-map demo recipe: shape checks everywhere, and a
//! full end-to-end run through real processes on unix.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use flowdag::fs::RealFileSystem;
use flowdag::graph::task::Operation;
use flowdag::graph::TaskGraph;
use flowdag::recipe::load_and_validate;

fn demo_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join("utci_comfort_map")
        .join("recipe.toml")
}

#[test]
fn demo_recipe_validates() {
    let fs = RealFileSystem;
    let recipe = load_and_validate(&fs, demo_path()).unwrap();

    assert_eq!(recipe.name, "utci-comfort-map");
    assert_eq!(recipe.tasks.len(), 4);

    // The raytracing stage is a nested recipe fanned out per grid.
    let raytracing = recipe.task("run_raytracing").unwrap();
    assert!(raytracing.is_fan_out());
    match &raytracing.operation {
        Operation::SubRecipe(inner) => {
            assert_eq!(inner.name, "grid-raytracing");
            assert_eq!(inner.tasks.len(), 3);
            // The nested recipe inherited the parent's operation registry.
            assert!(inner.operations.contains_key("raytrace-grid"));
        }
        other => panic!("expected a nested recipe, got {other:?}"),
    }

    let graph = TaskGraph::from_recipe(&recipe).unwrap();
    let order: Vec<&str> = graph.topological_order().collect();
    assert_eq!(
        order,
        vec![
            "prepare_folder",
            "energy_simulation",
            "run_raytracing",
            "run_comfort_map"
        ]
    );
}

#[cfg(unix)]
mod end_to_end {
    use super::*;
    use crate::common::init_tracing;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use flowdag::engine::{RunOptions, RunStatus, Runtime};
    use flowdag::exec::ProcessRunner;
    use flowdag::expand::ArtifactValue;
    use flowdag::fs::FileSystem;
    use flowdag::graph::task::ExecutionState;

    #[tokio::test]
    async fn demo_recipe_runs_through_real_processes() {
        init_tracing();

        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
        let recipe = Arc::new(load_and_validate(fs.as_ref(), demo_path()).unwrap());

        let scratch = tempfile::tempdir().unwrap();
        let model = scratch.path().join("model.hbjson");
        let epw = scratch.path().join("weather.epw");
        std::fs::write(&model, "model-bytes\n").unwrap();
        std::fs::write(&epw, "epw-bytes\n").unwrap();

        let mut inputs = BTreeMap::new();
        inputs.insert(
            "model".to_string(),
            model.to_string_lossy().into_owned(),
        );
        inputs.insert("epw".to_string(), epw.to_string_lossy().into_owned());
        let input_values = recipe.resolve_input_values(&inputs).unwrap();

        let work_dir = scratch.path().join("run");
        let runner = Arc::new(ProcessRunner::new(Arc::clone(&fs)));
        let runtime = Runtime::new(
            Arc::clone(&recipe),
            input_values,
            work_dir.clone(),
            fs,
            runner,
            RunOptions::default(),
        )
        .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(30), runtime.run())
            .await
            .expect("demo run timed out")
            .unwrap();

        assert_eq!(report.status, RunStatus::Succeeded, "{}", report.render());
        assert_eq!(
            report.tasks["run_raytracing"].state,
            ExecutionState::Succeeded
        );
        assert_eq!(report.tasks["run_raytracing"].instances, 2);

        // The exposed output exists and aggregates both grids plus the
        // energy and weather inputs.
        let utci = match &report.outputs["utci"] {
            Some(ArtifactValue::Path(p)) => p.clone(),
            other => panic!("expected a single utci path, got {other:?}"),
        };
        assert_eq!(utci, work_dir.join("results/utci.csv"));
        let contents = std::fs::read_to_string(&utci).unwrap();
        assert!(contents.contains("pts grid_1"), "got: {contents}");
        assert!(contents.contains("pts grid_2"), "got: {contents}");
        assert!(contents.contains("model-bytes"), "got: {contents}");
        assert!(contents.contains("epw-bytes"), "got: {contents}");

        // Each grid's combined matrix landed under its own sub-folder.
        assert!(
            work_dir.join("radiance/grid_1/grid_1.ill").is_file(),
            "per-grid matrix missing"
        );
        assert!(work_dir.join("radiance/grid_2/grid_2.ill").is_file());
    }
}
