// tests/recipe_loader.rs

//! TOML recipe parsing: the full file shape, binding classification, and
//! config defaults.

use std::sync::Arc;

use flowdag::fs::mock::MockFileSystem;
use flowdag::graph::task::{InputBinding, LiteralValue, Operation};
use flowdag::recipe::{load_and_validate, InputKind};

const RECIPE: &str = r#"
[recipe]
name = "radiance-mapping"
version = "1.2.0"

[config]
max_concurrency = 12
deadline_secs = 900

[inputs.model]
kind = "file"
description = "Model file."

[inputs.radiance_parameters]
kind = "str"
default = "-ab 2"

[inputs.sensor_count]
kind = "int"
default = 200
min = 1.0

[outputs.total]
source = "matrix_math.outputs.total"

[operation.raytrace]
cmd = "rtrace {{inputs.parameters}} --out {{outputs.result}}"

[operation.matrix-math]
cmd = "rmtxop {{inputs.matrices}} > {{outputs.total}}"

[[task]]
name = "split_grid"
operation = "raytrace"
[task.inputs]
parameters = "{{inputs.radiance_parameters}}"
count = 500
[task.outputs]
grids = "grids/_info.json"

[[task]]
name = "trace_grids"
operation = "raytrace"
needs = ["split_grid"]
loop = "split_grid.outputs.grids"
sub_folder = "results/{{item.identifier}}"
[task.inputs]
parameters = "{{inputs.radiance_parameters}}"
grid = "split_grid.outputs.grids"
[task.sub_paths]
grid = "{{item.identifier}}.pts"
[task.outputs]
result = "{{item.identifier}}.ill"

[[task]]
name = "matrix_math"
operation = "matrix-math"
[task.inputs]
matrices = "trace_grids.outputs.result"
[task.outputs]
total = "total.ill"
"#;

#[test]
fn full_recipe_file_round_trips_through_the_loader() {
    let fs = Arc::new(MockFileSystem::new());
    fs.add_file("/r/recipe.toml", RECIPE);

    let recipe = load_and_validate(fs.as_ref(), "/r/recipe.toml").unwrap();

    assert_eq!(recipe.name, "radiance-mapping");
    assert_eq!(recipe.version.as_deref(), Some("1.2.0"));
    assert_eq!(recipe.config.max_concurrency, 12);
    assert_eq!(
        recipe.config.deadline,
        Some(std::time::Duration::from_secs(900))
    );

    // Inputs, with kinds and defaults.
    assert_eq!(recipe.inputs["model"].kind, InputKind::File);
    assert_eq!(
        recipe.inputs["radiance_parameters"].default,
        Some(LiteralValue::Str("-ab 2".to_string()))
    );
    assert_eq!(
        recipe.inputs["sensor_count"].default,
        Some(LiteralValue::Int(200))
    );

    // Tasks kept declaration order.
    let names: Vec<&str> = recipe.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["split_grid", "trace_grids", "matrix_math"]);

    // Binding classification: template, literal, reference.
    let split = recipe.task("split_grid").unwrap();
    assert!(matches!(&split.operation, Operation::External(id) if id == "raytrace"));
    assert!(matches!(
        &split.inputs["parameters"],
        InputBinding::Template(t) if t == "{{inputs.radiance_parameters}}"
    ));
    assert_eq!(
        split.inputs["count"],
        InputBinding::Literal(LiteralValue::Int(500))
    );

    let trace = recipe.task("trace_grids").unwrap();
    assert!(trace.is_fan_out());
    let loop_source = trace.loop_source.as_ref().unwrap();
    assert_eq!(loop_source.task, "split_grid");
    assert_eq!(loop_source.output, "grids");
    assert_eq!(trace.sub_folder.as_deref(), Some("results/{{item.identifier}}"));
    assert_eq!(
        trace.sub_paths.get("grid").map(|s| s.as_str()),
        Some("{{item.identifier}}.pts")
    );
    assert!(matches!(
        &trace.inputs["grid"],
        InputBinding::Reference(r) if r.task == "split_grid" && r.output == "grids"
    ));

    // Implicit edges from references show up in the dependency set.
    assert_eq!(
        recipe.task("matrix_math").unwrap().dependency_names(),
        vec!["trace_grids".to_string()]
    );

    // Exposed outputs.
    assert_eq!(recipe.outputs["total"].task, "matrix_math");
    assert_eq!(recipe.outputs["total"].output, "total");
}

#[test]
fn config_section_defaults_apply() {
    let fs = Arc::new(MockFileSystem::new());
    fs.add_file(
        "/r/min.toml",
        r#"
[recipe]
name = "minimal"

[operation.noop]
cmd = "true"

[[task]]
name = "only"
operation = "noop"
"#,
    );

    let recipe = load_and_validate(fs.as_ref(), "/r/min.toml").unwrap();
    assert_eq!(recipe.config.max_concurrency, 8);
    assert_eq!(recipe.config.deadline, None);
    assert!(recipe.outputs.is_empty());
}

#[test]
fn missing_file_is_an_error() {
    let fs = Arc::new(MockFileSystem::new());
    assert!(load_and_validate(fs.as_ref(), "/r/absent.toml").is_err());
}

#[test]
fn malformed_toml_is_an_error() {
    let fs = Arc::new(MockFileSystem::new());
    fs.add_file("/r/bad.toml", "this is not toml [");
    assert!(load_and_validate(fs.as_ref(), "/r/bad.toml").is_err());
}
