//! Integration tests: compile a project, build its graph, run it

use pretty_assertions::assert_eq;
use sqlweave_core::{Config, ModelDefaults};
use sqlweave_graph::{compile_project, CompileOptions, Graph, GraphError, Scheduler};
use sqlweave_jinja::{BuildOptions, Compiler, File, FileKind, FileSystem};
use std::sync::{Arc, Mutex};

fn project(units: &[(&str, FileKind, &str)]) -> Compiler {
    let mut fs = FileSystem::new(ModelDefaults::default());
    for (name, kind, source) in units {
        let dir = match kind {
            FileKind::Model => "models",
            FileKind::Macro => "macros",
            FileKind::Test => "tests",
        };
        fs.add(File::new(*name, format!("{}/{}.sql", dir, name), *kind, *source))
            .unwrap();
    }
    Compiler::new(Arc::new(fs), Config::default(), BuildOptions::default())
}

/// Start/finish events recorded by a run
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(String),
    Finish(String),
}

fn run(graph: &Graph, threads: usize) -> Vec<Event> {
    let events = Mutex::new(Vec::new());
    Scheduler::new(threads)
        .execute(graph, |file| {
            events.lock().unwrap().push(Event::Start(file.name().to_string()));
            std::thread::sleep(std::time::Duration::from_millis(5));
            events.lock().unwrap().push(Event::Finish(file.name().to_string()));
            Ok::<_, String>(())
        })
        .unwrap();
    events.into_inner().unwrap()
}

fn position(events: &[Event], event: Event) -> usize {
    events.iter().position(|e| *e == event).unwrap()
}

#[test]
fn test_chain_executes_in_dependency_order() {
    let compiler = project(&[
        ("a", FileKind::Model, "select 1 as id"),
        ("b", FileKind::Model, "select * from {{ ref('a') }}"),
        ("c", FileKind::Model, "select * from {{ ref('b') }}"),
    ]);
    compile_project(&compiler, &Scheduler::new(4), CompileOptions::default()).unwrap();

    let mut graph = Graph::new(compiler.files().clone());
    graph.add_all(FileKind::Model).unwrap();

    for _ in 0..5 {
        graph.reset_all();
        let events = run(&graph, 4);
        assert_eq!(events.len(), 6);
        let finished = |name: &str| position(&events, Event::Finish(name.into()));
        let started = |name: &str| position(&events, Event::Start(name.into()));
        assert!(finished("a") < started("b"));
        assert!(finished("b") < started("c"));
    }
}

#[test]
fn test_independent_branches_all_run() {
    let compiler = project(&[
        ("left", FileKind::Model, "select 1"),
        ("right", FileKind::Model, "select 2"),
        ("joined", FileKind::Model, "select * from {{ ref('left') }}, {{ ref('right') }}"),
    ]);
    compile_project(&compiler, &Scheduler::new(2), CompileOptions::default()).unwrap();

    let mut graph = Graph::new(compiler.files().clone());
    graph.add_all(FileKind::Model).unwrap();
    assert_eq!(
        graph.node("joined").unwrap().upstreams(),
        ["left".to_string(), "right".to_string()]
    );

    let events = run(&graph, 2);
    let joined = position(&events, Event::Start("joined".into()));
    assert!(position(&events, Event::Finish("left".into())) < joined);
    assert!(position(&events, Event::Finish("right".into())) < joined);
}

#[test]
fn test_reference_cycle_rejected_before_execution() {
    let compiler = project(&[
        ("a", FileKind::Model, "select * from {{ ref('b') }}"),
        ("b", FileKind::Model, "select * from {{ ref('a') }}"),
    ]);
    compile_project(&compiler, &Scheduler::new(2), CompileOptions::default()).unwrap();

    let mut graph = Graph::new(compiler.files().clone());
    let err = graph.add_all(FileKind::Model).unwrap_err();
    assert!(matches!(err, GraphError::Cycle { .. }));
    assert_eq!(err.to_diagnostic().code.as_str(), "DEPENDENCY_CYCLE");
}

#[test]
fn test_ephemeral_is_not_a_node() {
    let compiler = project(&[
        ("raw_orders", FileKind::Model, "{{ config(materialized='table') }}select 1 as id"),
        (
            "stg_orders",
            FileKind::Model,
            "{{ config(materialized='ephemeral') }}select id from {{ ref('raw_orders') }}",
        ),
        ("orders", FileKind::Model, "select * from {{ ref('stg_orders') }}"),
    ]);
    compile_project(&compiler, &Scheduler::new(3), CompileOptions::default()).unwrap();

    let mut graph = Graph::new(compiler.files().clone());
    graph.add_all(FileKind::Model).unwrap();

    let names: Vec<&str> = graph.names().collect();
    assert_eq!(names, vec!["orders", "raw_orders"]);
    assert_eq!(graph.node("orders").unwrap().upstreams(), ["raw_orders".to_string()]);

    let orders = compiler.files().model("orders").unwrap().compiled().unwrap();
    assert_eq!(
        orders,
        "WITH __sqlweave_ephemeral_stg_orders AS (\n\
         select id from default.default.raw_orders\n\
         )\n\
         select * from __sqlweave_ephemeral_stg_orders"
    );
}

#[test]
fn test_selection_with_referencing_tests() {
    let compiler = project(&[
        ("customers", FileKind::Model, "{{ config(tags=['crm']) }}select 1 as id"),
        ("orders", FileKind::Model, "select * from {{ ref('customers') }}"),
        (
            "revenue",
            FileKind::Model,
            "{{ config(tags=['finance']) }}select * from {{ ref('orders') }}",
        ),
        (
            "orders_not_empty",
            FileKind::Test,
            "select 1 where not exists (select * from {{ ref('orders') }})",
        ),
    ]);
    compile_project(&compiler, &Scheduler::new(2), CompileOptions::default()).unwrap();

    let mut upstream = Graph::new(compiler.files().clone());
    upstream.add_node_with_upstreams("orders").unwrap();
    upstream.add_referencing_tests().unwrap();
    let names: Vec<&str> = upstream.names().collect();
    assert_eq!(names, vec!["customers", "orders", "orders_not_empty"]);

    let mut downstream = Graph::new(compiler.files().clone());
    downstream.add_node_with_downstreams("customers").unwrap();
    let names: Vec<&str> = downstream.names().collect();
    assert_eq!(names, vec!["customers", "orders", "orders_not_empty", "revenue"]);

    let mut tagged = Graph::new(compiler.files().clone());
    tagged.add_tagged("finance").unwrap();
    let names: Vec<&str> = tagged.names().collect();
    assert_eq!(names, vec!["revenue"]);
}

#[test]
fn test_failed_unit_blocks_downstreams() {
    let compiler = project(&[
        ("a", FileKind::Model, "select 1"),
        ("b", FileKind::Model, "select * from {{ ref('a') }}"),
    ]);
    compile_project(&compiler, &Scheduler::new(2), CompileOptions::default()).unwrap();

    let mut graph = Graph::new(compiler.files().clone());
    graph.add_all(FileKind::Model).unwrap();

    let ran = Mutex::new(Vec::new());
    let err = Scheduler::new(2)
        .execute(&graph, |file| {
            ran.lock().unwrap().push(file.name().to_string());
            if file.name() == "a" {
                return Err(format!("warehouse rejected `{}`", file.name()));
            }
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err, "warehouse rejected `a`");
    assert_eq!(ran.into_inner().unwrap(), vec!["a"]);
}

#[test]
fn test_parallel_compile_matches_sequential_output() {
    let units: Vec<(String, FileKind, String)> = (0..20)
        .map(|i| {
            let source = if i == 0 {
                "{{ config(materialized='ephemeral') }}select 1 as id".to_string()
            } else {
                format!("select {} as n from {{{{ ref('m0') }}}}", i)
            };
            (format!("m{}", i), FileKind::Model, source)
        })
        .collect();
    let borrowed: Vec<(&str, FileKind, &str)> = units
        .iter()
        .map(|(name, kind, source)| (name.as_str(), *kind, source.as_str()))
        .collect();

    let compiler = project(&borrowed);
    let summary =
        compile_project(&compiler, &Scheduler::new(8), CompileOptions::default()).unwrap();
    assert_eq!(summary.dry, 20);
    assert_eq!(summary.executing, 19);

    for i in 1..20 {
        let sql = compiler
            .files()
            .model(&format!("m{}", i))
            .unwrap()
            .compiled()
            .unwrap();
        assert_eq!(
            sql,
            format!(
                "WITH __sqlweave_ephemeral_m0 AS (\nselect 1 as id\n)\n\
                 select {} as n from __sqlweave_ephemeral_m0",
                i
            )
        );
    }
}

#[test]
fn test_compile_error_is_reported_with_position() {
    let compiler = project(&[("broken", FileKind::Model, "select\n  {{ ref('missing') }}")]);
    let err =
        compile_project(&compiler, &Scheduler::new(1), CompileOptions::default()).unwrap_err();
    assert!(err.to_string().contains("models/broken.sql:2:6"), "{}", err);
}
