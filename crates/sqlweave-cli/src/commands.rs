//! `sqlweave` subcommands

use crate::project::{Project, Selector};
use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use sqlweave_core::{DiagnosticCode, Materialization};
use sqlweave_graph::{compile_project, CompileOptions, Graph, GraphError, Scheduler};
use sqlweave_jinja::{BuildOptions, Compiler, File, FileKind};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Turn a graph or template failure into a top-level error that names its
/// diagnostic code
fn report(err: GraphError) -> anyhow::Error {
    let code = err.to_diagnostic().code;
    anyhow::Error::new(err).context(format!("compilation failed [{}]", code))
}

fn compile(project: &Project, scheduler: &Scheduler, options: BuildOptions) -> Result<Compiler> {
    let compiler = Compiler::new(project.files.clone(), project.config.clone(), options);
    compile_project(&compiler, scheduler, CompileOptions::default()).map_err(report)?;
    Ok(compiler)
}

fn write_sql(dir: &Path, name: &str, sql: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.sql", name));
    std::fs::write(&path, sql).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn compiled_text(file: &File) -> Result<String> {
    file.compiled()
        .ok_or_else(|| anyhow!("`{}` has not been compiled", file.name()))
}

/// Compile the project and write the selected units to `target/compiled/`
pub fn compile_command(
    project: &Project,
    selector: &Selector,
    threads: usize,
) -> Result<Vec<PathBuf>> {
    let scheduler = Scheduler::new(threads);
    compile(project, &scheduler, BuildOptions::default())?;
    let graph = selector.graph(&project.files).map_err(report)?;

    let out = project.target_dir("compiled");
    let mut written = Vec::new();
    for node in graph.nodes() {
        let path = write_sql(&out, node.name(), &compiled_text(node.file())?)?;
        tracing::debug!(unit = node.name(), path = %path.display(), "wrote compiled sql");
        written.push(path);
    }

    println!(
        "{} {} units into {}",
        "Compiled".green().bold(),
        written.len(),
        out.display()
    );
    Ok(written)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub full_refresh: bool,
    /// Read unselected units from the `[upstream]` target
    pub upstream: bool,
}

/// Compile, then materialise every selected unit in dependency order
/// under `target/run/`
pub fn run_command(
    project: &Project,
    selector: &Selector,
    threads: usize,
    options: RunOptions,
) -> Result<usize> {
    let scheduler = Scheduler::new(threads);
    let build = BuildOptions {
        full_refresh: options.full_refresh,
    };
    let compiler = compile(project, &scheduler, build)?;
    let graph = selector.graph(&project.files).map_err(report)?;

    if options.upstream {
        if project.config.upstream.is_none() {
            tracing::warn!("--upstream given but no [upstream] target is configured");
        }
        let selected: BTreeSet<String> = graph.names().map(str::to_string).collect();
        compiler.set_selection(Some(selected));
        // relation names changed: compile everything again
        compile_project(&compiler, &scheduler, CompileOptions { force: true }).map_err(report)?;
    }

    let out = project.target_dir("run");
    let executed = scheduler.execute(&graph, |file| {
        let path = materialize(&compiler, file, options.full_refresh)
            .and_then(|sql| write_sql(&out, file.name(), &sql))
            .with_context(|| {
                let code = DiagnosticCode::ExecutionFailed;
                format!("running `{}` failed [{}]", file.name(), code)
            })?;
        tracing::debug!(unit = file.name(), path = %path.display(), "materialized");
        println!("{} {}", "OK".green().bold(), compiler.global().relation_name(file));
        Ok::<_, anyhow::Error>(())
    })?;

    println!(
        "{} {} of {} units",
        "Finished".green().bold(),
        executed,
        graph.len()
    );
    Ok(executed)
}

/// The statement that builds `file` with its materialization
pub fn materialize(compiler: &Compiler, file: &Arc<File>, full_refresh: bool) -> Result<String> {
    let sql = compiled_text(file)?;
    if file.kind() == FileKind::Test {
        return Ok(sql);
    }

    let relation = compiler.global().relation_name(file);
    let statement = match compiler.files().materialization(file) {
        Materialization::View => format!("CREATE OR REPLACE VIEW {} AS\n{}", relation, sql),
        Materialization::Incremental if !full_refresh => {
            format!("INSERT INTO {}\n{}", relation, sql)
        }
        Materialization::Table | Materialization::Incremental => {
            format!("CREATE OR REPLACE TABLE {} AS\n{}", relation, sql)
        }
        Materialization::Ephemeral => sql,
    };
    Ok(statement)
}

/// Print the compiled SQL of one unit
pub fn show_command(project: &Project, name: &str, threads: usize) -> Result<String> {
    let compiler = compile(project, &Scheduler::new(threads), BuildOptions::default())?;
    let file = compiler
        .files()
        .unit(name)
        .ok_or_else(|| anyhow!("no model or test named `{}`", name))?;
    let sql = compiled_text(file)?;
    println!("{}", sql);
    Ok(sql)
}

/// Print the selected units with their upstreams
pub fn graph_command(
    project: &Project,
    selector: &Selector,
    threads: usize,
    json: bool,
) -> Result<String> {
    let compiler = compile(project, &Scheduler::new(threads), BuildOptions::default())?;
    let graph = selector.graph(&project.files).map_err(report)?;

    let rendered = if json {
        serde_json::to_string_pretty(&graph_json(&compiler, &graph))?
    } else {
        graph_text(&compiler, &graph)
    };
    println!("{}", rendered);
    Ok(rendered)
}

fn graph_json(compiler: &Compiler, graph: &Graph) -> serde_json::Value {
    let nodes: Vec<serde_json::Value> = graph
        .nodes()
        .map(|node| {
            let file = node.file();
            serde_json::json!({
                "name": node.name(),
                "kind": file.kind(),
                "path": file.path(),
                "materialized": compiler.files().materialization(file).as_str(),
                "relation": compiler.global().relation_name(file),
                "upstreams": node.upstreams(),
            })
        })
        .collect();
    serde_json::json!({ "nodes": nodes })
}

fn graph_text(compiler: &Compiler, graph: &Graph) -> String {
    let mut lines = Vec::new();
    for node in graph.nodes() {
        let file = node.file();
        let kind = match file.kind() {
            FileKind::Test => "test".to_string(),
            _ => compiler.files().materialization(file).as_str().to_string(),
        };
        let upstreams = if node.upstreams().is_empty() {
            "-".dimmed().to_string()
        } else {
            node.upstreams().join(", ")
        };
        lines.push(format!("{} ({}) <- {}", node.name().bold(), kind.cyan(), upstreams));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::CONFIG_FILE;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, path: &str, contents: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// customers -> stg_orders (ephemeral) -> orders, plus a test on orders
    fn shop() -> TempDir {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(
            root,
            CONFIG_FILE,
            "name = \"shop\"\n\n[target]\nproject = \"dev\"\ndataset = \"shop\"\n\n\
             [upstream]\nproject = \"prod\"\ndataset = \"shop\"\n\n[models]\nmaterialized = \"table\"\n",
        );
        write(root, "macros/money.sql", "{% macro cents(col) %}{{ col }} * 100{% endmacro %}");
        write(root, "models/customers.sql", "select 1 as id");
        write(
            root,
            "models/stg_orders.sql",
            "{{ config(materialized='ephemeral') }}select id, {{ cents('amount') }} as cents from {{ ref('customers') }}",
        );
        write(
            root,
            "models/orders.sql",
            "{{ config(materialized='view') }}select * from {{ ref('stg_orders') }}",
        );
        write(
            root,
            "tests/orders_positive.sql",
            "select * from {{ ref('orders') }} where cents < 0",
        );
        dir
    }

    fn read(path: PathBuf) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn compile_writes_selected_units() {
        let dir = shop();
        let project = Project::load(dir.path(), None).unwrap();

        let written = compile_command(&project, &"orders".parse().unwrap(), 2).unwrap();
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["orders.sql", "orders_positive.sql"]);

        assert_eq!(
            read(project.target_dir("compiled").join("orders.sql")),
            "WITH __sqlweave_ephemeral_stg_orders AS (\n\
             select id, amount * 100 as cents from dev.shop.customers\n\
             )\n\
             select * from __sqlweave_ephemeral_stg_orders"
        );
    }

    #[test]
    fn run_materialises_in_dependency_order() {
        let dir = shop();
        let project = Project::load(dir.path(), None).unwrap();

        let executed = run_command(&project, &Selector::All, 2, RunOptions::default()).unwrap();
        assert_eq!(executed, 3);

        let run = project.target_dir("run");
        assert_eq!(
            read(run.join("customers.sql")),
            "CREATE OR REPLACE TABLE dev.shop.customers AS\nselect 1 as id"
        );
        let orders = read(run.join("orders.sql"));
        assert!(orders.starts_with("CREATE OR REPLACE VIEW dev.shop.orders AS\nWITH "));
        assert!(!run.join("stg_orders.sql").exists());
    }

    #[test]
    fn run_with_upstream_reads_unselected_units_from_upstream_target() {
        let dir = shop();
        let project = Project::load(dir.path(), None).unwrap();
        let options = RunOptions {
            upstream: true,
            ..RunOptions::default()
        };

        let executed = run_command(&project, &"orders".parse().unwrap(), 1, options).unwrap();
        assert_eq!(executed, 2);

        let orders = read(project.target_dir("run").join("orders.sql"));
        assert!(orders.starts_with("CREATE OR REPLACE VIEW dev.shop.orders AS\n"));
        assert!(orders.contains("from prod.shop.customers"));
    }

    #[test]
    fn run_failures_name_their_code() {
        let dir = shop();
        write(dir.path(), "target/run", "not a directory");
        let project = Project::load(dir.path(), None).unwrap();

        let err = run_command(&project, &Selector::All, 2, RunOptions::default()).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("EXECUTION_FAILED"), "{}", message);
        assert!(message.contains("running `customers` failed"), "{}", message);
    }

    #[test]
    fn show_prints_compiled_sql() {
        let dir = shop();
        let project = Project::load(dir.path(), None).unwrap();
        assert_eq!(show_command(&project, "customers", 1).unwrap(), "select 1 as id");
        assert!(show_command(&project, "missing", 1).is_err());
    }

    #[test]
    fn graph_lists_nodes_with_upstreams() {
        let dir = shop();
        let project = Project::load(dir.path(), None).unwrap();

        let text = graph_command(&project, &Selector::All, 1, false).unwrap();
        assert_eq!(
            text,
            "customers (table) <- -\n\
             orders (view) <- customers\n\
             orders_positive (test) <- orders"
        );

        let json = graph_command(&project, &"+orders".parse().unwrap(), 1, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["nodes"][1]["relation"], "dev.shop.orders");
        assert_eq!(value["nodes"][1]["upstreams"][0], "customers");
    }

    #[test]
    fn template_errors_name_their_code() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "models/broken.sql", "select {{ nope() }}");
        let project = Project::load(dir.path(), None).unwrap();

        let err = compile_command(&project, &Selector::All, 1).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("TEMPLATE_EVAL_ERROR"), "{}", message);
        assert!(message.contains("models/broken.sql:1:11"), "{}", message);
    }
}
