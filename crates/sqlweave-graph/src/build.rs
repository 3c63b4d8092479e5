//! Parallel two-pass compile of a whole project
//!
//! Pass one compiles every model and test dry, discovering references and
//! configuration. Pass two recompiles, executing, the units that asked for
//! it (or all of them when forced).

use crate::graph::{Graph, GraphError};
use crate::scheduler::Scheduler;
use sqlweave_jinja::{Compiler, FileKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Recompile every unit in the executing pass
    pub force: bool,
}

/// How many units each pass compiled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileSummary {
    pub dry: usize,
    pub executing: usize,
}

impl CompileSummary {
    pub fn total(&self) -> usize {
        self.dry + self.executing
    }
}

/// Compile every model and test of the compiler's project
pub fn compile_project(
    compiler: &Compiler,
    scheduler: &Scheduler,
    options: CompileOptions,
) -> Result<CompileSummary, GraphError> {
    let mut graph = Graph::new(compiler.files().clone());
    graph.add_all_unordered(FileKind::Model)?;
    graph.add_all_unordered(FileKind::Test)?;

    let dry = scheduler.execute(&graph, |file| compiler.compile(file, false).map(drop))?;
    tracing::info!(units = dry, "dry pass complete");

    compiler.reset_ephemerals();
    if options.force {
        graph.reset_all();
    } else {
        graph.mark_all_done();
        let flagged: Vec<String> = graph
            .nodes()
            .filter(|node| node.file().needs_recompile())
            .map(|node| node.name().to_string())
            .collect();
        for name in &flagged {
            graph.reset(name)?;
        }
    }

    let executing = scheduler.execute(&graph, |file| compiler.compile(file, true).map(drop))?;
    tracing::info!(units = executing, "executing pass complete");

    Ok(CompileSummary { dry, executing })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlweave_core::{Config, ModelDefaults};
    use sqlweave_jinja::{BuildOptions, File, FileSystem};
    use std::sync::Arc;

    fn compiler(units: &[(&str, &str)]) -> Compiler {
        let mut fs = FileSystem::new(ModelDefaults::default());
        for (name, source) in units {
            let path = format!("models/{}.sql", name);
            fs.add(File::new(*name, path, FileKind::Model, *source)).unwrap();
        }
        Compiler::new(Arc::new(fs), Config::default(), BuildOptions::default())
    }

    #[test]
    fn only_referencing_units_are_recompiled() {
        let compiler = compiler(&[
            ("a", "select 1"),
            ("b", "select * from {{ ref('a') }}"),
        ]);

        let summary = compile_project(&compiler, &Scheduler::new(2), CompileOptions::default())
            .unwrap();
        assert_eq!(summary, CompileSummary { dry: 2, executing: 1 });
    }

    #[test]
    fn force_recompiles_everything() {
        let compiler = compiler(&[("a", "select 1"), ("b", "select 2")]);
        let summary =
            compile_project(&compiler, &Scheduler::new(2), CompileOptions { force: true }).unwrap();
        assert_eq!(summary.total(), 4);
    }

    #[test]
    fn incremental_models_get_the_executing_pass() {
        let compiler = compiler(&[(
            "events",
            "{{ config(materialized='incremental') }}\
             select 1{% if is_incremental() %} where new{% endif %}",
        )]);

        let summary = compile_project(&compiler, &Scheduler::new(1), CompileOptions::default())
            .unwrap();
        assert_eq!(summary.executing, 1);

        let events = compiler.files().model("events").unwrap();
        assert_eq!(events.compiled().unwrap(), "select 1 where new");
    }

    #[test]
    fn logging_models_get_the_executing_pass() {
        let compiler = compiler(&[
            ("quiet", "select 1"),
            ("chatty", "{{ log('building chatty') }}{{ exceptions.warn('slow') }}select 2"),
        ]);

        let summary = compile_project(&compiler, &Scheduler::new(2), CompileOptions::default())
            .unwrap();
        assert_eq!(summary, CompileSummary { dry: 2, executing: 1 });

        let chatty = compiler.files().model("chatty").unwrap();
        assert_eq!(chatty.compiled().unwrap(), "select 2");
    }

    #[test]
    fn template_errors_surface() {
        let compiler = compiler(&[("a", "{{ nope() }}")]);
        let err = compile_project(&compiler, &Scheduler::new(1), CompileOptions::default())
            .unwrap_err();
        assert!(matches!(err, GraphError::Template(_)));
    }
}
