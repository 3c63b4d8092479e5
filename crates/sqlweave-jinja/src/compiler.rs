//! Unit compilation
//!
//! A build compiles every unit twice at most. The dry pass
//! (`is_executing == false`) discovers references and configuration without
//! knowing what the referenced units are; units that referenced anything are
//! flagged and compiled again in the executing pass, where `ref` knows each
//! target's materialization and can inline ephemeral units as CTEs.

use crate::context::{BuildOptions, ExecutionContext, GlobalContext};
use crate::error::{Position, Result, TemplateError};
use crate::eval;
use crate::fs::{File, FileKind, FileSystem};
use crate::value::Value;
use sqlweave_core::{Config, Materialization};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Name prefix of the CTE an ephemeral unit is inlined as
pub const EPHEMERAL_PREFIX: &str = "__sqlweave_ephemeral_";

const EPHEMERAL_KEY: &str = "ephemeral:";

/// Compiles the units of one project for one build
pub struct Compiler {
    global: Arc<GlobalContext>,
}

impl Compiler {
    pub fn new(files: Arc<FileSystem>, config: Config, options: BuildOptions) -> Self {
        Self {
            global: GlobalContext::new(files, config, options),
        }
    }

    pub fn global(&self) -> &Arc<GlobalContext> {
        &self.global
    }

    pub fn files(&self) -> &Arc<FileSystem> {
        self.global.files()
    }

    pub fn config(&self) -> &Config {
        self.global.config()
    }

    /// See [`GlobalContext::set_selection`]
    pub fn set_selection(&self, names: Option<BTreeSet<String>>) {
        self.global.set_selection(names);
    }

    /// Compile one unit. In the executing pass an ephemeral unit is
    /// compiled at most once, however many units reference it.
    pub fn compile(&self, file: &Arc<File>, executing: bool) -> Result<String> {
        if executing && self.files().materialization(file) == Materialization::Ephemeral {
            return compile_ephemeral(&self.global, file);
        }
        compile_file(&self.global, file, executing)
    }

    /// Start a new executing pass: ephemeral units compile afresh
    pub fn reset_ephemerals(&self) {
        self.global.forget_resolutions(EPHEMERAL_KEY);
    }
}

impl Drop for Compiler {
    fn drop(&mut self) {
        // registered macros hold their defining scopes, which hold the global
        self.global.clear_macros();
    }
}

/// Interpret a unit and store its compiled text
pub(crate) fn compile_file(
    global: &Arc<GlobalContext>,
    file: &Arc<File>,
    executing: bool,
) -> Result<String> {
    let body = file.syntax_tree()?;
    file.begin_compile();

    let ctx = ExecutionContext::root(global.clone(), Some(file.clone()), executing);
    let text = eval::render(&body, &ctx)?;
    let compiled = with_ctes(&text, &file.ctes());

    tracing::debug!(unit = file.name(), executing, "compiled");
    file.finish_compile(compiled.clone(), executing);
    Ok(compiled)
}

fn compile_ephemeral(global: &Arc<GlobalContext>, file: &Arc<File>) -> Result<String> {
    let key = format!("{}{}", EPHEMERAL_KEY, file.name());
    global.resolve_once(&key, file.name(), || {
        compile_file(global, file, true).map(|_| ())
    })?;

    file.compiled().ok_or_else(|| TemplateError::cycle(file.name()))
}

/// Interpret a macro file so its macros get registered
pub(crate) fn load_macro_file(global: &Arc<GlobalContext>, file: &Arc<File>) -> Result<()> {
    let body = file.syntax_tree()?;
    let ctx = ExecutionContext::root(global.clone(), Some(file.clone()), true);
    eval::render(&body, &ctx)?;
    tracing::debug!(file = file.path(), "loaded macros");
    Ok(())
}

/// `ref(name)`: record the dependency and return what the SQL should say
/// to read from `name`
pub(crate) fn resolve_reference(
    ctx: &Arc<ExecutionContext>,
    name: &str,
    position: &Position,
) -> Result<Value> {
    let global = ctx.global();
    let target = global
        .files()
        .model(name)
        .cloned()
        .ok_or_else(|| TemplateError::eval(position, format!("unknown model `{}`", name)))?;

    let Some(current) = ctx.file() else {
        return Ok(Value::String(global.relation_name(&target)));
    };

    if current.kind() != FileKind::Macro {
        current.add_upstream(target.name());
        target.add_downstream(current.name());
    }

    if !ctx.is_executing() {
        current.mark_needs_recompile();
        return Ok(Value::String(global.relation_name(&target)));
    }

    match global.files().materialization(&target) {
        Materialization::Ephemeral => {
            let sql = compile_ephemeral(global, &target)?;
            let cte = format!("{}{}", EPHEMERAL_PREFIX, target.name());
            current.register_cte(cte.clone(), sql);
            Ok(Value::String(cte))
        }
        _ => Ok(Value::String(global.relation_name(&target))),
    }
}

/// Prefix `sql` with a `WITH` clause for `ctes`, merging into a leading
/// `WITH` of its own
pub fn with_ctes(sql: &str, ctes: &BTreeMap<String, String>) -> String {
    if ctes.is_empty() {
        return sql.to_string();
    }

    let definitions: Vec<String> = ctes
        .iter()
        .map(|(name, body)| format!("{} AS (\n{}\n)", name, body.trim()))
        .collect();
    let definitions = definitions.join(",\n");

    let trimmed = sql.trim_start();
    match leading_with(trimmed) {
        Some(rest) => format!("WITH {},\n{}", definitions, rest),
        None => format!("WITH {}\n{}", definitions, sql),
    }
}

/// The text after a leading `WITH` keyword
fn leading_with(sql: &str) -> Option<&str> {
    let keyword = sql.get(..4)?;
    let rest = &sql[4..];
    let boundary = rest.chars().next().is_some_and(char::is_whitespace);
    (keyword.eq_ignore_ascii_case("with") && boundary).then(|| rest.trim_start())
}
