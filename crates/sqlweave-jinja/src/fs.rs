//! Compiled-unit records and the collection of all units in a project

use crate::ast::Body;
use crate::context::lock;
use crate::error::Result;
use crate::parser::parse_template;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use sqlweave_core::{Materialization, ModelDefaults};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Model,
    Macro,
    Test,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Macro => "macro",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-unit state, written during interpretation
#[derive(Debug, Clone, Default)]
pub struct FileState {
    pub compiled: Option<String>,
    pub config: BTreeMap<String, Value>,
    pub upstreams: BTreeSet<String>,
    pub downstreams: BTreeSet<String>,
    /// Ephemeral CTEs to prepend, by CTE name
    pub ctes: BTreeMap<String, String>,
    /// Set when a dry compile referenced another unit
    pub needs_recompile: bool,
    /// Whether the last compile was an executing one
    pub executed: bool,
}

/// One source unit: a model, macro file or test
pub struct File {
    name: String,
    path: String,
    kind: FileKind,
    source: String,
    syntax: OnceLock<Result<Arc<Body>>>,
    state: Mutex<FileState>,
}

impl File {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        kind: FileKind,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
            source: source.into(),
            syntax: OnceLock::new(),
            state: Mutex::new(FileState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path used in diagnostics
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parsed tree, parsed on first use and shared afterwards
    pub fn syntax_tree(&self) -> Result<Arc<Body>> {
        self.syntax
            .get_or_init(|| parse_template(&self.path, &self.source).map(Arc::new))
            .clone()
    }

    /// Snapshot of the mutable state
    pub fn state(&self) -> FileState {
        lock(&self.state).clone()
    }

    pub fn compiled(&self) -> Option<String> {
        lock(&self.state).compiled.clone()
    }

    pub fn config_value(&self, key: &str) -> Option<Value> {
        lock(&self.state).config.get(key).cloned()
    }

    pub fn set_config(&self, key: impl Into<String>, value: Value) {
        lock(&self.state).config.insert(key.into(), value);
    }

    /// Materialization set by `config(materialized=...)`, if any
    pub fn configured_materialization(&self) -> Option<Materialization> {
        match self.config_value("materialized") {
            Some(Value::String(s)) => Materialization::from_str(&s).ok(),
            _ => None,
        }
    }

    pub fn upstreams(&self) -> BTreeSet<String> {
        lock(&self.state).upstreams.clone()
    }

    pub fn downstreams(&self) -> BTreeSet<String> {
        lock(&self.state).downstreams.clone()
    }

    pub fn add_upstream(&self, name: impl Into<String>) {
        lock(&self.state).upstreams.insert(name.into());
    }

    pub fn add_downstream(&self, name: impl Into<String>) {
        lock(&self.state).downstreams.insert(name.into());
    }

    pub fn register_cte(&self, name: impl Into<String>, sql: impl Into<String>) {
        lock(&self.state).ctes.insert(name.into(), sql.into());
    }

    pub fn ctes(&self) -> BTreeMap<String, String> {
        lock(&self.state).ctes.clone()
    }

    pub fn mark_needs_recompile(&self) {
        lock(&self.state).needs_recompile = true;
    }

    pub fn needs_recompile(&self) -> bool {
        lock(&self.state).needs_recompile
    }

    /// Reset per-compile state before a unit is (re)interpreted. Edges are
    /// kept: a later pass only ever discovers the same or more of them.
    pub(crate) fn begin_compile(&self) {
        let mut state = lock(&self.state);
        state.ctes.clear();
        state.needs_recompile = false;
    }

    pub(crate) fn finish_compile(&self, compiled: String, executed: bool) {
        let mut state = lock(&self.state);
        state.compiled = Some(compiled);
        state.executed = executed;
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileSystemError {
    #[error("duplicate {kind} `{name}` ({first} and {second})")]
    Duplicate {
        kind: FileKind,
        name: String,
        first: String,
        second: String,
    },
}

/// Every unit in a project, looked up by kind and name
#[derive(Default)]
pub struct FileSystem {
    models: BTreeMap<String, Arc<File>>,
    macros: BTreeMap<String, Arc<File>>,
    tests: BTreeMap<String, Arc<File>>,
    defaults: ModelDefaults,
    /// macro name -> defining macro file name
    macro_index: OnceLock<Result<HashMap<String, String>>>,
}

impl FileSystem {
    pub fn new(defaults: ModelDefaults) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    pub fn add(&mut self, file: File) -> std::result::Result<Arc<File>, FileSystemError> {
        let files = match file.kind() {
            FileKind::Model => &mut self.models,
            FileKind::Macro => &mut self.macros,
            FileKind::Test => &mut self.tests,
        };

        if let Some(existing) = files.get(file.name()) {
            return Err(FileSystemError::Duplicate {
                kind: file.kind(),
                name: file.name().to_string(),
                first: existing.path().to_string(),
                second: file.path().to_string(),
            });
        }

        let file = Arc::new(file);
        files.insert(file.name().to_string(), file.clone());
        self.macro_index = OnceLock::new();
        Ok(file)
    }

    pub fn get(&self, kind: FileKind, name: &str) -> Option<&Arc<File>> {
        match kind {
            FileKind::Model => self.models.get(name),
            FileKind::Macro => self.macros.get(name),
            FileKind::Test => self.tests.get(name),
        }
    }

    pub fn model(&self, name: &str) -> Option<&Arc<File>> {
        self.models.get(name)
    }

    pub fn test(&self, name: &str) -> Option<&Arc<File>> {
        self.tests.get(name)
    }

    /// A model or test by name, models first
    pub fn unit(&self, name: &str) -> Option<&Arc<File>> {
        self.models.get(name).or_else(|| self.tests.get(name))
    }

    /// Units of one kind, in name order
    pub fn files(&self, kind: FileKind) -> impl Iterator<Item = &Arc<File>> {
        let files = match kind {
            FileKind::Model => &self.models,
            FileKind::Macro => &self.macros,
            FileKind::Test => &self.tests,
        };
        files.values()
    }

    pub fn len(&self) -> usize {
        self.models.len() + self.macros.len() + self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn defaults(&self) -> &ModelDefaults {
        &self.defaults
    }

    /// Effective materialization: `config()` first, then the project default
    pub fn materialization(&self, file: &File) -> Materialization {
        file.configured_materialization()
            .unwrap_or(self.defaults.materialized)
    }

    /// Project default tags plus those set through `config(tags=...)`
    pub fn tags(&self, file: &File) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = self.defaults.tags.iter().cloned().collect();
        match file.config_value("tags") {
            Some(Value::String(tag)) => {
                tags.insert(tag);
            }
            Some(Value::List(items)) => tags.extend(items.iter().map(Value::as_string)),
            _ => {}
        }
        tags
    }

    /// The macro file defining `macro_name`. Macro files are parsed once to
    /// build the index.
    pub fn macro_file_defining(&self, macro_name: &str) -> Result<Option<Arc<File>>> {
        let index = self
            .macro_index
            .get_or_init(|| {
                let mut index = HashMap::new();
                for file in self.macros.values() {
                    for name in file.syntax_tree()?.macro_names() {
                        index.insert(name, file.name().to_string());
                    }
                }
                Ok(index)
            })
            .as_ref()
            .map_err(Clone::clone)?;

        Ok(index
            .get(macro_name)
            .and_then(|file| self.macros.get(file))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> FileSystem {
        let mut fs = FileSystem::new(ModelDefaults {
            materialized: Materialization::View,
            tags: vec!["nightly".to_string()],
        });
        fs.add(File::new("orders", "models/orders.sql", FileKind::Model, "select 1"))
            .unwrap();
        fs.add(File::new(
            "helpers",
            "macros/helpers.sql",
            FileKind::Macro,
            "{% macro cents(x) %}{{ x }} * 100{% endmacro %}{% macro pct(x) %}{{ x }}%{% endmacro %}",
        ))
        .unwrap();
        fs
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut fs = project();
        let err = fs
            .add(File::new("orders", "models/sub/orders.sql", FileKind::Model, ""))
            .unwrap_err();
        assert!(err.to_string().contains("models/sub/orders.sql"));
    }

    #[test]
    fn macro_index_finds_defining_file() {
        let fs = project();
        let file = fs.macro_file_defining("pct").unwrap().unwrap();
        assert_eq!(file.name(), "helpers");
        assert!(fs.macro_file_defining("missing").unwrap().is_none());
    }

    #[test]
    fn materialization_falls_back_to_default() {
        let fs = project();
        let orders = fs.model("orders").unwrap();
        assert_eq!(fs.materialization(orders), Materialization::View);

        orders.set_config("materialized", Value::from("ephemeral"));
        assert_eq!(fs.materialization(orders), Materialization::Ephemeral);
    }

    #[test]
    fn tags_merge_defaults_and_config() {
        let fs = project();
        let orders = fs.model("orders").unwrap();
        orders.set_config("tags", Value::List(vec![Value::from("finance")]));

        let tags: Vec<String> = fs.tags(orders).into_iter().collect();
        assert_eq!(tags, vec!["finance", "nightly"]);
    }

    #[test]
    fn syntax_tree_is_memoised() {
        let fs = project();
        let orders = fs.model("orders").unwrap();
        let first = orders.syntax_tree().unwrap();
        let second = orders.syntax_tree().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
